//! Command dispatch: configuration, transport wiring and batch bookkeeping.

use crate::cancel::install_ctrlc_handler;
use crate::cli::{BatchArgs, Cli, Command};
use crate::prompt::password_override;
use anyhow::{Context, Result};
use bos_core::config::{Credentials, ToolboxConfig};
use bos_error::{ToolboxResult, EXIT_GENERIC, EXIT_OK};
use bos_transport::{OpenSshTransport, TcpPortWaiter};
use bos_workflow::{install, restore, update, BatchRunner, CancelFlag, WorkflowEnv};
use std::path::Path;

fn load_config(path: Option<&Path>) -> Result<ToolboxConfig> {
    match path {
        Some(path) => {
            let config = ToolboxConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            log::debug!("loaded configuration from {}", path.display());
            Ok(config)
        }
        None => Ok(ToolboxConfig::default()),
    }
}

/// Run every host, write the report and map the outcome to an exit code.
fn run_batch<F>(batch: &BatchArgs, hosts: &[String], cancel: &CancelFlag, per_host: F) -> Result<i32>
where
    F: FnMut(&str) -> ToolboxResult<()>,
{
    let (report, code) = match BatchRunner::new(batch.ignore, cancel).run(hosts, per_host) {
        Ok(report) => {
            let errors = report.error_count();
            if errors > 0 {
                log::error!("{} errors encountered", errors);
                (report, EXIT_GENERIC)
            } else {
                (report, EXIT_OK)
            }
        }
        Err(abort) => {
            let code = abort.error.exit_code();
            (abort.report, code)
        }
    };

    if let Some(path) = &batch.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        log::info!("Report written to {}", path.display());
    }
    Ok(code)
}

pub fn run(cli: &Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    // Arguments and host lists are validated before any handler or connection exists.
    let (hosts, batch, password) = match &cli.command {
        Command::Install(args) => (
            args.batch.hosts(args.host.as_deref())?,
            &args.batch,
            args.install_password.clone(),
        ),
        Command::Uninstall(args) => (args.hosts()?, &args.batch, args.install_password.clone()),
        Command::Update(args) => (
            args.batch.hosts(args.host.as_deref())?,
            &args.batch,
            args.password.clone(),
        ),
    };
    let password = password_override(
        password,
        config.ssh.password.as_deref(),
        batch.batch.is_some(),
    )?;
    let credentials: Credentials = config.credentials().with_password(password);

    let cancel = CancelFlag::new();
    install_ctrlc_handler(&cancel)?;

    let transport = OpenSshTransport::new(config.ssh_options());
    let ports = TcpPortWaiter::new();
    let env = WorkflowEnv {
        transport: &transport,
        ports: &ports,
        config: &config,
        credentials: &credentials,
        cancel: &cancel,
    };

    match &cli.command {
        Command::Install(args) => {
            let plan = args.plan();
            run_batch(batch, &hosts, &cancel, |host| install(&env, host, &plan))
        }
        Command::Uninstall(args) => {
            let plan = args.plan();
            run_batch(batch, &hosts, &cancel, |host| restore(&env, host, &plan))
        }
        Command::Update(_) => run_batch(batch, &hosts, &cancel, |host| update(&env, host)),
    }
}

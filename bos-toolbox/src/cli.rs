//! CLI argument parsing for the toolbox.

use anyhow::{bail, Result};
use bos_core::plan::{BackupRequest, InstallPlan, KeepHostname, PowerLimit, RestorePlan};
use bos_workflow::read_host_list;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bos-toolbox", version)]
#[command(about = "Install, restore and update bOS firmware on mining devices over SSH")]
pub struct Cli {
    /// TOML configuration file (every setting has a default)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replace the factory firmware with bOS
    Install(InstallArgs),

    /// Restore the factory firmware from a backup or a vendor image
    Uninstall(UninstallArgs),

    /// Update bOS on devices already running it
    Update(UpdateArgs),
}

/// Where to run and what to do with failures.
#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// CSV file with one host per line (first column, optional `host` header)
    #[arg(long)]
    pub batch: Option<PathBuf>,

    /// Keep going after a host fails
    #[arg(long)]
    pub ignore: bool,

    /// Write per-host results as JSON when the run ends
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl BatchArgs {
    /// Hosts to process, from either the positional HOST or `--batch`.
    pub fn hosts(&self, host: Option<&str>) -> Result<Vec<String>> {
        match (host, &self.batch) {
            (Some(_), Some(_)) => bail!("Use either HOST or --batch, not both"),
            (None, None) => bail!("Missing HOST or --batch"),
            (Some(host), None) => Ok(vec![host.to_string()]),
            (None, Some(path)) => {
                let hosts = read_host_list(path)?;
                if hosts.is_empty() {
                    bail!("No hosts in {}", path.display());
                }
                Ok(hosts)
            }
        }
    }
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Device address
    pub host: Option<String>,

    #[command(flatten)]
    pub batch: BatchArgs,

    /// Back up the device before installing
    #[arg(long)]
    pub backup: bool,

    /// Back up configuration only, without the storage dump
    #[arg(long, requires = "backup")]
    pub no_nand_backup: bool,

    /// Pool worker name to set
    #[arg(long)]
    pub pool_user: Option<String>,

    /// Power supply limit in watts (0 disables the limit)
    #[arg(long)]
    pub psu_power_limit: Option<u32>,

    /// Do not carry over network settings
    #[arg(long)]
    pub no_keep_network: bool,

    /// Do not carry over pool settings
    #[arg(long)]
    pub no_keep_pools: bool,

    /// Always carry over the hostname
    #[arg(long, conflicts_with = "no_keep_hostname")]
    pub keep_hostname: bool,

    /// Never carry over the hostname
    #[arg(long)]
    pub no_keep_hostname: bool,

    /// Do not wait for the device to come back after the reboot
    #[arg(long)]
    pub no_wait: bool,

    /// Run the install script without flashing, then clean up
    #[arg(long)]
    pub dry_run: bool,

    /// Directory with a stage3.sh to run on first boot
    #[arg(long)]
    pub post_upgrade: Option<PathBuf>,

    /// SSH password of the factory firmware
    #[arg(long)]
    pub install_password: Option<String>,
}

impl InstallArgs {
    pub fn plan(&self) -> InstallPlan {
        InstallPlan {
            keep_network: !self.no_keep_network,
            keep_hostname: KeepHostname::from_flags(self.keep_hostname, self.no_keep_hostname),
            keep_pools: !self.no_keep_pools,
            pool_user: self.pool_user.clone(),
            power_limit: PowerLimit::from_option(self.psu_power_limit),
            dry_run: self.dry_run,
            backup: self.backup.then_some(BackupRequest {
                storage_dump: !self.no_nand_backup,
            }),
            wait_for_reboot: !self.no_wait,
            post_upgrade: self.post_upgrade.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct UninstallArgs {
    /// Device address
    pub host: Option<String>,

    /// Backup directory or tarball made by `install --backup`
    pub backup: Option<PathBuf>,

    #[command(flatten)]
    pub batch: BatchArgs,

    /// Vendor firmware image, local path or http(s) URL
    #[arg(long)]
    pub factory_image: Option<String>,

    /// SSH password of bOS
    #[arg(long)]
    pub install_password: Option<String>,

    /// Do not wait for the device to come back after the reboot
    #[arg(long)]
    pub no_wait: bool,
}

impl UninstallArgs {
    pub fn hosts(&self) -> Result<Vec<String>> {
        // With --batch the first positional can only be a backup path.
        if self.batch.batch.is_some() && (self.host.is_some() || self.backup.is_some()) {
            bail!("Restoring a batch from a custom backup is not supported");
        }
        self.batch.hosts(self.host.as_deref())
    }

    pub fn plan(&self) -> RestorePlan {
        RestorePlan {
            backup: self.backup.clone(),
            factory_image: self.factory_image.clone(),
            wait_for_reboot: !self.no_wait,
        }
    }
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Device address
    pub host: Option<String>,

    #[command(flatten)]
    pub batch: BatchArgs,

    /// SSH password of bOS
    #[arg(short = 'p', long)]
    pub password: Option<String>,
}

//! Installer state machine.
//!
//! `Connected → Compatibility checked → Backed up → System prepared → Staged →
//! Install script run → Rebooted → Verified`, with the backup stage only present when
//! requested and a dry run ending in `Cleaned up` instead of a reboot.

use crate::env::WorkflowEnv;
use crate::reboot;
use crate::stage_runner::{StageDefinition, StageRunner, WorkflowState};
use bos_core::backup::{self, BackupOptions};
use bos_core::device::Device;
use bos_core::hwid;
use bos_core::mode::{is_bos_board, Mode};
use bos_core::plan::InstallPlan;
use bos_core::stage3::{Stage3Payload, STAGE3_ARCHIVE};
use bos_core::staging::{self, TARGET_DIR};
use bos_error::{StopKind, StopPhase, ToolboxError, ToolboxResult, TransportError};
use bos_transport::{CommandOps, Session, SessionGuard};
use chrono::Utc;
use std::path::{Path, PathBuf};

struct InstallState {
    host: String,
    session: Option<SessionGuard>,
    device: Option<Device>,
    backup: Option<PathBuf>,
    current: Option<String>,
    completed: Vec<String>,
}

impl InstallState {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            session: None,
            device: None,
            backup: None,
            current: None,
            completed: Vec::new(),
        }
    }

    fn session(&self) -> ToolboxResult<&dyn Session> {
        self.session
            .as_deref()
            .ok_or_else(|| ToolboxError::Other(format!("not connected to {}", self.host)))
    }

    fn device(&self) -> ToolboxResult<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| ToolboxError::Other(format!("{} was not probed", self.host)))
    }
}

impl WorkflowState for InstallState {
    fn host(&self) -> &str {
        &self.host
    }

    fn set_current(&mut self, stage: &str) {
        self.current = Some(stage.to_string());
    }

    fn mark_completed(&mut self, stage: &str) {
        self.completed.push(stage.to_string());
        self.current = None;
    }
}

fn check_compatibility(device: &Device) -> ToolboxResult<()> {
    if device.mode == Mode::Factory {
        return Ok(());
    }
    let message = match device.board.as_deref() {
        Some(board) if is_bos_board(board) => {
            format!("{} is already running bOS on board {}", device.host, board)
        }
        Some(board) => format!(
            "{} runs an unsupported OpenWrt based firmware (board {})",
            device.host, board
        ),
        None => format!("{} is already running {}", device.host, device.mode),
    };
    Err(ToolboxError::upgrade(StopKind::Prerequisite, message))
}

fn run_install_script(session: &dyn Session, command: &str) -> ToolboxResult<()> {
    log::info!("Running install script on {}...", session.host());
    match session.run_shell(command) {
        Ok(out) => {
            for line in out.stdout.lines() {
                log::info!("{}", line);
            }
            Ok(())
        }
        Err(err @ TransportError::CommandFailed { .. }) => {
            if let Err(cleanup) = staging::cleanup_system(session) {
                log::warn!("cleanup on {} failed: {}", session.host(), cleanup);
            }
            for line in err.stderr().lines() {
                log::error!("{}", line);
            }
            let detail = match err.stderr() {
                "" => err.to_string(),
                stderr => stderr.to_string(),
            };
            Err(ToolboxError::upgrade(
                StopKind::StageFailure,
                format!("Install script failed on {}: {}", session.host(), detail),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

/// Build the post-upgrade archive into `scratch`, if there is anything to ship.
fn prepare_stage3(env: &WorkflowEnv<'_>, plan: &InstallPlan, scratch: &Path) -> ToolboxResult<Option<PathBuf>> {
    let payload = Stage3Payload::resolve(
        &env.config.paths.builtin_post_upgrade(),
        plan.post_upgrade.as_deref(),
    )?;
    match payload {
        Some(payload) => {
            let out = scratch.join(STAGE3_ARCHIVE);
            payload.build(&out)?;
            Ok(Some(out))
        }
        None => Ok(None),
    }
}

/// Install the target firmware on one host.
pub fn install(env: &WorkflowEnv<'_>, host: &str, plan: &InstallPlan) -> ToolboxResult<()> {
    let paths = &env.config.paths;
    log::info!("Installing {} to {}", paths.firmware_version(), host);

    let scratch = tempfile::Builder::new().prefix("bos-install-").tempdir()?;
    let stage3 = prepare_stage3(env, plan, scratch.path())?;
    let hw_id = hwid::generate();

    let mut stages: Vec<StageDefinition<'_, InstallState>> = vec![
        StageDefinition {
            name: "Connected",
            run: Box::new(|state: &mut InstallState, _dry_run| {
                let session = env.connect(&state.host)?;
                let device = Device::probe(&*session)?;
                log::info!("{}: detected {}", state.host, device.mode);
                state.session = Some(session);
                state.device = Some(device);
                Ok(())
            }),
        },
        StageDefinition {
            name: "Compatibility checked",
            run: Box::new(|state: &mut InstallState, _dry_run| check_compatibility(state.device()?)),
        },
    ];

    if let Some(request) = plan.backup {
        stages.push(StageDefinition {
            name: "Backed up",
            run: Box::new(move |state: &mut InstallState, _dry_run| {
                let mac = state.device()?.mac.clone();
                let dest = backup::destination(&paths.backup_root, &mac, Utc::now());
                let opts = BackupOptions {
                    storage_dump: request.storage_dump,
                };
                let set = backup::backup(state.session()?, &mac, &dest, &opts)?;
                state.backup = Some(set.root().to_path_buf());
                Ok(())
            }),
        });
    }

    stages.push(StageDefinition {
        name: "System prepared",
        run: Box::new(|state: &mut InstallState, _dry_run| {
            let session = state.session()?;
            staging::reset_dir(session, TARGET_DIR)?;
            staging::prepare_system(session, &paths.system_dir())
        }),
    });
    stages.push(StageDefinition {
        name: "Staged",
        run: Box::new(|state: &mut InstallState, _dry_run| {
            let session = state.session()?;
            let sent = staging::upload_tree(session, &paths.firmware_dir(), TARGET_DIR)?;
            log::info!("Uploaded {} firmware files to {}", sent, state.host);
            if let Some(archive) = &stage3 {
                let remote = format!("{}/{}", TARGET_DIR, STAGE3_ARCHIVE);
                staging::upload_file(session, archive, &remote)?;
            }
            Ok(())
        }),
    });
    stages.push(StageDefinition {
        name: "Install script run",
        run: Box::new(|state: &mut InstallState, _dry_run| {
            let command = plan.stage1_args(&hw_id).command_line(TARGET_DIR);
            run_install_script(state.session()?, &command)
        }),
    });

    if plan.dry_run {
        stages.push(StageDefinition {
            name: "Cleaned up",
            run: Box::new(|state: &mut InstallState, _dry_run| {
                staging::cleanup_system(state.session()?)?;
                log::info!("Dry run of upgrade on {} was successful", state.host);
                Ok(())
            }),
        });
    } else {
        stages.push(StageDefinition {
            name: "Rebooted",
            run: Box::new(|state: &mut InstallState, _dry_run| {
                reboot::reboot(state.session()?, StopPhase::Upgrade)?;
                if let Some(session) = state.session.take() {
                    if let Err(err) = session.close() {
                        log::debug!("closing {} after reboot: {}", state.host, err);
                    }
                }
                Ok(())
            }),
        });
        stages.push(StageDefinition {
            name: "Verified",
            run: Box::new(|state: &mut InstallState, _dry_run| {
                if !plan.wait_for_reboot {
                    log::info!("Not waiting for {} to come back", state.host);
                    return Ok(());
                }
                let reboot = &env.config.reboot;
                env.wait_for_port(
                    &state.host,
                    reboot.service_port,
                    reboot.install_delay(),
                    StopPhase::Upgrade,
                )?;
                log::info!("Upgrade of {} was successful", state.host);
                Ok(())
            }),
        });
    }

    let mut state = InstallState::new(host);
    let result = StageRunner::new(env.cancel, plan.dry_run).run(&mut state, &stages);
    if let Some(backup) = &state.backup {
        log::info!("Backup of {} kept in {}", host, backup.display());
    }
    result
}

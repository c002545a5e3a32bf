//! Restorer state machine.
//!
//! Sources are resolved and validated locally before any device is touched. A device
//! running the target firmware from internal storage is first switched into recovery
//! mode; recovery and removable-media devices are restored directly.

use crate::env::WorkflowEnv;
use crate::reboot;
use crate::stage_runner::{StageDefinition, StageRunner, WorkflowState};
use bos_core::backup::{BackupSet, CONFIG_ARCHIVE, MARKER_FILE};
use bos_core::device::Device;
use bos_core::factory::{FactoryImage, SUPPORTED_IMAGE_DIGESTS};
use bos_core::mode::{self, Mode};
use bos_core::mtdparts::PartitionLayout;
use bos_core::netconf::{write_config_archive, NetworkConfig};
use bos_core::plan::RestorePlan;
use bos_core::staging::{self, upload_file};
use bos_error::{StopKind, StopPhase, ToolboxError, ToolboxResult, TransportError};
use bos_transport::{shell_quote, CommandOps, Session, SessionGuard};
use std::path::Path;

/// Working directory for vendor image restores.
pub const FACTORY_TARGET_DIR: &str = "/tmp/bitmain_fw";
/// Working directory for storage-dump restores.
pub const DUMP_TARGET_DIR: &str = "/tmp/restore";
pub const RESTORE_SCRIPT: &str = "restore.sh";

enum Source {
    /// Vendor image plus the backup whose configuration should be carried over.
    Factory {
        image: FactoryImage,
        backup: Option<BackupSet>,
    },
    /// Storage dump of a previous backup.
    Dump(BackupSet),
}

struct Resolved {
    source: Source,
    layout: PartitionLayout,
}

fn resolve_sources(plan: &RestorePlan) -> ToolboxResult<Resolved> {
    let backup = plan.backup.as_deref().map(BackupSet::open).transpose()?;
    let layout = match &backup {
        Some(set) => set.layout()?,
        None => PartitionLayout::factory()
            .map_err(|e| ToolboxError::platform(StopKind::Prerequisite, e.to_string()))?,
    };

    let source = match (&plan.factory_image, backup) {
        (Some(image), backup) => Source::Factory {
            image: FactoryImage::open(image, SUPPORTED_IMAGE_DIGESTS)?,
            backup,
        },
        (None, Some(set)) => {
            if !set.has_storage_dump(&layout) {
                return Err(ToolboxError::platform(
                    StopKind::Prerequisite,
                    format!(
                        "Backup '{}' has no storage dump; a factory image is required",
                        set.root().display()
                    ),
                ));
            }
            Source::Dump(set)
        }
        (None, None) => {
            return Err(ToolboxError::restore(
                StopKind::Prerequisite,
                "Backup cannot be found. Use a factory image or provide the path to a previous backup",
            ))
        }
    };
    Ok(Resolved { source, layout })
}

/// Reboot into recovery with `layout` and reconnect. Returns the recovery session.
fn enter_recovery(
    env: &WorkflowEnv<'_>,
    host: &str,
    session: SessionGuard,
    device: &Device,
    layout: &PartitionLayout,
) -> ToolboxResult<SessionGuard> {
    log::info!("Rebooting {} into recovery mode...", host);
    let mtdparts = layout.to_string();
    session.run(&["fw_setenv", "recovery_mtdparts", &mtdparts])?;
    reboot::trigger(&*session, &["miner", "run_recovery"], StopPhase::Restore)?;
    if let Err(err) = session.close() {
        log::debug!("closing {} before recovery: {}", host, err);
    }

    env.wait_for_port(
        host,
        env.config.ssh.port,
        env.config.reboot.restore_delay(),
        StopPhase::Restore,
    )?;
    let recovery = env.reconnect_unverified(host)?;
    let mode = mode::detect(&*recovery);
    log::info!("{}: detected {}", host, mode);
    if mode == Mode::TargetFirmware {
        return Err(ToolboxError::restore(
            StopKind::Prerequisite,
            format!("Could not reboot {} to recovery mode", host),
        ));
    }

    let mac = bos_core::device::read_mac(&*recovery)?;
    if mac != device.mac {
        return Err(ToolboxError::restore(
            StopKind::Prerequisite,
            format!(
                "{} answered with MAC {} after the recovery reboot, expected {}",
                host, mac, device.mac
            ),
        ));
    }
    Ok(recovery)
}

fn run_restore_script(session: &dyn Session, dir: &str, args: &[&str]) -> ToolboxResult<()> {
    let mut line = format!("cd {} && ls -l && /bin/sh {}", shell_quote(dir), RESTORE_SCRIPT);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    log::info!("Restoring firmware on {}...", session.host());
    match session.run_shell(&line) {
        Ok(out) => {
            for line in out.stdout.lines() {
                log::info!("{}", line);
            }
            Ok(())
        }
        Err(err @ TransportError::CommandFailed { .. }) => {
            for line in err.stderr().lines() {
                log::error!("{}", line);
            }
            Err(ToolboxError::platform(
                StopKind::StageFailure,
                format!("Restore script failed on {}: {}", session.host(), err.stderr()),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

fn restore_factory_image(
    session: &dyn Session,
    restore_script: &Path,
    image: &mut FactoryImage,
    backup: Option<&BackupSet>,
    mac: &str,
) -> ToolboxResult<()> {
    let scratch = tempfile::Builder::new().prefix("bos-restore-").tempdir()?;
    let config = match backup.and_then(BackupSet::config_archive) {
        Some(archive) => archive,
        None => {
            log::info!("Creating configuration files...");
            let network = NetworkConfig::query(session, mac)?;
            let out = scratch.path().join(CONFIG_ARCHIVE);
            write_config_archive(&out, mac, &network)?;
            out
        }
    };

    staging::reset_dir(session, FACTORY_TARGET_DIR)?;
    log::info!("Uploading factory image to {}...", session.host());
    {
        let mut channel = session.open_file_channel()?;
        channel.chdir(FACTORY_TARGET_DIR);
        let members = image.upload_members(&mut *channel)?;
        log::debug!("uploaded {} image members", members.len());
    }
    upload_file(session, &config, &format!("{}/{}", FACTORY_TARGET_DIR, CONFIG_ARCHIVE))?;
    upload_file(
        session,
        restore_script,
        &format!("{}/{}", FACTORY_TARGET_DIR, RESTORE_SCRIPT),
    )?;
    run_restore_script(session, FACTORY_TARGET_DIR, &[])
}

fn restore_dump(
    session: &dyn Session,
    restore_script: &Path,
    set: &BackupSet,
    layout: &PartitionLayout,
) -> ToolboxResult<()> {
    staging::reset_dir(session, DUMP_TARGET_DIR)?;
    log::info!("Uploading backup to {}...", session.host());
    let remote = |name: &str| format!("{}/{}", DUMP_TARGET_DIR, name);
    upload_file(session, &set.marker(), &remote(MARKER_FILE))?;
    if let Some(config) = set.config_archive() {
        upload_file(session, &config, &remote(CONFIG_ARCHIVE))?;
    }
    for name in layout.names() {
        upload_file(
            session,
            &set.dump_path(name),
            &remote(&PartitionLayout::dump_file(name)),
        )?;
    }
    upload_file(session, restore_script, &remote(RESTORE_SCRIPT))?;
    run_restore_script(session, DUMP_TARGET_DIR, &[&layout.to_string()])
}

struct RestoreState {
    host: String,
    source: Source,
    session: Option<SessionGuard>,
    device: Option<Device>,
    current: Option<String>,
    completed: Vec<String>,
}

impl RestoreState {
    fn new(host: &str, source: Source) -> Self {
        Self {
            host: host.to_string(),
            source,
            session: None,
            device: None,
            current: None,
            completed: Vec::new(),
        }
    }

    fn not_connected(&self) -> ToolboxError {
        ToolboxError::Other(format!("not connected to {}", self.host))
    }

    fn device(&self) -> ToolboxResult<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| ToolboxError::Other(format!("{} was not probed", self.host)))
    }
}

impl WorkflowState for RestoreState {
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

/// Restore one host to its vendor firmware.
pub fn restore(env: &WorkflowEnv<'_>, host: &str, plan: &RestorePlan) -> ToolboxResult<()> {
    let restore_script = env.config.paths.restore_script();
    if !restore_script.is_file() {
        return Err(ToolboxError::Other(format!(
            "Missing restore script {}",
            restore_script.display()
        )));
    }
    let Resolved { source, layout } = resolve_sources(plan)?;

    let stages: Vec<StageDefinition<'_, RestoreState>> = vec![
        StageDefinition {
            name: "Connected",
            run: Box::new(|state: &mut RestoreState, _dry_run| {
                let session = env.connect(&state.host)?;
                let device = Device::probe(&*session)?;
                log::info!("{}: detected {}", state.host, device.mode);
                if let Source::Factory {
                    backup: Some(set), ..
                }
                | Source::Dump(set) = &state.source
                {
                    if let Some(mac) = set.mac().filter(|m| *m != device.mac) {
                        log::warn!(
                            "Backup was taken from {} but {} reports {}",
                            mac,
                            state.host,
                            device.mac
                        );
                    }
                }
                state.session = Some(session);
                state.device = Some(device);
                Ok(())
            }),
        },
        StageDefinition {
            name: "Recovery entered",
            run: Box::new(|state: &mut RestoreState, _dry_run| {
                let mode = state.device()?.mode;
                match mode {
                    Mode::Factory => Err(ToolboxError::restore(
                        StopKind::Prerequisite,
                        format!("{} is already running factory firmware", state.host),
                    )),
                    Mode::TargetFirmware => {
                        let session = state.session.take().ok_or_else(|| state.not_connected())?;
                        let recovery =
                            enter_recovery(env, &state.host, session, state.device()?, &layout)?;
                        state.session = Some(recovery);
                        Ok(())
                    }
                    Mode::Recovery | Mode::RemovableMedia => Ok(()),
                }
            }),
        },
        StageDefinition {
            name: "Restored",
            run: Box::new(|state: &mut RestoreState, _dry_run| {
                let not_connected = state.not_connected();
                let mac = state.device()?.mac.clone();
                let RestoreState {
                    source,
                    session,
                    ..
                } = state;
                let session = session.as_deref().ok_or(not_connected)?;
                match source {
                    Source::Factory { image, backup } => {
                        restore_factory_image(session, &restore_script, image, backup.as_ref(), &mac)
                    }
                    Source::Dump(set) => restore_dump(session, &restore_script, set, &layout),
                }
            }),
        },
        StageDefinition {
            name: "Rebooted",
            run: Box::new(|state: &mut RestoreState, _dry_run| {
                let session = state.session.take().ok_or_else(|| state.not_connected())?;
                reboot::reboot(&*session, StopPhase::Restore)?;
                if let Err(err) = session.close() {
                    log::debug!("closing {} after reboot: {}", state.host, err);
                }
                Ok(())
            }),
        },
        StageDefinition {
            name: "Verified",
            run: Box::new(|state: &mut RestoreState, _dry_run| {
                if plan.wait_for_reboot {
                    let reboot = &env.config.reboot;
                    env.wait_for_port(
                        &state.host,
                        reboot.service_port,
                        reboot.restore_delay(),
                        StopPhase::Restore,
                    )?;
                }
                log::info!("Restore of {} was successful", state.host);
                Ok(())
            }),
        },
    ];

    let mut state = RestoreState::new(host, source);
    StageRunner::new(env.cancel, false).run(&mut state, &stages)
}

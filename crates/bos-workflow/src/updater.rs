//! In-place firmware update through the package manager.

use crate::env::WorkflowEnv;
use bos_core::config::PACKAGE_LOCK_SETTLE;
use bos_error::{StopKind, ToolboxError, ToolboxResult, TransportError};
use bos_transport::{CommandOps, Session};
use std::thread::sleep;

fn opkg(session: &dyn Session, argv: &[&str]) -> ToolboxResult<()> {
    match session.run(argv) {
        Ok(out) => {
            for line in out.stdout.lines() {
                log::info!("{}", line);
            }
            Ok(())
        }
        // Installing the firmware package reboots the device.
        Err(TransportError::ConnectionLost { .. }) => {
            log::info!("{} dropped the connection, firmware is rebooting", session.host());
            Ok(())
        }
        Err(err @ TransportError::CommandFailed { .. }) if !err.stderr().is_empty() => {
            for line in err.stderr().lines() {
                log::error!("{}", line);
            }
            Err(ToolboxError::upgrade(
                StopKind::StageFailure,
                format!("{} failed on {}: {}", argv.join(" "), session.host(), err.stderr()),
            ))
        }
        Err(err @ TransportError::CommandFailed { .. }) => {
            log::warn!("{}: {}", session.host(), err);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Update a host that already runs the target firmware to the latest package.
pub fn update(env: &WorkflowEnv<'_>, host: &str) -> ToolboxResult<()> {
    let session = env.connect(host)?;
    log::info!("Updating package lists on {}...", host);
    opkg(&*session, &["opkg", "update"])?;
    sleep(PACKAGE_LOCK_SETTLE);
    env.cancel.check()?;
    log::info!("Installing firmware package on {}...", host);
    opkg(&*session, &["opkg", "install", "firmware"])?;
    if let Err(err) = session.close() {
        log::debug!("closing {}: {}", host, err);
    }
    log::info!("Update of {} was successful", host);
    Ok(())
}

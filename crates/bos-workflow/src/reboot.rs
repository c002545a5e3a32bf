use bos_error::{StopKind, StopPhase, ToolboxError, ToolboxResult, TransportError};
use bos_transport::{CommandOps, Session};

pub const REBOOT_COMMAND: &str = "/sbin/reboot";

/// Issue a command that is expected to take the connection down (reboot, recovery
/// switch). A dropped connection is the success signal; a non-zero exit with no
/// diagnostics is tolerated, one with diagnostics is a stop in `phase`.
pub fn trigger(session: &dyn Session, argv: &[&str], phase: StopPhase) -> ToolboxResult<()> {
    match session.run(argv) {
        Ok(_) => Ok(()),
        Err(TransportError::ConnectionLost { .. }) => {
            log::debug!("{}: connection dropped after {}", session.host(), argv.join(" "));
            Ok(())
        }
        Err(err @ TransportError::CommandFailed { .. }) if err.stderr().is_empty() => {
            log::warn!("{}: {} returned {}", session.host(), argv.join(" "), err);
            Ok(())
        }
        Err(err @ TransportError::CommandFailed { .. }) => Err(ToolboxError::stop(
            phase,
            StopKind::StageFailure,
            format!("{} failed: {}", argv.join(" "), err.stderr()),
        )),
        Err(err) => Err(err.into()),
    }
}

pub fn reboot(session: &dyn Session, phase: StopPhase) -> ToolboxResult<()> {
    log::info!("Rebooting {}...", session.host());
    trigger(session, &[REBOOT_COMMAND], phase)
}

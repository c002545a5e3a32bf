use crate::cancel::CancelFlag;
use bos_core::config::{Credentials, ToolboxConfig};
use bos_error::{StopKind, StopPhase, ToolboxError, ToolboxResult, TransportError};
use bos_transport::{connect_scoped, DelayRange, PortWaiter, SessionGuard, Transport};

/// Everything a per-host workflow needs from the outside world.
///
/// Built once by the caller and shared read-only by every host of a batch.
#[derive(Clone, Copy)]
pub struct WorkflowEnv<'a> {
    pub transport: &'a dyn Transport,
    pub ports: &'a dyn PortWaiter,
    pub config: &'a ToolboxConfig,
    pub credentials: &'a Credentials,
    pub cancel: &'a CancelFlag,
}

impl<'a> WorkflowEnv<'a> {
    /// Open a guarded session using the configured host-key policy.
    pub fn connect(&self, host: &str) -> ToolboxResult<SessionGuard> {
        log::info!("Connecting to {}...", host);
        let target = self
            .credentials
            .target(host, self.config.ssh.verify_host_keys);
        Ok(connect_scoped(self.transport, &target)?)
    }

    /// Reconnect after a reboot into recovery mode, which presents new host keys.
    pub fn reconnect_unverified(&self, host: &str) -> ToolboxResult<SessionGuard> {
        log::info!("Connecting to {} (host keys not verified)...", host);
        let target = self.credentials.target(host, false);
        Ok(connect_scoped(self.transport, &target)?)
    }

    /// Wait for `host:port` after a reboot. An exhausted window is a stop in `phase`.
    pub fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        delay: DelayRange,
        phase: StopPhase,
    ) -> ToolboxResult<()> {
        self.cancel.check()?;
        match self
            .ports
            .wait_for_port(host, port, delay, self.config.reboot.timeout())
        {
            Ok(()) => Ok(()),
            Err(err @ TransportError::PortTimeout { .. }) => {
                log::error!("{}", err);
                Err(ToolboxError::stop(
                    phase,
                    StopKind::StageFailure,
                    format!("{} did not come back after reboot: {}", host, err),
                ))
            }
            Err(err) => Err(err.into()),
        }
    }
}

use super::{ConnectTarget, Session, Transport};
use crate::TransportResult;
use std::ops::{Deref, DerefMut};

/// RAII guard that closes a session when dropped, so a host's connection is released on
/// every exit path before the next host is attempted.
pub struct SessionGuard {
    session: Option<Box<dyn Session>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Close explicitly and surface the error instead of logging it.
    pub fn close(mut self) -> TransportResult<()> {
        match self.session.take() {
            Some(mut session) => session.close(),
            None => Ok(()),
        }
    }
}

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .unwrap_or_else(|| unreachable!("session guard used after close"))
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("session guard used after close"))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let host = session.host().to_string();
            if let Err(err) = session.close() {
                log::warn!("session guard failed to close connection to {}: {}", host, err);
            }
        }
    }
}

/// Connect and wrap the session in a [`SessionGuard`].
pub fn connect_scoped(
    transport: &dyn Transport,
    target: &ConnectTarget,
) -> TransportResult<SessionGuard> {
    log::debug!(
        "connecting to {}@{} (verify host keys: {})",
        target.username,
        target.host,
        target.verify_host_keys
    );
    Ok(SessionGuard::new(transport.connect(target)?))
}

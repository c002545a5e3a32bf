//! Error types shared by every bOS toolbox crate.
//!
//! Transport failures and domain stops are kept apart: a `TransportError` says the
//! wire broke, a `DomainStop` says the engine decided a host must not be touched any
//! further. The binary maps both onto process exit codes.

use std::fmt;
use std::io;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;
pub type ToolboxResult<T> = Result<T, ToolboxError>;

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for generic failures, transport errors and user interrupt.
pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_UPGRADE_STOP: i32 = 2;
pub const EXIT_RESTORE_STOP: i32 = 3;
pub const EXIT_PLATFORM_STOP: i32 = 4;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unable to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Connection to {host} lost")]
    ConnectionLost { host: String },

    #[error("Remote command failed: {command} (exit={code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Remote command timed out: {command} after {timeout_secs}s")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("File transfer failed for {path}: {reason}")]
    FileTransfer { path: String, reason: String },

    #[error("Port {port} on {host} did not become reachable within {timeout_secs}s")]
    PortTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Stderr text of a failed remote command, trimmed. Empty for other variants.
    pub fn stderr(&self) -> &str {
        match self {
            TransportError::CommandFailed { stderr, .. } => stderr.trim(),
            _ => "",
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }
}

/// Which part of the tool decided to stop. Drives the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopPhase {
    Upgrade,
    Restore,
    Platform,
}

impl StopPhase {
    pub fn exit_code(self) -> i32 {
        match self {
            StopPhase::Upgrade => EXIT_UPGRADE_STOP,
            StopPhase::Restore => EXIT_RESTORE_STOP,
            StopPhase::Platform => EXIT_PLATFORM_STOP,
        }
    }
}

impl fmt::Display for StopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopPhase::Upgrade => write!(f, "upgrade"),
            StopPhase::Restore => write!(f, "restore"),
            StopPhase::Platform => write!(f, "platform"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopKind {
    /// A remote command exited non-zero with diagnostic output.
    StageFailure,
    /// A precondition does not hold (wrong firmware, missing backup, bad digest, ...).
    Prerequisite,
    /// Something staging expected to be absent already exists on the device.
    Conflict,
    /// The pre-mutation backup could not be completed.
    BackupFailed,
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopKind::StageFailure => "stage failure",
            StopKind::Prerequisite => "prerequisite violation",
            StopKind::Conflict => "conflict",
            StopKind::BackupFailed => "backup failed",
        };
        f.write_str(name)
    }
}

/// Clean "abort this host" signal raised by the installer/restorer state machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{phase} stop ({kind}): {message}")]
pub struct DomainStop {
    pub phase: StopPhase,
    pub kind: StopKind,
    pub message: String,
}

impl DomainStop {
    pub fn new(phase: StopPhase, kind: StopKind, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid partition table description {input:?}: {reason}")]
pub struct ParseError {
    pub input: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum ToolboxError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stop(#[from] DomainStop),

    #[error("Operation interrupted by user")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl ToolboxError {
    pub fn stop(phase: StopPhase, kind: StopKind, message: impl Into<String>) -> Self {
        ToolboxError::Stop(DomainStop::new(phase, kind, message))
    }

    pub fn upgrade(kind: StopKind, message: impl Into<String>) -> Self {
        Self::stop(StopPhase::Upgrade, kind, message)
    }

    pub fn restore(kind: StopKind, message: impl Into<String>) -> Self {
        Self::stop(StopPhase::Restore, kind, message)
    }

    pub fn platform(kind: StopKind, message: impl Into<String>) -> Self {
        Self::stop(StopPhase::Platform, kind, message)
    }

    /// Phase tag of a domain stop; `None` for transport, I/O and interrupt errors.
    pub fn phase(&self) -> Option<StopPhase> {
        match self {
            ToolboxError::Stop(stop) => Some(stop.phase),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<StopKind> {
        match self {
            ToolboxError::Stop(stop) => Some(stop.kind),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ToolboxError::Stop(stop) => stop.phase.exit_code(),
            ToolboxError::Transport(_)
            | ToolboxError::Interrupted
            | ToolboxError::Io(_)
            | ToolboxError::Other(_) => EXIT_GENERIC,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, ToolboxError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_phases_map_to_distinct_exit_codes() {
        let codes = [
            ToolboxError::upgrade(StopKind::Prerequisite, "x").exit_code(),
            ToolboxError::restore(StopKind::Prerequisite, "x").exit_code(),
            ToolboxError::platform(StopKind::Conflict, "x").exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4]);
    }

    #[test]
    fn transport_and_interrupt_are_generic_failures() {
        let lost = ToolboxError::from(TransportError::ConnectionLost {
            host: "10.0.0.5".into(),
        });
        assert_eq!(lost.exit_code(), EXIT_GENERIC);
        assert_eq!(ToolboxError::Interrupted.exit_code(), EXIT_GENERIC);
        assert!(lost.phase().is_none());
    }

    #[test]
    fn stderr_is_only_reported_for_failed_commands() {
        let failed = TransportError::CommandFailed {
            command: "opkg install firmware".into(),
            code: Some(255),
            stdout: String::new(),
            stderr: "  lock held\n".into(),
        };
        assert_eq!(failed.stderr(), "lock held");
        assert_eq!(
            TransportError::ConnectionLost { host: "h".into() }.stderr(),
            ""
        );
    }

    #[test]
    fn domain_stop_display_carries_phase_and_kind() {
        let stop = DomainStop::new(StopPhase::Restore, StopKind::Prerequisite, "no backup");
        assert_eq!(
            stop.to_string(),
            "restore stop (prerequisite violation): no backup"
        );
    }
}

//! Transport trait definitions and implementations.
//!
//! This module defines the seams between the orchestration engine and a device: a
//! [`Transport`] opens a [`Session`], a session runs commands and opens a
//! [`FileChannel`], and a [`PortWaiter`] watches a rebooting device come back. Both a
//! real (OpenSSH) and a fake (recording) implementation are provided.

pub mod fake;
pub mod guards;
pub mod openssh;
pub mod port;

pub use fake::{FakeDevice, FakeResponse, FakeTransport, Operation};
pub use guards::{connect_scoped, SessionGuard};
pub use openssh::{OpenSshOptions, OpenSshTransport};
pub use port::TcpPortWaiter;

use crate::TransportResult;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

/// Who to connect to and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    /// Host-key verification. Turned off only for the reconnection after a reboot into
    /// recovery mode, which legitimately presents different host keys for the same MAC.
    pub verify_host_keys: bool,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password,
            verify_host_keys: true,
        }
    }

    pub fn without_host_key_verification(mut self) -> Self {
        self.verify_host_keys = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// First line of stdout without surrounding whitespace.
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

/// Remote command execution. Non-zero exit maps to `TransportError::CommandFailed`.
pub trait CommandOps {
    /// Run an argv; every argument is shell-quoted.
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput>;

    /// Run a raw shell line (needed for `cd … && …` chains).
    fn run_shell(&self, command: &str) -> TransportResult<CommandOutput>;

    /// Run an argv and stream its stdout into `out`. Returns the number of bytes written.
    fn run_to_writer(&self, argv: &[&str], out: &mut dyn Write) -> TransportResult<u64>;
}

/// Transfer progress callback: `(transferred, total)`. `total` is 0 when unknown.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// File transfer channel bound to a session.
pub trait FileChannel {
    fn chdir(&mut self, dir: &str);

    fn cwd(&self) -> Option<&str>;

    fn put_reader(
        &mut self,
        reader: &mut dyn Read,
        size: u64,
        remote: &str,
        progress: ProgressFn<'_>,
    ) -> TransportResult<()>;

    fn get(&mut self, remote: &str, local: &Path, progress: ProgressFn<'_>) -> TransportResult<u64>;

    fn put(&mut self, local: &Path, remote: &str, progress: ProgressFn<'_>) -> TransportResult<()> {
        let mut file = File::open(local)?;
        let size = file.metadata()?.len();
        self.put_reader(&mut file, size, remote, progress)
    }
}

/// One open connection to a device.
pub trait Session: CommandOps {
    fn host(&self) -> &str;

    fn open_file_channel(&self) -> TransportResult<Box<dyn FileChannel + '_>>;

    /// Release the connection. Calling it twice is a no-op.
    fn close(&mut self) -> TransportResult<()>;
}

pub trait Transport {
    fn connect(&self, target: &ConnectTarget) -> TransportResult<Box<dyn Session>>;
}

/// Inclusive range a jittered delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn from_secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min.min(max)),
            max: Duration::from_secs(max.max(min)),
        }
    }
}

/// Waits for a TCP service to become reachable after a reboot.
pub trait PortWaiter {
    fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        delay: DelayRange,
        timeout: Duration,
    ) -> TransportResult<()>;
}

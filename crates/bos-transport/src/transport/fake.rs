//! Fake transport for testing.
//!
//! Devices are simulated with an in-memory filesystem and scripted command responses.
//! Every connection, command, transfer and port wait is recorded so tests can assert on
//! exactly what the orchestration engine did to which host.

use super::{
    CommandOps, CommandOutput, ConnectTarget, DelayRange, FileChannel, PortWaiter, ProgressFn,
    Session, Transport,
};
use crate::quote::resolve_remote;
use crate::{TransportError, TransportResult};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect { host: String, verify_host_keys: bool },
    ConnectFailed { host: String },
    Run { host: String, command: String },
    Upload { host: String, path: String, size: u64 },
    Download { host: String, path: String },
    Chdir { host: String, dir: String },
    Close { host: String },
    WaitForPort { host: String, port: u16 },
}

impl Operation {
    pub fn host(&self) -> &str {
        match self {
            Operation::Connect { host, .. }
            | Operation::Run { host, .. }
            | Operation::Upload { host, .. }
            | Operation::Download { host, .. }
            | Operation::Chdir { host, .. }
            | Operation::ConnectFailed { host }
            | Operation::Close { host }
            | Operation::WaitForPort { host, .. } => host,
        }
    }
}

/// Scripted answer to a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeResponse {
    Output { stdout: String, stderr: String },
    Fail { code: i32, stderr: String },
    /// The command takes the connection down with it (reboot, firmware flash).
    DropConnection,
}

impl FakeResponse {
    pub fn ok() -> Self {
        Self::stdout("")
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        FakeResponse::Output {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        FakeResponse::Fail {
            code,
            stderr: stderr.into(),
        }
    }
}

/// In-memory remote filesystem. Links are stored as `-> target`.
#[derive(Debug, Clone, Default)]
pub struct FakeFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl FakeFs {
    pub fn set(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.files.contains_key(path) || self.files.keys().any(|k| k.starts_with(&dir))
    }

    /// Remove a path and everything below it.
    pub fn remove(&mut self, path: &str) {
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.files.retain(|k, _| k != path && !k.starts_with(&dir));
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        let dir = format!("{}/", from.trim_end_matches('/'));
        let moved: Vec<(String, Vec<u8>)> = self
            .files
            .iter()
            .filter(|(k, _)| k.as_str() == from || k.starts_with(&dir))
            .map(|(k, v)| (format!("{}{}", to, &k[from.len()..]), v.clone()))
            .collect();
        if moved.is_empty() {
            return false;
        }
        self.remove(from);
        self.files.extend(moved);
        true
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

type Effect = Box<dyn Fn(&mut FakeFs) + Send>;

struct Rule {
    pattern: String,
    response: FakeResponse,
    effect: Option<Effect>,
    remaining: Option<usize>,
}

/// A simulated device. Rules are matched in insertion order against the command line
/// (substring match); unmatched commands fall back to a few built-in shell semantics.
#[derive(Default)]
pub struct FakeDevice {
    fs: FakeFs,
    rules: Vec<Rule>,
    unreachable: bool,
    never_returns: bool,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.fs.set(path, contents);
        self
    }

    pub fn on_command(mut self, pattern: impl Into<String>, response: FakeResponse) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            response,
            effect: None,
            remaining: None,
        });
        self
    }

    /// Like [`FakeDevice::on_command`] but the rule only fires once.
    pub fn on_command_once(mut self, pattern: impl Into<String>, response: FakeResponse) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            response,
            effect: None,
            remaining: Some(1),
        });
        self
    }

    /// Respond and mutate the device filesystem, e.g. to model a reboot into recovery.
    pub fn on_command_with(
        mut self,
        pattern: impl Into<String>,
        response: FakeResponse,
        effect: impl Fn(&mut FakeFs) + Send + 'static,
    ) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            response,
            effect: Some(Box::new(effect)),
            remaining: None,
        });
        self
    }

    /// Refuse every connection attempt.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Never come back after a reboot: port waits time out.
    pub fn never_returns(mut self) -> Self {
        self.never_returns = true;
        self
    }

    fn respond(&mut self, command: &str, argv: Option<&[&str]>) -> FakeResponse {
        let FakeDevice { fs, rules, .. } = self;
        let rule = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && command.contains(r.pattern.as_str()));
        if let Some(rule) = rule {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            if let Some(effect) = &rule.effect {
                effect(fs);
            }
            return rule.response.clone();
        }
        match argv {
            Some(argv) => builtin(fs, argv),
            None => FakeResponse::ok(),
        }
    }
}

fn builtin(fs: &mut FakeFs, argv: &[&str]) -> FakeResponse {
    match argv {
        ["cat", path] => match fs.get(path) {
            Some(bytes) => FakeResponse::stdout(String::from_utf8_lossy(bytes)),
            None => FakeResponse::fail(
                1,
                format!("cat: can't open '{}': No such file or directory", path),
            ),
        },
        ["test", "-e", path] => exit_status(fs.contains(path)),
        ["test", "!", "-e", path] => exit_status(!fs.contains(path)),
        ["rm", rest @ ..] => {
            if let Some(path) = rest.iter().rev().find(|a| !a.starts_with('-')) {
                fs.remove(path);
            }
            FakeResponse::ok()
        }
        ["mv", from, to] => {
            if fs.rename(from, to) {
                FakeResponse::ok()
            } else {
                FakeResponse::fail(1, format!("mv: can't rename '{}': No such file or directory", from))
            }
        }
        ["ln", "-fs", target, link] => {
            fs.set(*link, format!("-> {}", target));
            FakeResponse::ok()
        }
        _ => FakeResponse::ok(),
    }
}

fn exit_status(success: bool) -> FakeResponse {
    if success {
        FakeResponse::ok()
    } else {
        FakeResponse::fail(1, "")
    }
}

#[derive(Default)]
struct World {
    devices: BTreeMap<String, FakeDevice>,
    operations: Vec<Operation>,
}

fn lock(world: &Mutex<World>) -> MutexGuard<'_, World> {
    match world.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fake transport that hands out sessions to [`FakeDevice`]s and records everything.
#[derive(Clone, Default)]
pub struct FakeTransport {
    world: Arc<Mutex<World>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, host: impl Into<String>, device: FakeDevice) -> Self {
        lock(&self.world).devices.insert(host.into(), device);
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.world).operations.clone()
    }

    /// Command lines run on `host`, in order.
    pub fn commands(&self, host: &str) -> Vec<String> {
        lock(&self.world)
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Run { host: h, command } if h == host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn ran(&self, host: &str, needle: &str) -> bool {
        self.commands(host).iter().any(|c| c.contains(needle))
    }

    /// Host-key verification flag of every connection made to `host`.
    pub fn connections(&self, host: &str) -> Vec<bool> {
        lock(&self.world)
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Connect {
                    host: h,
                    verify_host_keys,
                } if h == host => Some(*verify_host_keys),
                _ => None,
            })
            .collect()
    }

    /// Hosts a connection was attempted to, in first-attempt order.
    pub fn hosts_attempted(&self) -> Vec<String> {
        let world = lock(&self.world);
        let mut hosts: Vec<String> = Vec::new();
        for op in &world.operations {
            if let Operation::Connect { host, .. } | Operation::ConnectFailed { host } = op {
                if !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    /// Sessions opened minus sessions closed.
    pub fn open_sessions(&self) -> usize {
        let world = lock(&self.world);
        let opened = world
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Connect { .. }))
            .count();
        let closed = world
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Close { .. }))
            .count();
        opened.saturating_sub(closed)
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.world)
            .devices
            .get(host)
            .and_then(|d| d.fs.get(path).map(<[u8]>::to_vec))
    }

    pub fn has_path(&self, host: &str, path: &str) -> bool {
        lock(&self.world)
            .devices
            .get(host)
            .map(|d| d.fs.contains(path))
            .unwrap_or(false)
    }

    /// Every path currently present on `host`.
    pub fn paths(&self, host: &str) -> Vec<String> {
        lock(&self.world)
            .devices
            .get(host)
            .map(|d| d.fs.paths())
            .unwrap_or_default()
    }

    pub fn uploads(&self, host: &str) -> Vec<String> {
        lock(&self.world)
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Upload { host: h, path, .. } if h == host => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Operation) {
        lock(&self.world).operations.push(op);
    }
}

impl Transport for FakeTransport {
    fn connect(&self, target: &ConnectTarget) -> TransportResult<Box<dyn Session>> {
        let mut world = lock(&self.world);
        let reachable = world
            .devices
            .get(&target.host)
            .map(|d| !d.unreachable)
            .unwrap_or(false);
        if !reachable {
            world.operations.push(Operation::ConnectFailed {
                host: target.host.clone(),
            });
            return Err(TransportError::Connect {
                host: target.host.clone(),
                reason: "No route to host".to_string(),
            });
        }
        world.operations.push(Operation::Connect {
            host: target.host.clone(),
            verify_host_keys: target.verify_host_keys,
        });
        Ok(Box::new(FakeSession {
            transport: self.clone(),
            host: target.host.clone(),
            lost: Cell::new(false),
            closed: false,
        }))
    }
}

impl PortWaiter for FakeTransport {
    fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        _delay: DelayRange,
        timeout: Duration,
    ) -> TransportResult<()> {
        let mut world = lock(&self.world);
        world.operations.push(Operation::WaitForPort {
            host: host.to_string(),
            port,
        });
        let returns = world
            .devices
            .get(host)
            .map(|d| !d.never_returns)
            .unwrap_or(false);
        if returns {
            Ok(())
        } else {
            Err(TransportError::PortTimeout {
                host: host.to_string(),
                port,
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

struct FakeSession {
    transport: FakeTransport,
    host: String,
    lost: Cell<bool>,
    closed: bool,
}

impl FakeSession {
    fn dispatch(&self, command: &str, argv: Option<&[&str]>) -> TransportResult<CommandOutput> {
        if self.lost.get() {
            return Err(self.connection_lost());
        }
        let response = {
            let mut world = lock(&self.transport.world);
            world.operations.push(Operation::Run {
                host: self.host.clone(),
                command: command.to_string(),
            });
            match world.devices.get_mut(&self.host) {
                Some(device) => device.respond(command, argv),
                None => FakeResponse::DropConnection,
            }
        };
        match response {
            FakeResponse::Output { stdout, stderr } => Ok(CommandOutput { stdout, stderr }),
            FakeResponse::Fail { code, stderr } => Err(TransportError::CommandFailed {
                command: command.to_string(),
                code: Some(code),
                stdout: String::new(),
                stderr,
            }),
            FakeResponse::DropConnection => {
                self.lost.set(true);
                Err(self.connection_lost())
            }
        }
    }

    fn connection_lost(&self) -> TransportError {
        TransportError::ConnectionLost {
            host: self.host.clone(),
        }
    }

    fn with_fs<T>(&self, f: impl FnOnce(&mut FakeFs) -> T) -> Option<T> {
        let mut world = lock(&self.transport.world);
        world.devices.get_mut(&self.host).map(|d| f(&mut d.fs))
    }
}

impl CommandOps for FakeSession {
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput> {
        self.dispatch(&argv.join(" "), Some(argv))
    }

    fn run_shell(&self, command: &str) -> TransportResult<CommandOutput> {
        self.dispatch(command, None)
    }

    fn run_to_writer(&self, argv: &[&str], out: &mut dyn Write) -> TransportResult<u64> {
        if let ["cat", path] = argv {
            if self.lost.get() {
                return Err(self.connection_lost());
            }
            self.transport.record(Operation::Run {
                host: self.host.clone(),
                command: argv.join(" "),
            });
            let bytes = self.with_fs(|fs| fs.get(path).map(<[u8]>::to_vec)).flatten();
            return match bytes {
                Some(bytes) => {
                    out.write_all(&bytes)?;
                    Ok(bytes.len() as u64)
                }
                None => Err(TransportError::CommandFailed {
                    command: argv.join(" "),
                    code: Some(1),
                    stdout: String::new(),
                    stderr: format!("cat: can't open '{}': No such file or directory", path),
                }),
            };
        }
        let output = self.run(argv)?;
        out.write_all(output.stdout.as_bytes())?;
        Ok(output.stdout.len() as u64)
    }
}

impl Session for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn open_file_channel(&self) -> TransportResult<Box<dyn FileChannel + '_>> {
        if self.lost.get() {
            return Err(self.connection_lost());
        }
        Ok(Box::new(FakeFileChannel {
            session: self,
            cwd: None,
        }))
    }

    fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.closed = true;
            self.transport.record(Operation::Close {
                host: self.host.clone(),
            });
        }
        Ok(())
    }
}

struct FakeFileChannel<'a> {
    session: &'a FakeSession,
    cwd: Option<String>,
}

impl FileChannel for FakeFileChannel<'_> {
    fn chdir(&mut self, dir: &str) {
        let dir = resolve_remote(self.cwd.as_deref(), dir);
        self.session.transport.record(Operation::Chdir {
            host: self.session.host.clone(),
            dir: dir.clone(),
        });
        self.cwd = Some(dir);
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn put_reader(
        &mut self,
        reader: &mut dyn Read,
        _size: u64,
        remote: &str,
        progress: ProgressFn<'_>,
    ) -> TransportResult<()> {
        if self.session.lost.get() {
            return Err(self.session.connection_lost());
        }
        let path = resolve_remote(self.cwd.as_deref(), remote);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let size = bytes.len() as u64;
        self.session.transport.record(Operation::Upload {
            host: self.session.host.clone(),
            path: path.clone(),
            size,
        });
        self.session.with_fs(|fs| fs.set(path, bytes));
        progress(size, size);
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path, progress: ProgressFn<'_>) -> TransportResult<u64> {
        let path = resolve_remote(self.cwd.as_deref(), remote);
        self.session.transport.record(Operation::Download {
            host: self.session.host.clone(),
            path: path.clone(),
        });
        let bytes = self
            .session
            .with_fs(|fs| fs.get(&path).map(<[u8]>::to_vec))
            .flatten()
            .ok_or_else(|| TransportError::FileTransfer {
                path: path.clone(),
                reason: "No such file or directory".to_string(),
            })?;
        fs::write(local, &bytes)?;
        progress(bytes.len() as u64, bytes.len() as u64);
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> ConnectTarget {
        ConnectTarget::new(host, "root", None)
    }

    #[test]
    fn unknown_host_refuses_connection() {
        let fake = FakeTransport::new();
        let err = fake.connect(&target("10.0.0.9")).err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(fake.hosts_attempted(), vec!["10.0.0.9".to_string()]);
        assert_eq!(fake.open_sessions(), 0);
    }

    #[test]
    fn builtins_model_a_small_shell() {
        let fake = FakeTransport::new().with_device(
            "h",
            FakeDevice::new().with_file("/usr/bin/awk", "-> /bin/busybox"),
        );
        let session = fake.connect(&target("h")).unwrap();
        assert!(session.run(&["test", "!", "-e", "/lib/missing"]).is_ok());
        assert!(session.run(&["test", "!", "-e", "/usr/bin/awk"]).is_err());
        session.run(&["mv", "/usr/bin/awk", "/usr/bin/awk_tmp"]).unwrap();
        assert!(fake.has_path("h", "/usr/bin/awk_tmp"));
        assert!(!fake.has_path("h", "/usr/bin/awk"));
        let out = session.run(&["cat", "/usr/bin/awk_tmp"]).unwrap();
        assert_eq!(out.stdout, "-> /bin/busybox");
    }

    #[test]
    fn dropped_connection_poisons_the_session() {
        let fake = FakeTransport::new().with_device(
            "h",
            FakeDevice::new().on_command("/sbin/reboot", FakeResponse::DropConnection),
        );
        let session = fake.connect(&target("h")).unwrap();
        assert!(session.run(&["/sbin/reboot"]).unwrap_err().is_connection_lost());
        assert!(session.run(&["true"]).unwrap_err().is_connection_lost());
    }

    #[test]
    fn rules_fire_in_order_and_once_rules_expire() {
        let fake = FakeTransport::new().with_device(
            "h",
            FakeDevice::new()
                .on_command_once("opkg", FakeResponse::fail(1, "busy"))
                .on_command("opkg", FakeResponse::stdout("ok")),
        );
        let session = fake.connect(&target("h")).unwrap();
        assert!(session.run(&["opkg", "update"]).is_err());
        assert_eq!(session.run(&["opkg", "update"]).unwrap().stdout, "ok");
    }

    #[test]
    fn file_channel_resolves_relative_paths() {
        let fake = FakeTransport::new().with_device("h", FakeDevice::new());
        let session = fake.connect(&target("h")).unwrap();
        {
            let mut channel = session.open_file_channel().unwrap();
            channel.chdir("/tmp/firmware");
            let mut data: &[u8] = b"#!/bin/sh\n";
            channel
                .put_reader(&mut data, 10, "stage1.sh", &mut |_, _| {})
                .unwrap();
        }
        assert_eq!(
            fake.file("h", "/tmp/firmware/stage1.sh").unwrap(),
            b"#!/bin/sh\n".to_vec()
        );
        assert_eq!(fake.uploads("h"), vec!["/tmp/firmware/stage1.sh".to_string()]);
    }
}

//! Transport backed by the system OpenSSH client.
//!
//! A session is one control master (`ControlMaster=yes`) whose socket lives in a private
//! temporary directory; every command and file transfer is a short-lived `ssh` process
//! multiplexed over it. File transfers stream through `cat` so they work on factory
//! firmware that ships without an sftp server.

use super::{
    CommandOps, CommandOutput, ConnectTarget, FileChannel, ProgressFn, Session, Transport,
};
use crate::quote::{join_argv, resolve_remote, shell_quote};
use crate::{TransportError, TransportResult};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wait_timeout::ChildExt;

/// ssh reports its own failures (including a dropped connection) with this status.
const SSH_CONNECTION_ERROR: i32 = 255;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const MASTER_STARTUP_GRACE: Duration = Duration::from_secs(30);
const TRANSFER_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct OpenSshOptions {
    pub ssh_program: String,
    pub sshpass_program: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Extra `-o` options, e.g. `HostKeyAlgorithms=+ssh-rsa` for old vendor firmware.
    pub extra_options: Vec<String>,
}

impl Default for OpenSshOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30 * 60),
            extra_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpenSshTransport {
    opts: OpenSshOptions,
}

impl OpenSshTransport {
    pub fn new(opts: OpenSshOptions) -> Self {
        Self { opts }
    }
}

impl Transport for OpenSshTransport {
    fn connect(&self, target: &ConnectTarget) -> TransportResult<Box<dyn Session>> {
        let control_dir = tempfile::Builder::new().prefix("bos-ssh-").tempdir()?;
        let control_path = control_dir.path().join("master.sock");
        let session = OpenSshSession {
            target: target.clone(),
            opts: self.opts.clone(),
            _control_dir: control_dir,
            control_path,
            closed: false,
        };
        session.start_master()?;
        log::debug!("control master for {} is up", target.host);
        Ok(Box::new(session))
    }
}

fn map_spawn_err(program: &str, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        return TransportError::CommandNotFound(program.to_string());
    }
    TransportError::Io(err)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_or_kill(child: &mut Child, command: &str, timeout: Duration) -> TransportResult<ExitStatus> {
    match child.wait_timeout(timeout)? {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(TransportError::CommandTimeout {
                command: command.to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Kills a streaming child when its deadline passes. The copy itself blocks in
/// `read`/`write` and cannot check the clock.
struct Watchdog {
    disarm: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn arm(child: Arc<Mutex<Child>>, timeout: Duration) -> Self {
        let (disarm, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                let _ = lock_child(&child).kill();
            }
        });
        Self {
            disarm,
            fired,
            handle,
        }
    }

    /// Stop the timer. Returns `true` when it already killed the child.
    fn disarm(self) -> bool {
        drop(self.disarm);
        let _ = self.handle.join();
        self.fired.load(Ordering::SeqCst)
    }
}

/// Run `copy` against the child's pipes with the whole exchange bounded by `timeout`.
fn stream_with_deadline<T>(
    child: Child,
    command: &str,
    timeout: Duration,
    copy: impl FnOnce() -> io::Result<T>,
) -> TransportResult<(ExitStatus, io::Result<T>)> {
    let started = Instant::now();
    let timed_out = || TransportError::CommandTimeout {
        command: command.to_string(),
        timeout_secs: timeout.as_secs(),
    };
    let child = Arc::new(Mutex::new(child));
    let watchdog = Watchdog::arm(Arc::clone(&child), timeout);
    let copied = copy();
    let fired = watchdog.disarm();

    let mut child = lock_child(&child);
    if fired {
        let _ = child.wait();
        return Err(timed_out());
    }
    match wait_or_kill(&mut child, command, timeout.saturating_sub(started.elapsed())) {
        Ok(status) => Ok((status, copied)),
        Err(TransportError::CommandTimeout { .. }) => Err(timed_out()),
        Err(err) => Err(err),
    }
}

fn output_with_timeout(
    program: &str,
    command: &str,
    cmd: &mut Command,
    timeout: Duration,
) -> TransportResult<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_spawn_err(program, e))?;

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = drain(child.stdout.take());
    let stderr_handle = drain(child.stderr.take());

    let status = wait_or_kill(&mut child, command, timeout);
    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status: status?,
        stdout,
        stderr,
    })
}

fn copy_with_progress(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    total: u64,
    progress: ProgressFn<'_>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
        copied += read as u64;
        progress(copied, total);
    }
    writer.flush()?;
    Ok(copied)
}

struct OpenSshSession {
    target: ConnectTarget,
    opts: OpenSshOptions,
    // Holds the control socket; removed when the session is dropped.
    _control_dir: TempDir,
    control_path: PathBuf,
    closed: bool,
}

impl OpenSshSession {
    fn base_command(&self, master: bool) -> Command {
        let password = if master {
            self.target.password.as_deref()
        } else {
            None
        };
        let mut cmd = match password {
            Some(password) => {
                let mut cmd = Command::new(&self.opts.sshpass_program);
                cmd.arg("-e").arg(&self.opts.ssh_program);
                cmd.env("SSHPASS", password);
                cmd
            }
            None => Command::new(&self.opts.ssh_program),
        };

        cmd.arg("-p")
            .arg(self.opts.port.to_string())
            .arg("-l")
            .arg(&self.target.username)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.opts.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=5")
            .arg("-o")
            .arg("ServerAliveCountMax=3");

        if master {
            cmd.arg("-o").arg("ControlMaster=yes");
            cmd.arg("-o").arg("ControlPersist=yes");
        } else {
            cmd.arg("-o").arg("ControlMaster=no");
        }
        if password.is_none() {
            cmd.arg("-o").arg("BatchMode=yes");
        }

        if self.target.verify_host_keys {
            cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        } else {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            cmd.arg("-o").arg("LogLevel=ERROR");
        }

        for opt in &self.opts.extra_options {
            cmd.arg("-o").arg(opt);
        }
        cmd
    }

    fn remote_command(&self, command: &str) -> Command {
        let mut cmd = self.base_command(false);
        cmd.arg("--").arg(&self.target.host).arg(command);
        cmd
    }

    fn start_master(&self) -> TransportResult<()> {
        let mut cmd = self.base_command(true);
        cmd.arg("--").arg(&self.target.host).arg("true");
        let output = output_with_timeout(
            &self.opts.ssh_program,
            "ssh (control master)",
            &mut cmd,
            self.opts.connect_timeout + MASTER_STARTUP_GRACE,
        )
        .map_err(|err| match err {
            TransportError::CommandTimeout { .. } => TransportError::Connect {
                host: self.target.host.clone(),
                reason: "timed out while authenticating".to_string(),
            },
            other => other,
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(TransportError::Connect {
            host: self.target.host.clone(),
            reason: if stderr.is_empty() {
                format!("ssh exited with {:?}", output.status.code())
            } else {
                stderr
            },
        })
    }

    fn check(&self, command: &str, output: Output) -> TransportResult<CommandOutput> {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            Some(SSH_CONNECTION_ERROR) => Err(TransportError::ConnectionLost {
                host: self.target.host.clone(),
            }),
            code => Err(TransportError::CommandFailed {
                command: command.to_string(),
                code,
                stdout,
                stderr,
            }),
        }
    }
}

impl CommandOps for OpenSshSession {
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput> {
        self.run_shell(&join_argv(argv))
    }

    fn run_shell(&self, command: &str) -> TransportResult<CommandOutput> {
        log::debug!("[{}] $ {}", self.target.host, command);
        let mut cmd = self.remote_command(command);
        let output = output_with_timeout(
            &self.opts.ssh_program,
            command,
            &mut cmd,
            self.opts.command_timeout,
        )?;
        self.check(command, output)
    }

    fn run_to_writer(&self, argv: &[&str], out: &mut dyn Write) -> TransportResult<u64> {
        let command = join_argv(argv);
        log::debug!("[{}] $ {} (streamed)", self.target.host, command);
        let mut cmd = self.remote_command(&command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| map_spawn_err(&self.opts.ssh_program, e))?;

        let stderr_handle = drain(child.stderr.take());
        let stdout = child.stdout.take();
        let outcome = stream_with_deadline(child, &command, self.opts.command_timeout, || {
            match stdout {
                Some(mut stdout) => io::copy(&mut stdout, out),
                None => Ok(0),
            }
        });
        let stderr = stderr_handle.join().unwrap_or_default();
        let (status, copied) = outcome?;
        let copied = copied?;

        let output = Output {
            status,
            stdout: Vec::new(),
            stderr,
        };
        self.check(&command, output)?;
        Ok(copied)
    }
}

impl Session for OpenSshSession {
    fn host(&self) -> &str {
        &self.target.host
    }

    fn open_file_channel(&self) -> TransportResult<Box<dyn FileChannel + '_>> {
        Ok(Box::new(OpenSshFileChannel {
            session: self,
            cwd: None,
        }))
    }

    fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut cmd = Command::new(&self.opts.ssh_program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg("--")
            .arg(&self.target.host);
        let output = output_with_timeout(&self.opts.ssh_program, "ssh -O exit", &mut cmd, CLOSE_TIMEOUT)?;
        if !output.status.success() {
            // The master is already gone when the device rebooted underneath it.
            log::debug!(
                "control master for {} already closed: {}",
                self.target.host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close ssh session to {}: {}", self.target.host, err);
        }
    }
}

struct OpenSshFileChannel<'a> {
    session: &'a OpenSshSession,
    cwd: Option<String>,
}

impl FileChannel for OpenSshFileChannel<'_> {
    fn chdir(&mut self, dir: &str) {
        self.cwd = Some(resolve_remote(self.cwd.as_deref(), dir));
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn put_reader(
        &mut self,
        reader: &mut dyn Read,
        size: u64,
        remote: &str,
        progress: ProgressFn<'_>,
    ) -> TransportResult<()> {
        let remote = resolve_remote(self.cwd.as_deref(), remote);
        let command = format!("cat > {}", shell_quote(&remote));
        log::debug!("[{}] upload {} ({} bytes)", self.session.host(), remote, size);

        let mut cmd = self.session.remote_command(&command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| map_spawn_err(&self.session.opts.ssh_program, e))?;
        let stderr_handle = drain(child.stderr.take());
        let stdin = child.stdin.take();

        let timeout = self.session.opts.command_timeout;
        let outcome = stream_with_deadline(child, &command, timeout, || match stdin {
            // stdin is dropped at the end of this arm, which sends EOF to `cat`.
            Some(mut stdin) => copy_with_progress(reader, &mut stdin, size, progress),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "ssh stdin unavailable")),
        });
        let stderr = stderr_handle.join().unwrap_or_default();
        let (status, copied) = outcome?;

        let transfer_err = |reason: String| TransportError::FileTransfer {
            path: remote.clone(),
            reason,
        };
        if status.code() == Some(SSH_CONNECTION_ERROR) {
            return Err(TransportError::ConnectionLost {
                host: self.session.host().to_string(),
            });
        }
        copied.map_err(|e| transfer_err(e.to_string()))?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(transfer_err(if stderr.is_empty() {
                format!("remote exited with {:?}", status.code())
            } else {
                stderr
            }));
        }
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path, progress: ProgressFn<'_>) -> TransportResult<u64> {
        let remote = resolve_remote(self.cwd.as_deref(), remote);
        let mut file = File::create(local)?;
        let mut writer = ProgressWriter {
            inner: &mut file,
            written: 0,
            progress,
        };
        let copied = self.session.run_to_writer(&["cat", &remote], &mut writer)?;
        file.sync_all()?;
        Ok(copied)
    }
}

struct ProgressWriter<'a, 'p> {
    inner: &'a mut dyn Write,
    written: u64,
    progress: ProgressFn<'p>,
}

impl Write for ProgressWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        (self.progress)(self.written, 0);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// Stand-in `ssh`: control-master and `-O exit` calls succeed, remote commands run `body`.
    fn fake_ssh(dir: &Path, body: &str) -> String {
        let path = dir.join("ssh");
        let script = format!(
            "#!/bin/sh\ncase \"$*\" in\n  *ControlMaster=yes*|*\"-O exit\"*) exit 0 ;;\nesac\n{}\n",
            body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn connect(ssh_program: String, command_timeout: Duration) -> Box<dyn Session> {
        let transport = OpenSshTransport::new(OpenSshOptions {
            ssh_program,
            command_timeout,
            ..OpenSshOptions::default()
        });
        transport
            .connect(&ConnectTarget::new("10.0.0.5", "root", None))
            .unwrap()
    }

    #[test]
    fn streamed_output_is_copied() {
        let dir = tempdir().unwrap();
        let session = connect(fake_ssh(dir.path(), "printf CONFIG"), Duration::from_secs(10));
        let mut out = Vec::new();
        let copied = session.run_to_writer(&["tar", "czf", "-", "/config"], &mut out).unwrap();
        assert_eq!(copied, 6);
        assert_eq!(out, b"CONFIG");
    }

    #[test]
    fn stalled_stream_hits_the_command_timeout() {
        let dir = tempdir().unwrap();
        let session = connect(
            fake_ssh(dir.path(), "printf partial\nexec sleep 30"),
            Duration::from_millis(500),
        );
        let started = Instant::now();
        let mut out = Vec::new();
        let err = session
            .run_to_writer(&["nanddump", "-f", "-", "/dev/mtd0"], &mut out)
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandTimeout { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn stalled_upload_hits_the_command_timeout() {
        let dir = tempdir().unwrap();
        let session = connect(fake_ssh(dir.path(), "exec sleep 30"), Duration::from_millis(500));
        let started = Instant::now();
        // Larger than a pipe buffer so the write blocks on the stalled reader.
        let payload = vec![0u8; 4 * 1024 * 1024];
        let mut channel = session.open_file_channel().unwrap();
        let err = channel
            .put_reader(&mut payload.as_slice(), payload.len() as u64, "/tmp/x", &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandTimeout { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}

//! Pre-mutation backups.
//!
//! A backup is written into `<dest>.partial` and only renamed to its final name once
//! every file is on disk, so an interrupted or failed backup never looks complete.

mod set;

pub use set::{BackupSet, CONFIG_ARCHIVE, MAC_FILE, MARKER_FILE};

use crate::config::DAEMON_STOP_SETTLE;
use crate::mtdparts::{parse_env, PartitionLayout, MTDPARTS_PREFIX};
use bos_error::{StopKind, ToolboxError, ToolboxResult};
use bos_transport::{CommandOps, Session};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;

const CMDLINE_PATH: &str = "/proc/cmdline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Dump every storage partition, not only configuration.
    pub storage_dump: bool,
}

fn failed(message: impl Into<String>) -> ToolboxError {
    ToolboxError::upgrade(StopKind::BackupFailed, message)
}

fn failed_with(what: &str, err: impl std::fmt::Display) -> ToolboxError {
    failed(format!("{}: {}", what, err))
}

/// Backup destination for a device: `<root>/<mac without colons>-<UTC timestamp>`.
pub fn destination(backup_root: &Path, mac: &str, now: DateTime<Utc>) -> PathBuf {
    let id: String = mac.chars().filter(|c| *c != ':').collect();
    backup_root.join(format!("{}-{}", id, now.format("%Y%m%dT%H%M%SZ")))
}

/// Removes the partial directory unless the backup was committed.
struct PartialDir {
    path: PathBuf,
    committed: bool,
}

impl PartialDir {
    fn create(dest: &Path) -> ToolboxResult<Self> {
        let mut name = dest.as_os_str().to_owned();
        name.push(".partial");
        let path = PathBuf::from(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    fn commit(mut self, dest: &Path) -> ToolboxResult<()> {
        fs::rename(&self.path, dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialDir {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                log::warn!("failed to remove partial backup {}: {}", self.path.display(), err);
            }
        }
    }
}

/// Stop the miner daemon and flush so the captured configuration is consistent.
fn quiesce(session: &dyn Session) -> ToolboxResult<()> {
    session
        .run(&["mount", "-t", "tmpfs", "tmpfs", "/tmp/"])
        .map_err(|e| failed_with("Cannot mount scratch space", e))?;
    session
        .run(&["/etc/init.d/bmminer.sh", "stop"])
        .map_err(|e| failed_with("Cannot stop the miner daemon", e))?;
    sleep(DAEMON_STOP_SETTLE);
    session
        .run(&["sync"])
        .map_err(|e| failed_with("Cannot sync storage", e))?;
    Ok(())
}

/// Bootloader environment. Vendor firmware without `fw_printenv` still exposes the
/// partition layout on the kernel command line.
fn capture_env(session: &dyn Session) -> ToolboxResult<String> {
    match session.run(&["fw_printenv"]) {
        Ok(out) if !out.stdout.trim().is_empty() => return Ok(out.stdout),
        Ok(_) => log::debug!("fw_printenv printed nothing"),
        Err(err) if err.is_connection_lost() => {
            return Err(failed_with("Cannot read bootloader environment", err))
        }
        Err(err) => log::debug!("fw_printenv unavailable: {}", err),
    }
    let cmdline = session
        .run(&["cat", CMDLINE_PATH])
        .map_err(|e| failed_with("Cannot read kernel command line", e))?;
    cmdline
        .stdout
        .split_whitespace()
        .find(|token| token.starts_with(MTDPARTS_PREFIX))
        .map(|token| format!("mtdparts={}\n", token))
        .ok_or_else(|| failed("Device reports no partition layout"))
}

fn write_local(path: &Path, contents: &str) -> ToolboxResult<()> {
    fs::write(path, contents).map_err(|e| failed_with(&format!("Cannot write {}", path.display()), e))
}

fn capture_stream(session: &dyn Session, argv: &[&str], out: &Path) -> ToolboxResult<u64> {
    let file =
        File::create(out).map_err(|e| failed_with(&format!("Cannot create {}", out.display()), e))?;
    let mut writer = BufWriter::new(file);
    let written = session
        .run_to_writer(argv, &mut writer)
        .map_err(|e| failed_with(&format!("Cannot capture {}", argv.join(" ")), e))?;
    writer
        .flush()
        .map_err(|e| failed_with(&format!("Cannot write {}", out.display()), e))?;
    Ok(written)
}

/// Back up a device into `dest`. A pre-existing `dest` is refused.
pub fn backup(
    session: &dyn Session,
    mac: &str,
    dest: &Path,
    opts: &BackupOptions,
) -> ToolboxResult<BackupSet> {
    if dest.exists() {
        return Err(failed(format!(
            "Backup destination '{}' already exists",
            dest.display()
        )));
    }
    log::info!("Backing up {} to {}...", session.host(), dest.display());
    quiesce(session)?;

    let partial =
        PartialDir::create(dest).map_err(|e| failed_with("Cannot create backup directory", e))?;
    let env = capture_env(session)?;
    write_local(&partial.path.join(MARKER_FILE), &env)?;
    write_local(&partial.path.join(MAC_FILE), &format!("{}\n", mac))?;
    capture_stream(
        session,
        &["tar", "czf", "-", "/config"],
        &partial.path.join(CONFIG_ARCHIVE),
    )?;

    if opts.storage_dump {
        let layout = match PartitionLayout::from_env(&parse_env(&env)) {
            Some(Ok(layout)) => layout,
            Some(Err(err)) => return Err(failed(err.to_string())),
            None => return Err(failed("Bootloader environment has no partition layout")),
        };
        for (index, part) in layout.partitions.iter().enumerate() {
            let device = format!("/dev/mtd{}", index);
            let out = partial.path.join(PartitionLayout::dump_file(&part.name));
            let size = capture_stream(session, &["nanddump", "-f", "-", &device], &out)?;
            log::info!(
                "Dumped {} ({}) from {}",
                part.name,
                crate::progress::format_size(size),
                session.host()
            );
        }
    }

    partial
        .commit(dest)
        .map_err(|e| failed_with("Cannot finalise backup", e))?;
    log::info!("Backup of {} stored in {}", session.host(), dest.display());
    BackupSet::open(dest)
}

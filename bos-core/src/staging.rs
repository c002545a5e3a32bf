//! Getting files onto a device and tidying up after them.
//!
//! Vendor firmware lacks a few tools the install and restore scripts rely on, so a
//! small set of helper binaries is placed into system directories first. Pre-existing
//! link targets are moved aside and put back by [`cleanup_system`].

use crate::progress::log_progress;
use bos_error::{StopKind, ToolboxError, ToolboxResult};
use bos_transport::{CommandOps, Session, TransportError};
use std::path::Path;
use walkdir::WalkDir;

/// Remote working directory of the installer.
pub const TARGET_DIR: &str = "/tmp/firmware";
/// Suffix for link targets moved aside during system preparation.
pub const BACKUP_SUFFIX: &str = "_tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperBinary {
    pub name: &'static str,
    pub remote_dir: &'static str,
}

impl HelperBinary {
    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.remote_dir, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemLink {
    pub link: &'static str,
    pub target: &'static str,
}

pub const SYSTEM_BINARIES: &[HelperBinary] = &[
    HelperBinary {
        name: "ld-musl-armhf.so.1",
        remote_dir: "/lib",
    },
    HelperBinary {
        name: "sftp-server",
        remote_dir: "/usr/lib/openssh",
    },
    HelperBinary {
        name: "fw_printenv",
        remote_dir: "/usr/sbin",
    },
    HelperBinary {
        name: "busybox1.25",
        remote_dir: "/bin",
    },
];

pub const SYSTEM_LINKS: &[SystemLink] = &[
    SystemLink {
        link: "/usr/sbin/fw_setenv",
        target: "/usr/sbin/fw_printenv",
    },
    SystemLink {
        link: "/usr/bin/awk",
        target: "/bin/busybox1.25",
    },
];

fn exists(session: &dyn Session, path: &str) -> ToolboxResult<bool> {
    match session.run(&["test", "-e", path]) {
        Ok(_) => Ok(true),
        Err(TransportError::CommandFailed { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Remove and recreate a remote directory.
pub fn reset_dir(session: &dyn Session, dir: &str) -> ToolboxResult<()> {
    session.run(&["rm", "-fr", dir])?;
    session.run(&["mkdir", "-p", dir])?;
    Ok(())
}

/// Place helper binaries and links. Refuses to overwrite an existing helper.
pub fn prepare_system(session: &dyn Session, system_dir: &Path) -> ToolboxResult<()> {
    for helper in SYSTEM_BINARIES {
        let local = system_dir.join(helper.name);
        if !local.is_file() {
            return Err(ToolboxError::Other(format!(
                "Missing helper binary {}",
                local.display()
            )));
        }
        let remote = helper.remote_path();
        if exists(session, &remote)? {
            return Err(ToolboxError::platform(
                StopKind::Conflict,
                format!("File '{}' already exists on the device", remote),
            ));
        }
    }

    log::info!("Preparing system helpers on {}...", session.host());
    for helper in SYSTEM_BINARIES {
        let remote = helper.remote_path();
        session.run(&["mkdir", "-p", helper.remote_dir])?;
        {
            let mut channel = session.open_file_channel()?;
            channel.put(
                &system_dir.join(helper.name),
                &remote,
                &mut log_progress(helper.name),
            )?;
        }
        session.run(&["chmod", "+x", &remote])?;
    }

    for link in SYSTEM_LINKS {
        if exists(session, link.link)? {
            let aside = format!("{}{}", link.link, BACKUP_SUFFIX);
            session.run(&["mv", link.link, &aside])?;
        }
        session.run(&["ln", "-fs", link.target, link.link])?;
    }
    Ok(())
}

/// Undo [`prepare_system`]: drop links and helpers, restore moved-aside targets.
pub fn cleanup_system(session: &dyn Session) -> ToolboxResult<()> {
    log::info!("Cleaning up system helpers on {}...", session.host());
    for link in SYSTEM_LINKS.iter().rev() {
        session.run(&["rm", "-f", link.link])?;
        let aside = format!("{}{}", link.link, BACKUP_SUFFIX);
        if exists(session, &aside)? {
            session.run(&["mv", &aside, link.link])?;
        }
    }
    for helper in SYSTEM_BINARIES.iter().rev() {
        session.run(&["rm", "-f", &helper.remote_path()])?;
    }
    Ok(())
}

/// Upload a local directory tree below `remote_dir`. Returns the number of files sent.
pub fn upload_tree(session: &dyn Session, local: &Path, remote_dir: &str) -> ToolboxResult<usize> {
    let mut channel = session.open_file_channel()?;
    channel.chdir(remote_dir);
    let mut sent = 0;
    for entry in WalkDir::new(local).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ToolboxError::Other(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(local)
            .map_err(|e| ToolboxError::Other(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            session.run(&["mkdir", "-p", &format!("{}/{}", remote_dir, rel)])?;
        } else {
            channel.put(entry.path(), &rel, &mut log_progress(&rel))?;
            sent += 1;
        }
    }
    Ok(sent)
}

/// Upload a single local file to `remote`.
pub fn upload_file(session: &dyn Session, local: &Path, remote: &str) -> ToolboxResult<()> {
    let mut channel = session.open_file_channel()?;
    channel.put(local, remote, &mut log_progress(remote))?;
    Ok(())
}

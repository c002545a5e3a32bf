//! Post-upgrade payload (`stage3.tgz`).
//!
//! The archive has a single top-level `upgrade/` directory whose `stage3.sh` the new
//! firmware runs on first boot. A built-in set shipped with the tool and a user set
//! given on the command line can be combined; the user's entry point then moves to
//! `upgrade/stage3_usr.sh` so both run.

use bos_error::{StopKind, ToolboxError, ToolboxResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const STAGE3_ARCHIVE: &str = "stage3.tgz";
pub const STAGE3_ROOT: &str = "upgrade";
pub const STAGE3_SCRIPT: &str = "stage3.sh";
pub const STAGE3_USER_SCRIPT: &str = "stage3_usr.sh";

/// Check that `path` is a directory with a `stage3.sh` entry point.
pub fn check_payload_dir(path: &Path) -> ToolboxResult<()> {
    if !path.is_dir() {
        return Err(ToolboxError::upgrade(
            StopKind::Prerequisite,
            format!("Post-upgrade path '{}' is not a directory", path.display()),
        ));
    }
    if !path.join(STAGE3_SCRIPT).is_file() {
        return Err(ToolboxError::upgrade(
            StopKind::Prerequisite,
            format!(
                "Post-upgrade directory '{}' is missing {}",
                path.display(),
                STAGE3_SCRIPT
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage3Payload {
    builtin: Option<PathBuf>,
    user: Option<PathBuf>,
}

impl Stage3Payload {
    /// Combine the built-in and user sets. `None` when neither is present.
    ///
    /// A missing built-in directory is not an error; a user directory that is not a
    /// valid payload is, and so is a built-in directory without an entry point.
    pub fn resolve(builtin: &Path, user: Option<&Path>) -> ToolboxResult<Option<Self>> {
        let builtin = if builtin.exists() {
            check_payload_dir(builtin)?;
            Some(builtin.to_path_buf())
        } else {
            None
        };
        if let Some(user) = user {
            check_payload_dir(user)?;
        }
        if builtin.is_none() && user.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            builtin,
            user: user.map(Path::to_path_buf),
        }))
    }

    /// Write the archive to `out`.
    pub fn build(&self, out: &Path) -> ToolboxResult<()> {
        let file = File::create(out)?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        tar.follow_symlinks(false);

        if let Some(builtin) = &self.builtin {
            tar.append_dir_all(STAGE3_ROOT, builtin)?;
        }
        if let Some(user) = &self.user {
            let root = Path::new(STAGE3_ROOT);
            if self.builtin.is_none() {
                tar.append_dir_all(STAGE3_ROOT, user)?;
            } else {
                for entry in WalkDir::new(user).min_depth(1).sort_by_file_name() {
                    let entry = entry.map_err(|e| ToolboxError::Other(e.to_string()))?;
                    let rel = entry
                        .path()
                        .strip_prefix(user)
                        .map_err(|e| ToolboxError::Other(e.to_string()))?;
                    let name = if rel == Path::new(STAGE3_SCRIPT) {
                        root.join(STAGE3_USER_SCRIPT)
                    } else {
                        root.join(rel)
                    };
                    if entry.file_type().is_dir() {
                        tar.append_dir(&name, entry.path())?;
                    } else {
                        tar.append_path_with_name(entry.path(), &name)?;
                    }
                }
            }
        }

        tar.into_inner()?.finish()?;
        Ok(())
    }
}

use crate::device::normalize_mac;
use crate::mtdparts::{parse_env, PartitionLayout};
use bos_error::{StopKind, ToolboxError, ToolboxResult};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Bootloader environment dump; its location marks the root of a backup.
pub const MARKER_FILE: &str = "uEnv.txt";
pub const CONFIG_ARCHIVE: &str = "config.tar.gz";
pub const MAC_FILE: &str = "mac";

fn invalid(message: impl Into<String>) -> ToolboxError {
    ToolboxError::platform(StopKind::Prerequisite, message)
}

/// A captured device backup, either a directory or an extracted tarball.
#[derive(Debug)]
pub struct BackupSet {
    root: PathBuf,
    // Keeps an extracted tarball alive for as long as the set is used.
    _extracted: Option<TempDir>,
}

impl BackupSet {
    /// Open a backup directory or a `.tar`/`.tar.gz` of one.
    pub fn open(path: &Path) -> ToolboxResult<Self> {
        if path.is_dir() {
            if !path.join(MARKER_FILE).is_file() {
                return Err(invalid(format!(
                    "Backup directory '{}' has no {}",
                    path.display(),
                    MARKER_FILE
                )));
            }
            return Ok(Self {
                root: path.to_path_buf(),
                _extracted: None,
            });
        }
        if path.is_file() {
            return Self::open_tarball(path);
        }
        Err(invalid(format!("Backup '{}' does not exist", path.display())))
    }

    fn open_tarball(path: &Path) -> ToolboxResult<Self> {
        let extracted = tempfile::Builder::new().prefix("bos-backup-").tempdir()?;
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 2];
        let gzip = reader.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
        let file = File::open(path)?;
        let unpacked = if gzip {
            tar::Archive::new(GzDecoder::new(file)).unpack(extracted.path())
        } else {
            tar::Archive::new(file).unpack(extracted.path())
        };
        unpacked.map_err(|e| invalid(format!("Cannot extract backup '{}': {}", path.display(), e)))?;

        let markers: Vec<PathBuf> = WalkDir::new(extracted.path())
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == MARKER_FILE)
            .map(|e| e.path().to_path_buf())
            .collect();
        let root = match markers.as_slice() {
            [marker] => marker
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| extracted.path().to_path_buf()),
            [] => {
                return Err(invalid(format!(
                    "Backup tarball '{}' contains no {}",
                    path.display(),
                    MARKER_FILE
                )))
            }
            _ => {
                return Err(invalid(format!(
                    "Backup tarball '{}' contains more than one backup",
                    path.display()
                )))
            }
        };
        Ok(Self {
            root,
            _extracted: Some(extracted),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    pub fn env(&self) -> ToolboxResult<BTreeMap<String, String>> {
        Ok(parse_env(&fs::read_to_string(self.marker())?))
    }

    /// Partition layout recorded in the environment dump.
    pub fn layout(&self) -> ToolboxResult<PartitionLayout> {
        let env = self.env()?;
        match PartitionLayout::from_env(&env) {
            Some(Ok(layout)) => Ok(layout),
            Some(Err(err)) => Err(invalid(err.to_string())),
            None => Err(invalid(format!("{} has no mtdparts entry", MARKER_FILE))),
        }
    }

    pub fn mac(&self) -> Option<String> {
        fs::read_to_string(self.root.join(MAC_FILE))
            .ok()
            .and_then(|m| normalize_mac(&m))
    }

    pub fn config_archive(&self) -> Option<PathBuf> {
        Some(self.root.join(CONFIG_ARCHIVE)).filter(|p| p.is_file())
    }

    pub fn dump_path(&self, partition: &str) -> PathBuf {
        self.root.join(PartitionLayout::dump_file(partition))
    }

    /// Whether every partition of `layout` has a dump in this set.
    pub fn has_storage_dump(&self, layout: &PartitionLayout) -> bool {
        layout.names().all(|name| self.dump_path(name).is_file())
    }
}

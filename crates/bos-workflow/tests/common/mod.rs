#![allow(dead_code)]

use bos_core::config::{Credentials, ToolboxConfig};
use bos_core::device::MAC_PATH;
use bos_core::mode::{BOARD_NAME_PATH, BOS_MODE_PATH};
use bos_core::staging::SYSTEM_BINARIES;
use bos_transport::{FakeDevice, FakeTransport};
use bos_workflow::{CancelFlag, WorkflowEnv};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const MAC: &str = "00:1a:2b:3c:4d:5e";

pub struct Fixture {
    pub dir: TempDir,
    pub config: ToolboxConfig,
    pub credentials: Credentials,
    pub cancel: CancelFlag,
}

impl Fixture {
    /// A data root with helper binaries, a firmware tree and the restore script.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("system")).unwrap();
        for helper in SYSTEM_BINARIES {
            fs::write(root.join("system").join(helper.name), helper.name).unwrap();
        }
        fs::create_dir_all(root.join("firmware")).unwrap();
        fs::write(root.join("firmware/stage1.sh"), "#!/bin/sh\n").unwrap();
        fs::write(root.join("firmware/uImage"), "kernel").unwrap();
        fs::create_dir_all(root.join("upgrade")).unwrap();
        fs::write(root.join("upgrade/restore.sh"), "#!/bin/sh\n").unwrap();
        fs::write(root.join("bos-version.txt"), "2024-01-01-0-test\n").unwrap();

        let mut config = ToolboxConfig::default();
        config.paths.data_root = root.to_path_buf();
        config.paths.backup_root = root.join("backup");
        Self {
            dir,
            credentials: config.credentials(),
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn env<'a>(&'a self, fake: &'a FakeTransport) -> WorkflowEnv<'a> {
        WorkflowEnv {
            transport: fake,
            ports: fake,
            config: &self.config,
            credentials: &self.credentials,
            cancel: &self.cancel,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }
}

/// Vendor firmware with a readable MAC address.
pub fn factory_device() -> FakeDevice {
    FakeDevice::new()
        .with_file(MAC_PATH, format!("{}\n", MAC))
        .with_file("/usr/bin/awk", "-> /bin/busybox")
}

/// Target firmware running from internal storage.
pub fn bos_device() -> FakeDevice {
    FakeDevice::new()
        .with_file(MAC_PATH, format!("{}\n", MAC))
        .with_file(BOS_MODE_PATH, "nand\n")
        .with_file(BOARD_NAME_PATH, "am2-s17\n")
}

/// Paths on `host` outside volatile `/tmp`.
pub fn persistent_paths(fake: &FakeTransport, host: &str) -> Vec<(String, Vec<u8>)> {
    fake.paths(host)
        .into_iter()
        .filter(|p| !p.starts_with("/tmp/"))
        .map(|p| {
            let body = fake.file(host, &p).unwrap_or_default();
            (p, body)
        })
        .collect()
}

//! Tool configuration.
//!
//! Every field has a default, so running without a config file is the common case.
//! The resolved [`ToolboxConfig`] and [`Credentials`] are immutable values handed to
//! the batch runner and forwarded to every host.

use bos_error::{ToolboxError, ToolboxResult};
use bos_transport::{ConnectTarget, DelayRange, OpenSshOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settle time after `opkg update` before the package lock is taken again.
pub const PACKAGE_LOCK_SETTLE: Duration = Duration::from_secs(1);
/// Settle time after stopping the miner daemon before a backup is taken.
pub const DAEMON_STOP_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub username: String,
    pub password: Option<String>,
    pub ssh_program: String,
    pub sshpass_program: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub verify_host_keys: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: None,
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            command_timeout_secs: 1800,
            verify_host_keys: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootConfig {
    /// Jitter range in seconds between port probes after an install.
    pub install_delay: [u64; 2],
    /// Jitter range in seconds between port probes after a restore or recovery boot.
    pub restore_delay: [u64; 2],
    pub timeout_secs: u64,
    /// Port that signals the freshly installed firmware is serving.
    pub service_port: u16,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            install_delay: [3, 5],
            restore_delay: [3, 8],
            timeout_secs: 600,
            service_port: 80,
        }
    }
}

impl RebootConfig {
    pub fn install_delay(&self) -> DelayRange {
        DelayRange::from_secs(self.install_delay[0], self.install_delay[1])
    }

    pub fn restore_delay(&self) -> DelayRange {
        DelayRange::from_secs(self.restore_delay[0], self.restore_delay[1])
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `system/`, `firmware/`, `upgrade/` and `post-upgrade/`.
    pub data_root: PathBuf,
    pub backup_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("."),
            backup_root: PathBuf::from("backup"),
        }
    }
}

impl PathsConfig {
    pub fn system_dir(&self) -> PathBuf {
        self.data_root.join("system")
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.data_root.join("firmware")
    }

    pub fn restore_script(&self) -> PathBuf {
        self.data_root.join("upgrade").join("restore.sh")
    }

    pub fn builtin_post_upgrade(&self) -> PathBuf {
        self.data_root.join("post-upgrade")
    }

    pub fn version_file(&self) -> PathBuf {
        self.data_root.join("bos-version.txt")
    }

    /// Firmware version shipped in `data_root`, for the install banner.
    pub fn firmware_version(&self) -> String {
        fs::read_to_string(self.version_file())
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unknown version".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolboxConfig {
    pub ssh: SshConfig,
    pub reboot: RebootConfig,
    pub paths: PathsConfig,
}

impl ToolboxConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> ToolboxResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| {
            ToolboxError::Other(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    pub fn ssh_options(&self) -> OpenSshOptions {
        OpenSshOptions {
            ssh_program: self.ssh.ssh_program.clone(),
            sshpass_program: self.ssh.sshpass_program.clone(),
            port: self.ssh.port,
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
            ..OpenSshOptions::default()
        }
    }

    /// Login credentials from the `[ssh]` table.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.ssh.username.clone(),
            password: self.ssh.password.clone(),
        }
    }
}

/// Login credentials for one batch. Never mutated once the batch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Replace the password when one was given on the command line.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        if password.is_some() {
            self.password = password;
        }
        self
    }

    pub fn target(&self, host: &str, verify_host_keys: bool) -> ConnectTarget {
        let target = ConnectTarget::new(host, self.username.clone(), self.password.clone());
        if verify_host_keys {
            target
        } else {
            target.without_host_key_verification()
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        ToolboxConfig::default().credentials()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ToolboxConfig::from_toml_str("").unwrap();
        assert_eq!(config, ToolboxConfig::default());
        assert_eq!(config.ssh.username, "root");
        assert_eq!(config.reboot.service_port, 80);
        assert_eq!(config.reboot.restore_delay(), DelayRange::from_secs(3, 8));
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = ToolboxConfig::from_toml_str(
            r#"
            [ssh]
            password = "admin"
            port = 2222

            [paths]
            data_root = "/opt/bos"
            "#,
        )
        .unwrap();
        assert_eq!(config.ssh.password.as_deref(), Some("admin"));
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.command_timeout_secs, 1800);
        assert_eq!(config.paths.backup_root, PathBuf::from("backup"));
        assert_eq!(
            config.paths.restore_script(),
            PathBuf::from("/opt/bos/upgrade/restore.sh")
        );
    }

    #[test]
    fn load_reports_the_offending_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("toolbox.toml");
        fs::write(&path, "[reboot]\ntimeout_secs = \"soon\"\n").unwrap();
        let err = ToolboxConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("toolbox.toml"));
    }

    #[test]
    fn cli_password_overrides_config_only_when_given() {
        let creds = Credentials::new("root", Some("admin".into()));
        assert_eq!(creds.clone().with_password(None).password.as_deref(), Some("admin"));
        assert_eq!(
            creds.with_password(Some("s3cret".into())).password.as_deref(),
            Some("s3cret")
        );
    }

    #[test]
    fn firmware_version_falls_back_when_missing() {
        let dir = tempdir().unwrap();
        let mut paths = PathsConfig {
            data_root: dir.path().to_path_buf(),
            ..PathsConfig::default()
        };
        assert_eq!(paths.firmware_version(), "unknown version");
        fs::write(dir.path().join("bos-version.txt"), "2022-09-13-0-11012d53\n").unwrap();
        assert_eq!(paths.firmware_version(), "2022-09-13-0-11012d53");
        paths.data_root = dir.path().join("missing");
        assert_eq!(paths.firmware_version(), "unknown version");
    }

    #[test]
    fn credentials_build_targets_for_recovery_reconnection() {
        let creds = Credentials::default();
        assert!(creds.target("10.0.0.5", true).verify_host_keys);
        assert!(!creds.target("10.0.0.5", false).verify_host_keys);
    }
}

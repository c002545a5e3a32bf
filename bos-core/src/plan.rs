//! Per-host plans.
//!
//! A plan is built once from the command line and cloned for every host of a batch;
//! the state machines only ever read it.

use bos_transport::shell_quote;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum KeepHostname {
    Always,
    Never,
    /// Keep the hostname only if it differs from the vendor default.
    #[default]
    IfCustom,
}

impl KeepHostname {
    pub fn from_flags(keep: bool, no_keep: bool) -> Self {
        match (keep, no_keep) {
            (true, _) => KeepHostname::Always,
            (false, true) => KeepHostname::Never,
            (false, false) => KeepHostname::IfCustom,
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            KeepHostname::Always => "yes",
            KeepHostname::Never => "no",
            KeepHostname::IfCustom => "cond",
        }
    }
}

/// Power supply limit handed to the install script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PowerLimit {
    /// Leave the firmware default in place.
    #[default]
    Default,
    /// `0` on the command line: no limit at all.
    Disabled,
    Watts(u32),
}

impl PowerLimit {
    pub fn from_option(watts: Option<u32>) -> Self {
        match watts {
            None => PowerLimit::Default,
            Some(0) => PowerLimit::Disabled,
            Some(w) => PowerLimit::Watts(w),
        }
    }

    pub fn as_arg(self) -> String {
        match self {
            PowerLimit::Default => "default".to_string(),
            PowerLimit::Disabled => String::new(),
            PowerLimit::Watts(w) => w.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupRequest {
    /// Dump every storage partition in addition to the configuration.
    pub storage_dump: bool,
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    pub keep_network: bool,
    pub keep_hostname: KeepHostname,
    pub keep_pools: bool,
    pub pool_user: Option<String>,
    pub power_limit: PowerLimit,
    pub dry_run: bool,
    pub backup: Option<BackupRequest>,
    pub wait_for_reboot: bool,
    /// User supplied post-upgrade directory.
    pub post_upgrade: Option<PathBuf>,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            keep_network: true,
            keep_hostname: KeepHostname::default(),
            keep_pools: true,
            pool_user: None,
            power_limit: PowerLimit::default(),
            dry_run: false,
            backup: None,
            wait_for_reboot: true,
            post_upgrade: None,
        }
    }
}

impl InstallPlan {
    pub fn stage1_args(&self, hw_id: &str) -> Stage1Args {
        Stage1Args {
            hw_id: hw_id.to_string(),
            pool_user: self.pool_user.clone().unwrap_or_default(),
            power_limit: self.power_limit.as_arg(),
            keep_network: yes_no(self.keep_network),
            keep_hostname: self.keep_hostname.as_arg(),
            keep_pools: yes_no(self.keep_pools),
            dry_run: yes_no(self.dry_run),
        }
    }
}

/// Positional arguments of the device-side install script, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage1Args {
    pub hw_id: String,
    pub pool_user: String,
    pub power_limit: String,
    pub keep_network: &'static str,
    pub keep_hostname: &'static str,
    pub keep_pools: &'static str,
    pub dry_run: &'static str,
}

impl Stage1Args {
    pub fn to_argv(&self) -> [&str; 7] {
        [
            self.hw_id.as_str(),
            self.pool_user.as_str(),
            self.power_limit.as_str(),
            self.keep_network,
            self.keep_hostname,
            self.keep_pools,
            self.dry_run,
        ]
    }

    /// Shell line that runs the install script from the staging directory.
    pub fn command_line(&self, target_dir: &str) -> String {
        let args: Vec<String> = self.to_argv().iter().map(|a| shell_quote(a)).collect();
        format!(
            "cd {} && ls -l && /bin/sh stage1.sh {}",
            shell_quote(target_dir),
            args.join(" ")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    /// Backup directory or tarball to restore from.
    pub backup: Option<PathBuf>,
    /// Local path or URL of a vendor firmware image.
    pub factory_image: Option<String>,
    pub wait_for_reboot: bool,
}

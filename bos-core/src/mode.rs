//! Decides which firmware a device is currently running.

use bos_transport::{CommandOps, Session};
use serde::Serialize;
use std::fmt;

/// Written by the target firmware; holds `nand`, `sd` or `recovery`.
pub const BOS_MODE_PATH: &str = "/etc/bos_mode";
/// Present on every OpenWrt-based system, absent on vendor firmware.
pub const BOARD_NAME_PATH: &str = "/tmp/sysinfo/board_name";

/// Boards the target firmware runs on.
pub const BOS_BOARDS: &[&str] = &["dm1-g9", "dm1-g19", "dm1-g29", "am1-s9", "am2-s15", "am2-s17"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Mode {
    /// Vendor firmware; eligible for installation.
    Factory,
    /// Target firmware running from internal storage; eligible for restore.
    TargetFirmware,
    /// Target firmware's recovery environment.
    Recovery,
    /// Target firmware booted from removable media.
    RemovableMedia,
}

impl Mode {
    /// Map the content of the mode marker. Unknown markers are treated as factory.
    pub fn from_marker(marker: &str) -> Mode {
        match marker.trim() {
            "nand" => Mode::TargetFirmware,
            "sd" => Mode::RemovableMedia,
            "recovery" => Mode::Recovery,
            _ => Mode::Factory,
        }
    }

    pub fn is_target_firmware(self) -> bool {
        self != Mode::Factory
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Factory => "factory firmware",
            Mode::TargetFirmware => "bOS (NAND)",
            Mode::Recovery => "bOS recovery",
            Mode::RemovableMedia => "bOS (SD card)",
        };
        f.write_str(name)
    }
}

fn read_marker(session: &dyn Session, path: &str) -> Option<String> {
    match session.run(&["cat", path]) {
        Ok(out) => Some(out.first_line().to_string()),
        Err(err) => {
            log::debug!("{} not readable: {}", path, err);
            None
        }
    }
}

/// Board name reported by an OpenWrt-based system, if any.
pub fn board_name(session: &dyn Session) -> Option<String> {
    read_marker(session, BOARD_NAME_PATH).filter(|b| !b.is_empty())
}

pub fn is_bos_board(board: &str) -> bool {
    BOS_BOARDS.contains(&board)
}

/// Detect the current mode. Never fails: anything unreadable is treated as factory.
///
/// The mode marker wins; without it the presence of an OpenWrt board name means the
/// target firmware family is already installed.
pub fn detect(session: &dyn Session) -> Mode {
    if let Some(marker) = read_marker(session, BOS_MODE_PATH) {
        return Mode::from_marker(&marker);
    }
    match board_name(session) {
        Some(board) => {
            log::debug!("no mode marker, board {} reported", board);
            Mode::TargetFirmware
        }
        None => Mode::Factory,
    }
}

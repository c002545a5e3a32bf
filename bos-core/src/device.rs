use crate::mode::{self, Mode};
use bos_error::{ToolboxError, ToolboxResult};
use bos_transport::{CommandOps, Session};
use serde::Serialize;

pub const MAC_PATH: &str = "/sys/class/net/eth0/address";

/// Identity of a remote controller, captured once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub host: String,
    pub mac: String,
    pub board: Option<String>,
    pub mode: Mode,
}

impl Device {
    pub fn probe(session: &dyn Session) -> ToolboxResult<Self> {
        let host = session.host();
        let mac = read_mac(session)?;
        let board = mode::board_name(session);
        let mode = mode::detect(session);
        log::debug!("{}: mac {} board {:?} mode {:?}", host, mac, board, mode);
        Ok(Self {
            host: host.to_string(),
            mac,
            board,
            mode,
        })
    }
}

/// Normalise a MAC address to lowercase colon-separated hex.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase();
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then_some(mac)
}

pub fn read_mac(session: &dyn Session) -> ToolboxResult<String> {
    let out = session.run(&["cat", MAC_PATH])?;
    normalize_mac(out.first_line()).ok_or_else(|| {
        ToolboxError::Other(format!("Unexpected MAC address {:?}", out.first_line()))
    })
}

/// Hostname the target firmware assigns by default: `miner-` and the last three octets.
pub fn default_hostname(mac: &str) -> String {
    let tail: String = mac.split(':').skip(3).collect();
    format!("miner-{}", tail.to_ascii_lowercase())
}

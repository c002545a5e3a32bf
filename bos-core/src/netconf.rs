//! Vendor network configuration generated from a running target firmware.
//!
//! Restoring a factory image without a backup still keeps the device reachable: the
//! current network settings are translated into the vendor's `config/network.conf`.

use crate::device::default_hostname;
use bos_error::ToolboxResult;
use bos_transport::{CommandOps, Session};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;

/// Hostname vendor firmware uses out of the box.
pub const FACTORY_HOSTNAME: &str = "antMiner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkConfig {
    Dhcp {
        hostname: String,
    },
    Static {
        ipaddr: String,
        netmask: String,
        gateway: String,
        dns: Vec<String>,
    },
}

fn uci_get(session: &dyn Session, key: &str) -> Option<String> {
    session
        .run(&["uci", "get", &format!("network.lan.{}", key)])
        .ok()
        .map(|out| out.first_line().to_string())
}

impl NetworkConfig {
    /// Read the LAN settings of a device running the target firmware.
    pub fn query(session: &dyn Session, mac: &str) -> ToolboxResult<Self> {
        let proto = session.run(&["uci", "get", "network.lan.proto"])?;
        if proto.first_line() == "dhcp" {
            let hostname = match uci_get(session, "hostname").filter(|h| !h.is_empty()) {
                Some(hostname) => hostname,
                None => session
                    .run(&["cat", "/proc/sys/kernel/hostname"])?
                    .first_line()
                    .to_string(),
            };
            let hostname = if hostname == default_hostname(mac) {
                FACTORY_HOSTNAME.to_string()
            } else {
                hostname
            };
            return Ok(NetworkConfig::Dhcp { hostname });
        }
        let ipaddr = session.run(&["uci", "get", "network.lan.ipaddr"])?;
        let netmask = session.run(&["uci", "get", "network.lan.netmask"])?;
        Ok(NetworkConfig::Static {
            ipaddr: ipaddr.first_line().to_string(),
            netmask: netmask.first_line().to_string(),
            gateway: uci_get(session, "gateway").unwrap_or_default(),
            dns: uci_get(session, "dns")
                .map(|d| d.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    /// Content of the vendor `network.conf`.
    pub fn render(&self) -> String {
        match self {
            NetworkConfig::Dhcp { hostname } => {
                format!("hostname={}\ndhcp=true\n", hostname)
            }
            NetworkConfig::Static {
                ipaddr,
                netmask,
                gateway,
                dns,
            } => format!(
                "hostname={}\nipaddress={}\nnetmask={}\ngateway={}\ndnsservers=\"{}\"\n",
                FACTORY_HOSTNAME,
                ipaddr,
                netmask,
                gateway,
                dns.join(" ")
            ),
        }
    }
}

fn append_file<W: std::io::Write>(
    tar: &mut tar::Builder<W>,
    path: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, path, body)
}

/// Write a vendor `config.tar.gz` holding `config/mac` and `config/network.conf`.
pub fn write_config_archive(out: &Path, mac: &str, network: &NetworkConfig) -> ToolboxResult<()> {
    let file = File::create(out)?;
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    append_file(&mut tar, "config/mac", format!("{}\n", mac).as_bytes())?;
    append_file(&mut tar, "config/network.conf", network.render().as_bytes())?;
    tar.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_transport::{ConnectTarget, FakeDevice, FakeResponse, FakeTransport, Transport};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    const MAC: &str = "00:1a:2b:3c:4d:5e";

    fn query(device: FakeDevice) -> NetworkConfig {
        let fake = FakeTransport::new().with_device("h", device);
        let session = fake.connect(&ConnectTarget::new("h", "root", None)).unwrap();
        NetworkConfig::query(&*session, MAC).unwrap()
    }

    #[test]
    fn default_bos_hostname_is_not_carried_over() {
        let config = query(
            FakeDevice::new()
                .on_command("network.lan.proto", FakeResponse::stdout("dhcp\n"))
                .on_command("network.lan.hostname", FakeResponse::fail(1, "Entry not found"))
                .with_file("/proc/sys/kernel/hostname", "miner-3c4d5e\n"),
        );
        assert_eq!(
            config,
            NetworkConfig::Dhcp {
                hostname: FACTORY_HOSTNAME.into()
            }
        );
    }

    #[test]
    fn custom_dhcp_hostname_is_kept() {
        let config = query(
            FakeDevice::new()
                .on_command("network.lan.proto", FakeResponse::stdout("dhcp\n"))
                .on_command("network.lan.hostname", FakeResponse::stdout("rack7-slot3\n")),
        );
        assert_eq!(config.render(), "hostname=rack7-slot3\ndhcp=true\n");
    }

    #[test]
    fn static_configuration_renders_vendor_keys() {
        let config = query(
            FakeDevice::new()
                .on_command("network.lan.proto", FakeResponse::stdout("static\n"))
                .on_command("network.lan.ipaddr", FakeResponse::stdout("10.0.0.5\n"))
                .on_command("network.lan.netmask", FakeResponse::stdout("255.255.255.0\n"))
                .on_command("network.lan.gateway", FakeResponse::stdout("10.0.0.1\n"))
                .on_command("network.lan.dns", FakeResponse::stdout("1.1.1.1 8.8.8.8\n")),
        );
        assert_eq!(
            config.render(),
            "hostname=antMiner\nipaddress=10.0.0.5\nnetmask=255.255.255.0\n\
             gateway=10.0.0.1\ndnsservers=\"1.1.1.1 8.8.8.8\"\n"
        );
    }

    #[test]
    fn archive_contains_mac_and_network() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("config.tar.gz");
        let network = NetworkConfig::Dhcp {
            hostname: "antMiner".into(),
        };
        write_config_archive(&out, MAC, &network).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        let mut names = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            if name == "config/mac" {
                assert_eq!(body, "00:1a:2b:3c:4d:5e\n");
            }
            names.push(name);
        }
        assert_eq!(names, vec!["config/mac", "config/network.conf"]);
    }
}

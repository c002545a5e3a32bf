//! Partition layouts in the kernel `mtdparts=` notation.
//!
//! `mtdparts=<device>:<size>(<name>),<size>(<name>),...` is how the device, its
//! bootloader environment and the recovery bootstrap describe flash partitions.

use bos_error::ParseError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const MTDPARTS_PREFIX: &str = "mtdparts=";

/// Layout the vendor firmware ships with; used when no backup supplies one.
pub const FACTORY_MTDPARTS: &str = "mtdparts=pl35x-nand:40m(BOOT.bin-env-dts-kernel),\
32m(ramfs),8m(configs),16m(reserve),32m(ramfs-bak),128m(reserve1)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Size token exactly as written, e.g. `40m`, `0x100000` or `-`.
    pub size: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLayout {
    pub device: String,
    pub partitions: Vec<Partition>,
}

fn invalid(input: &str, reason: impl Into<String>) -> ParseError {
    ParseError {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn valid_size(size: &str) -> bool {
    if size == "-" {
        return true;
    }
    if let Some(hex) = size.strip_prefix("0x") {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    let digits = size.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    // At most one unit suffix.
    size.len() - digits.len() <= 1 && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

impl PartitionLayout {
    /// Parse a full `mtdparts=` string. The whole input must be consumed.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let body = input
            .trim()
            .strip_prefix(MTDPARTS_PREFIX)
            .ok_or_else(|| invalid(input, "missing mtdparts= prefix"))?;
        if body.contains(';') {
            return Err(invalid(input, "only a single flash device is supported"));
        }
        let (device, list) = body
            .split_once(':')
            .ok_or_else(|| invalid(input, "missing ':' after device name"))?;
        if device.is_empty() || device.contains(['(', ')', ',', ' ']) {
            return Err(invalid(input, "bad device name"));
        }
        if list.is_empty() {
            return Err(invalid(input, "no partitions listed"));
        }

        let mut partitions = Vec::new();
        for entry in list.split(',') {
            let open = entry
                .find('(')
                .ok_or_else(|| invalid(input, format!("partition {:?} has no name", entry)))?;
            let (size, rest) = entry.split_at(open);
            let name = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| invalid(input, format!("unterminated name in {:?}", entry)))?;
            if name.is_empty() || name.contains(['(', ')']) {
                return Err(invalid(input, format!("bad partition name in {:?}", entry)));
            }
            if !valid_size(size) {
                return Err(invalid(input, format!("bad partition size {:?}", size)));
            }
            if partitions.iter().any(|p: &Partition| p.name == name) {
                return Err(invalid(input, format!("duplicate partition name {:?}", name)));
            }
            partitions.push(Partition {
                size: size.to_string(),
                name: name.to_string(),
            });
        }

        Ok(Self {
            device: device.to_string(),
            partitions,
        })
    }

    /// The layout the vendor firmware ships with.
    pub fn factory() -> Result<Self, ParseError> {
        Self::parse(FACTORY_MTDPARTS)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.partitions.iter().map(|p| p.name.as_str())
    }

    /// MTD index of a partition, i.e. the `N` in `/dev/mtdN`.
    pub fn mtd_index(&self, name: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.name == name)
    }

    /// Dump file name for a partition inside a backup set.
    pub fn dump_file(name: &str) -> String {
        format!("{}.bin", name)
    }

    /// Find and parse the layout in a bootloader environment dump (`key=value` lines).
    ///
    /// Both `mtdparts=mtdparts=dev:...` and the bare `mtdparts=dev:...` spelling are
    /// accepted.
    pub fn from_env(env: &BTreeMap<String, String>) -> Option<Result<Self, ParseError>> {
        let value = env.get("mtdparts")?;
        let full = if value.starts_with(MTDPARTS_PREFIX) {
            value.clone()
        } else {
            format!("{}{}", MTDPARTS_PREFIX, value)
        };
        Some(Self::parse(&full))
    }
}

impl FromStr for PartitionLayout {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PartitionLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:", MTDPARTS_PREFIX, self.device)?;
        for (i, part) in self.partitions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}({})", part.size, part.name)?;
        }
        Ok(())
    }
}

/// Parse `key=value` lines as printed by `fw_printenv`.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

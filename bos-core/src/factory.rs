//! Vendor firmware images for restores without a storage dump.
//!
//! Images come from a local path or an HTTP(S) URL. Only images with a known MD5
//! digest are accepted; each member of the archive is streamed to the device.

use crate::progress::log_progress;
use bos_error::{StopKind, ToolboxError, ToolboxResult};
use bos_transport::FileChannel;
use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// MD5 digests of vendor images known to restore cleanly.
pub const SUPPORTED_IMAGE_DIGESTS: &[&str] = &["200654af5ea5f22b479049c5a8269b3d"];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

fn unavailable(message: impl Into<String>) -> ToolboxError {
    ToolboxError::platform(StopKind::Prerequisite, message)
}

/// An opened, digest-checked factory image.
#[derive(Debug)]
pub struct FactoryImage {
    file: File,
    digest: String,
}

impl FactoryImage {
    /// Open a local file or download a URL, then check its digest against `supported`.
    pub fn open(source: &str, supported: &[&str]) -> ToolboxResult<Self> {
        let file = if Path::new(source).is_file() {
            File::open(source)?
        } else {
            match Url::parse(source) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => download(&url)?,
                _ => {
                    return Err(unavailable(format!(
                        "Factory image '{}' not found",
                        source
                    )))
                }
            }
        };
        Self::from_file(file, supported)
    }

    fn from_file(mut file: File, supported: &[&str]) -> ToolboxResult<Self> {
        let digest = md5_hex(&mut file)?;
        if !supported.contains(&digest.as_str()) {
            return Err(unavailable(format!(
                "Unsupported factory image with MD5 digest: {}",
                digest
            )));
        }
        Ok(Self { file, digest })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Stream every regular file of the image into the channel's current directory.
    /// Returns the uploaded member names.
    pub fn upload_members(&mut self, channel: &mut dyn FileChannel) -> ToolboxResult<Vec<String>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 2];
        let gzip = self.file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
        self.file.seek(SeekFrom::Start(0))?;
        let reader: Box<dyn Read + '_> = if gzip {
            Box::new(GzDecoder::new(&mut self.file))
        } else {
            Box::new(&mut self.file)
        };

        let mut archive = tar::Archive::new(reader);
        let mut uploaded = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let size = entry.header().size()?;
            channel.put_reader(&mut entry, size, &name, &mut log_progress(&name))?;
            uploaded.push(name);
        }
        Ok(uploaded)
    }
}

fn md5_hex(file: &mut File) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn download(url: &Url) -> ToolboxResult<File> {
    log::info!("Downloading factory image from {}...", url);
    let client = Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent("bos-toolbox")
        .build()
        .map_err(|e| unavailable(format!("HTTP client: {}", e)))?;
    let mut response = client
        .get(url.clone())
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| unavailable(format!("Cannot download factory image: {}", e)))?;
    let mut file = tempfile::tempfile()?;
    let size = io::copy(&mut response, &mut file)?;
    log::info!("Downloaded {}", crate::progress::format_size(size));
    Ok(file)
}

use std::io;
use std::path::Path;
use std::sync::Arc;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

use crate::error::TransferError;

/// Space kept free on the local volume on top of the payload itself.
pub const DISK_HEADROOM_BYTES: u64 = 100_000;

pub trait DiskProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space of the volume holding `path`.
pub struct VolumeProbe;

impl DiskProbe for VolumeProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Refuses a payload of `expected` bytes unless it fits with headroom to spare.
pub fn admit(expected: u64, available: u64) -> Result<(), TransferError> {
    if expected.checked_add(DISK_HEADROOM_BYTES).map_or(true, |need| need > available) {
        return Err(TransferError::DiskFull { expected, available });
    }
    Ok(())
}

pub struct FileTransfer {
    client: reqwest::Client,
    probe: Arc<dyn DiskProbe>,
}

impl FileTransfer {
    pub fn new(probe: Arc<dyn DiskProbe>) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe,
        }
    }

    /// Copies the payload at `locator` (an http(s) URL, a `file://` URL or a
    /// plain path) into `dest`, after checking the volume under `volume` has
    /// room for it. On any error `dest` does not exist afterwards.
    pub async fn fetch(&self, locator: &str, dest: &Path, volume: &Path) -> Result<u64, TransferError> {
        let result = match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.fetch_remote(url, dest, volume).await,
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => self.copy_local(&path, dest, volume).await,
                Err(()) => Err(TransferError::Source(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a local path", locator),
                ))),
            },
            _ => self.copy_local(Path::new(locator), dest, volume).await,
        };

        match result {
            Ok(written) => {
                info!("Audio file of {} bytes saved to {}", written, dest.display());
                Ok(written)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(dest).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", dest.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    // probed right before writing, never cached
    fn check_space(&self, expected: u64, volume: &Path) -> Result<(), TransferError> {
        let available = self.probe.available_space(volume).map_err(TransferError::Probe)?;
        info!("Local disk available space: {} bytes", available);
        admit(expected, available)
    }

    async fn fetch_remote(&self, url: Url, dest: &Path, volume: &Path) -> Result<u64, TransferError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }

        let expected = match response.content_length() {
            Some(length) => length,
            None => {
                warn!("Payload at {} has no content length, admitting on headroom only", url);
                0
            }
        };
        self.check_space(expected, volume)?;

        let mut file = fs::File::create(dest).await.map_err(TransferError::Write)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(TransferError::Write)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(TransferError::Write)?;
        file.sync_all().await.map_err(TransferError::Write)?;
        Ok(written)
    }

    async fn copy_local(&self, source: &Path, dest: &Path, volume: &Path) -> Result<u64, TransferError> {
        let expected = fs::metadata(source).await.map_err(TransferError::Source)?.len();
        self.check_space(expected, volume)?;

        let mut reader = fs::File::open(source).await.map_err(TransferError::Source)?;
        let mut file = fs::File::create(dest).await.map_err(TransferError::Write)?;
        let written = tokio::io::copy(&mut reader, &mut file).await.map_err(TransferError::Write)?;
        file.sync_all().await.map_err(TransferError::Write)?;
        Ok(written)
    }
}

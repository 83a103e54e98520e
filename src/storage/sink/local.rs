use std::path::PathBuf;
use async_trait::async_trait;
use anyhow::{Context, Result};
use tokio::fs;
use tracing::info;
use url::Url;

use super::object::object_url;
use super::StorageSink;

/// Writes archives into a directory shared with the consumers of the results.
pub struct LocalDirSink {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalDirSink {
    pub fn new(root: PathBuf, base_url: Option<String>) -> Self {
        Self { root, base_url }
    }

    async fn locator(&self, key: &str, path: &std::path::Path) -> Result<String> {
        match &self.base_url {
            Some(base) => {
                let url = Url::parse(base).with_context(|| format!("invalid base url {}", base))?;
                object_url(&url, key)
            }
            None => {
                let path = fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
                Ok(path.display().to_string())
            }
        }
    }
}

#[async_trait]
impl StorageSink for LocalDirSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        let path = self.root.join(key);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        info!("TRANSCRIPT: {} stored in {}", key, self.root.display());
        self.locator(key, &path).await
    }
}

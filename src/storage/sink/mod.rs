use std::sync::Arc;
use async_trait::async_trait;
use anyhow::Result;
use tracing::info;

use crate::config::StorageConfig;

pub mod local;
pub mod object;

pub use local::LocalDirSink;
pub use object::ObjectStoreSink;

/// Durable destination for finished archives.
#[async_trait]
pub trait StorageSink: Send + Sync + 'static {
    /// Stores `bytes` under `key` and returns where the object can be found.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Builds the sink selected in configuration; chosen once at startup.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn StorageSink>> {
    info!("Initializing {} storage sink", config.kind());
    let sink: Arc<dyn StorageSink> = match config {
        StorageConfig::Aws { bucket, region, access_key_id, secret_access_key, endpoint } => {
            Arc::new(ObjectStoreSink::s3(
                bucket,
                region,
                access_key_id.as_deref(),
                secret_access_key.as_deref(),
                endpoint.as_deref(),
            )?)
        }
        StorageConfig::Azure { account, account_key, container } => {
            Arc::new(ObjectStoreSink::azure(account, account_key, container)?)
        }
        StorageConfig::Local { root, base_url } => {
            Arc::new(LocalDirSink::new(root.clone(), base_url.clone()))
        }
    };
    Ok(sink)
}

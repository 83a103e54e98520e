use async_trait::async_trait;
use anyhow::{Context, Result};
use opendal::{services, Operator};
use tracing::info;
use url::Url;

use super::StorageSink;

/// Cloud object storage (S3 or Azure Blob) reached through OpenDAL.
pub struct ObjectStoreSink {
    operator: Operator,
    /// Public URL of the bucket or container; object keys are appended to it.
    base_url: Url,
    label: String,
}

impl ObjectStoreSink {
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self> {
        let mut builder = services::S3::default().bucket(bucket).region(region);
        if let Some(key) = access_key_id {
            builder = builder.access_key_id(key);
        }
        if let Some(secret) = secret_access_key {
            builder = builder.secret_access_key(secret);
        }

        let base_url = match endpoint {
            Some(endpoint) => {
                builder = builder.endpoint(endpoint);
                format!("{}/{}", endpoint.trim_end_matches('/'), bucket)
            }
            None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
        };

        Ok(Self {
            operator: Operator::new(builder)?.finish(),
            base_url: Url::parse(&base_url).with_context(|| format!("invalid S3 url {}", base_url))?,
            label: format!("AWS bucket {}", bucket),
        })
    }

    pub fn azure(account: &str, account_key: &str, container: &str) -> Result<Self> {
        let endpoint = format!("https://{}.blob.core.windows.net", account);
        let builder = services::Azblob::default()
            .endpoint(&endpoint)
            .account_name(account)
            .account_key(account_key)
            .container(container);

        let base_url = format!("{}/{}", endpoint, container);
        Ok(Self {
            operator: Operator::new(builder)?.finish(),
            base_url: Url::parse(&base_url).with_context(|| format!("invalid Azure url {}", base_url))?,
            label: format!("Azure storage container {}", container),
        })
    }
}

/// `base` with `key` appended as a single percent-encoded path segment.
pub(crate) fn object_url(base: &Url, key: &str) -> Result<String> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("{} cannot carry a path", base))?
        .pop_if_empty()
        .push(key);
    Ok(url.to_string())
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.operator
            .write(key, bytes)
            .await
            .with_context(|| format!("failed to upload {} to {}", key, self.label))?;

        info!("TRANSCRIPT: {} uploaded to {}", key, self.label);
        object_url(&self.base_url, key)
    }
}

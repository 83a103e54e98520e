use std::env;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::Serialize;

const DEFAULT_POLLING_PERIOD_MS: u64 = 15_000;
const DEFAULT_DECODER_START_WAIT_MS: u64 = 30_000;
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_REMOTE_IPV4_URL: &str = "https://api.ipify.org";

/// Agent settings, read from the environment with `.env` as fallback.
#[derive(Debug, Clone)]
pub struct Config {
    pub controller_url: String,
    pub poll_interval: Duration,
    pub decoder_start_timeout: Duration,
    pub port: u16,
    pub queue: String,
    pub language: String,
    pub sampling_rate: String,
    pub remote_ipv4_url: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub details_dir: PathBuf,
    pub log_dir: String,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Aws {
        bucket: String,
        region: String,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint: Option<String>,
    },
    Azure {
        account: String,
        account_key: String,
        container: String,
    },
    Local {
        root: PathBuf,
        base_url: Option<String>,
    },
}

/// The tags this worker advertises when reserving work.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerProfile {
    pub name: String,
    pub queue: String,
    pub language: String,
    pub sampling_rate: String,
}

fn var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
    .filter(|value| !value.trim().is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn required(key: &str) -> Result<String> {
    var(key).with_context(|| format!("environment variable {} is not set", key))
}

fn millis(key: &str, default: u64) -> Result<Duration> {
    match var(key) {
        Some(value) => {
            let ms = value
                .parse::<u64>()
                .with_context(|| format!("{} must be a number of milliseconds, got {:?}", key, value))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = match var("PORT") {
            Some(value) => value.parse().with_context(|| format!("invalid PORT {:?}", value))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            controller_url: required("TASKCONTROLLER_URL")?.trim_end_matches('/').to_string(),
            poll_interval: millis("POLLING_PERIOD", DEFAULT_POLLING_PERIOD_MS)?,
            decoder_start_timeout: millis("DECODER_START_WAIT_TIME", DEFAULT_DECODER_START_WAIT_MS)?,
            port,
            queue: var_or("WORKER_QUEUE", "normal"),
            language: var_or("WORKER_LANGUAGE", "en"),
            sampling_rate: var_or("WORKER_SAMPLING_RATE", "16khz").to_lowercase(),
            remote_ipv4_url: var_or("REMOTE_IPV4_URL", DEFAULT_REMOTE_IPV4_URL),
            input_dir: PathBuf::from(var_or("AGENT_INPUT_DIR", "./input")),
            output_dir: PathBuf::from(var_or("AGENT_OUTPUT_DIR", "./output")),
            details_dir: PathBuf::from(var_or("AGENT_DETAILS_DIR", "./details")),
            log_dir: var_or("AGENT_LOG_DIR", "./logs"),
            storage: StorageConfig::from_env()?,
        })
    }

    pub fn profile(&self, name: String) -> WorkerProfile {
        WorkerProfile {
            name,
            queue: self.queue.clone(),
            language: self.language.clone(),
            sampling_rate: self.sampling_rate.clone(),
        }
    }
}

impl StorageConfig {
    fn from_env() -> Result<Self> {
        match var_or("USE_STORAGE", "local").to_lowercase().as_str() {
            "aws" => Ok(StorageConfig::Aws {
                bucket: required("AWS_BUCKET")?,
                region: var_or("AWS_REGION", "us-east-1"),
                access_key_id: var("AWS_ACCESS_KEY_ID"),
                secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
                endpoint: var("AWS_ENDPOINT"),
            }),
            "azure" => Ok(StorageConfig::Azure {
                account: required("AZURE_ACCOUNT")?,
                account_key: required("AZURE_ACCOUNT_KEY")?,
                container: required("AZURE_CONTAINER")?,
            }),
            "local" => Ok(StorageConfig::Local {
                root: PathBuf::from(var_or("LOCAL_STORAGE_DIR", "./transcripts")),
                base_url: var("LOCAL_STORAGE_BASE_URL"),
            }),
            other => Err(anyhow::anyhow!("unknown USE_STORAGE backend: {}", other)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Aws { .. } => "aws",
            StorageConfig::Azure { .. } => "azure",
            StorageConfig::Local { .. } => "local",
        }
    }
}

/// Resolves `"{external_ipv4}-{hostname}"`, falling back to a placeholder
/// address when the lookup service is unreachable.
pub async fn resolve_worker_name(remote_ipv4_url: &str) -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());

    let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(_) => return format!("ipv4address-{}", hostname),
    };

    let address = match client.get(remote_ipv4_url).send().await {
        Ok(response) if response.status().is_success() => response.text().await.ok(),
        Ok(response) => {
            tracing::debug!("external ipv4 lookup answered {}", response.status());
            None
        }
        Err(e) => {
            tracing::debug!("external ipv4 lookup failed: {}", e);
            None
        }
    };

    match address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) {
        Some(address) => format!("{}-{}", address, hostname),
        None => format!("ipv4address-{}", hostname),
    }
}

use async_trait::async_trait;
use anyhow::{Context, Result};
use tracing::debug;

pub mod protocol;

pub use protocol::{Report, ReserveRequest, ReserveResponse, ReservedTask, TaskData};

/// The reservation/report protocol spoken with the task controller.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// `Ok(None)` means the controller has no work for this worker.
    async fn reserve(&self, request: &ReserveRequest) -> Result<Option<ReservedTask>>;
    async fn report(&self, task_id: &str, report: &Report) -> Result<()>;
}

// HTTP implementation
pub struct HttpControllerClient {
    client: reqwest::Client,
    endpoint: String,
    worker: String,
}

impl HttpControllerClient {
    pub fn new(endpoint: String, worker: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            worker,
        }
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Option<ReservedTask>> {
        let text = self.client
            .post(format!("{}/tasks/actions", self.endpoint))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let text = text.trim();
        if text.is_empty() || text == "null" {
            return Ok(None);
        }

        let response: ReserveResponse = serde_json::from_str(text)
            .context("malformed reservation response")?;
        Ok(response.task)
    }

    async fn report(&self, task_id: &str, report: &Report) -> Result<()> {
        debug!("Posting {} report for task {}", report.kind(), task_id);
        self.client
            .post(format!("{}/tasks/{}/actions", self.endpoint, task_id))
            .json(&report.body(&self.worker))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

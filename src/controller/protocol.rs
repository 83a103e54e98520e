use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::WorkerProfile;
use crate::error::FailureCode;

#[derive(Debug, Clone, Serialize)]
pub struct ReserveRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub worker: String,
    pub lang: String,
    pub queue: String,
    pub sampling: String,
}

impl From<&WorkerProfile> for ReserveRequest {
    fn from(profile: &WorkerProfile) -> Self {
        Self {
            kind: "reserve",
            worker: profile.name.clone(),
            lang: profile.language.clone(),
            queue: profile.queue.clone(),
            sampling: profile.sampling_rate.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReserveResponse {
    #[serde(default)]
    pub task: Option<ReservedTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservedTask {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    pub data: TaskData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskData {
    pub filename: String,
    #[serde(rename = "cloud-link")]
    pub cloud_link: String,
    #[serde(default)]
    pub formats: Option<Vec<String>>,
    #[serde(rename = "numChn", default)]
    pub num_chn: Option<u32>,
    #[serde(rename = "type", default)]
    pub recording_type: Option<String>,
    #[serde(rename = "customData", default)]
    pub custom_data: Option<Map<String, Value>>,
}

/// A status message for the task controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Progress(String),
    Success { locator: String },
    Error(FailureCode),
    Retry,
}

impl Report {
    pub fn kind(&self) -> &'static str {
        match self {
            Report::Progress(_) => "progress",
            Report::Success { .. } => "success",
            Report::Error(_) => "error",
            Report::Retry => "retry",
        }
    }

    /// Request body as posted to `/tasks/{task_id}/actions`.
    pub fn body(&self, worker: &str) -> Value {
        match self {
            Report::Progress(status) => json!({
                "type": "progress",
                "worker": worker,
                "progress": status,
            }),
            Report::Success { locator } => json!({
                "type": "success",
                "worker": worker,
                "result": { "cloud-link": locator },
            }),
            Report::Error(code) => json!({
                "type": "error",
                "worker": worker,
                "err_code": code,
            }),
            Report::Retry => json!({ "type": "retry" }),
        }
    }
}

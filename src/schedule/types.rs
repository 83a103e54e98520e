use std::fmt::Display;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::controller::ReservedTask;
use crate::error::FailureCode;

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "mp4", "aac", "ac3", "aiff", "amr", "flac", "m4a", "ogg", "opus", "wma", "ts",
];

pub fn is_supported_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// The unit of work owned by the lifecycle controller.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Absent for files dropped into the input area by hand.
    pub task_id: Option<String>,
    pub original_filename: String,
    /// Name reported back by the decoder; authoritative for file lookups.
    pub converted_filename: String,
    pub source_locator: String,
    pub channel_count: Option<u32>,
    pub output_formats: Option<Vec<String>>,
    pub recording_type: Option<String>,
    pub custom_data: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl From<ReservedTask> for Task {
    fn from(reserved: ReservedTask) -> Self {
        let data = reserved.data;
        Self {
            task_id: reserved.task_id,
            converted_filename: data.filename.clone(),
            original_filename: data.filename,
            source_locator: data.cloud_link,
            channel_count: data.num_chn,
            output_formats: data.formats,
            recording_type: data.recording_type,
            custom_data: data.custom_data.unwrap_or_default(),
            received_at: Utc::now(),
        }
    }
}

impl Task {
    /// A task adopted from a decoder callback with no reservation behind it.
    pub fn direct(filename: &str) -> Self {
        Self {
            task_id: None,
            original_filename: filename.to_string(),
            converted_filename: filename.to_string(),
            source_locator: String::new(),
            channel_count: None,
            output_formats: None,
            recording_type: None,
            custom_data: Map::new(),
            received_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        self.task_id.as_deref().unwrap_or("<direct>")
    }

    /// File names this task may have left in the work areas.
    pub fn filenames(&self) -> [&str; 2] {
        [self.converted_filename.as_str(), self.original_filename.as_str()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Idle,
    Downloading,
    AwaitingDecoderStart,
    Processing,
    Finalizing,
}

impl LifecycleState {
    pub fn is_idle(&self) -> bool {
        matches!(self, LifecycleState::Idle)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Payload written to the staging area and waiting to be handed over.
#[derive(Debug)]
pub struct StagedPayload {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Inputs of the lifecycle state machine, processed strictly one at a time.
#[derive(Debug)]
pub enum TaskEvent {
    Reserved(ReservedTask),
    Downloaded {
        attempt: u64,
        result: Result<StagedPayload, FailureCode>,
    },
    DecoderStatus {
        filename: String,
        status: String,
    },
    DecoderError {
        message: String,
    },
    Finalized {
        attempt: u64,
        result: Result<String, FailureCode>,
    },
    Retry,
    Shutdown(oneshot::Sender<()>),
}

/// Significant part of a decoder status label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderSignal {
    Starting,
    Done,
    Progress,
}

impl DecoderSignal {
    pub fn parse(status: &str) -> Self {
        match status.split_whitespace().next() {
            Some("STARTING") => DecoderSignal::Starting,
            Some("DONE") => DecoderSignal::Done,
            _ => DecoderSignal::Progress,
        }
    }
}

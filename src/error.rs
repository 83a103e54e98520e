use std::fmt::Display;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Code reported to the task controller when a task ends in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCode {
    TaskObjectError,
    FileExtensionNotSupported,
    DownloadError,
    LocaldiskFull,
    SavingAudiofileError,
    DecoderDidNotStart,
    TranscriptionsNotFound,
    ArchiveError,
    UploadError,
    ContainerShutdown,
    /// Message passed through verbatim from the decoder's error callback.
    Decoder(String),
}

impl FailureCode {
    pub fn as_str(&self) -> &str {
        match self {
            FailureCode::TaskObjectError => "TASK_OBJECT_ERROR",
            FailureCode::FileExtensionNotSupported => "FILE_EXTENSION_NOT_SUPPORTED",
            FailureCode::DownloadError => "DOWNLOAD_ERROR",
            FailureCode::LocaldiskFull => "LOCALDISK_FULL",
            FailureCode::SavingAudiofileError => "SAVING_AUDIOFILE_ERROR",
            FailureCode::DecoderDidNotStart => "DECODER_DID_NOT_START",
            FailureCode::TranscriptionsNotFound => "TRANSCRIPTIONS_NOT_FOUND",
            FailureCode::ArchiveError => "ARCHIVE_ERROR",
            FailureCode::UploadError => "UPLOAD_ERROR",
            FailureCode::ContainerShutdown => "CONTAINER_SHUTDOWN",
            FailureCode::Decoder(message) => message,
        }
    }
}

impl Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailureCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Failures while admitting and streaming a payload into the work area.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("not enough disk space: {expected} bytes needed, {available} available")]
    DiskFull { expected: u64, available: u64 },
    #[error("failed to probe available disk space: {0}")]
    Probe(#[source] std::io::Error),
    #[error("payload request failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("payload source answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("cannot read payload source: {0}")]
    Source(#[source] std::io::Error),
    #[error("failed to write payload: {0}")]
    Write(#[source] std::io::Error),
}

impl TransferError {
    pub fn failure_code(&self) -> FailureCode {
        match self {
            TransferError::DiskFull { .. } => FailureCode::LocaldiskFull,
            TransferError::Download(_) | TransferError::Status(_) | TransferError::Source(_) => {
                FailureCode::DownloadError
            }
            TransferError::Probe(_) | TransferError::Write(_) => FailureCode::SavingAudiofileError,
        }
    }
}

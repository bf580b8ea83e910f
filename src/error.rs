//! Error taxonomy surfaced to API clients.

use thiserror::Error;

/// Errors returned to callers of the detection API.
///
/// `InputMissing`, `UnsupportedFormat` and `MalformedUpload` are raised by the
/// upload layer before the simulator runs. `ProcessingFailure` wraps anything
/// that goes wrong inside the simulation itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectError {
    #[error("{0}")]
    InputMissing(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read upload: {0}")]
    MalformedUpload(String),

    #[error("Detection failed: {0}")]
    ProcessingFailure(String),
}

impl DetectError {
    pub fn no_file() -> Self {
        Self::InputMissing("No file uploaded".to_string())
    }

    pub fn no_filename() -> Self {
        Self::InputMissing("No file selected".to_string())
    }

    /// Stable identifier for logs and the access log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputMissing(_) => "input_missing",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::MalformedUpload(_) => "malformed_upload",
            Self::ProcessingFailure(_) => "processing_failure",
        }
    }

    /// True for errors caused by the request rather than the simulator.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::ProcessingFailure(_))
    }
}

impl From<eyre::Report> for DetectError {
    fn from(e: eyre::Report) -> Self {
        Self::ProcessingFailure(format!("{:#}", e))
    }
}

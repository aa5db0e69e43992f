use thiserror::Error;
use video_ingest::CaptureError;

use crate::detector::DetectorKind;

/// Operator-facing failures of pipeline control operations.
///
/// Transient live read failures and end-of-stream are handled inside the tick
/// and never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{} is unavailable: its model failed to load", .0.title())]
    ModelUnavailable(DetectorKind),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
}

impl PipelineError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }
}

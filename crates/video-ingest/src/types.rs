use std::{fmt, time::Duration};

use anyhow::Error;
use thiserror::Error;

/// Raw BGR8 frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Whether frames come from a capture device or a decoded file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Live,
    File,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Live => "live",
            SourceKind::File => "file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parameters for opening a capture session.
#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub kind: SourceKind,
    /// File path for [`SourceKind::File`], device index or URI for [`SourceKind::Live`].
    pub uri: String,
    /// Frames are delivered at this (width, height).
    pub target_size: (i32, i32),
    /// Upper bound a live read may block before it is reported as transient.
    pub read_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}

/// Outcome of a failed read on an open session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("end of stream")]
    EndOfStream,
    #[error("transient read failure: {0}")]
    Transient(String),
}

/// An open capture session yielding one frame per read.
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    fn read_frame(&mut self) -> Result<Frame, ReadError>;

    /// Release the underlying decoder or device. Further reads report end of stream.
    fn close(&mut self);
}

/// Opens capture sessions. The pipeline owns exactly one backend.
pub trait CaptureBackend: Send {
    fn open(&mut self, request: &OpenRequest) -> Result<Box<dyn FrameSource>, CaptureError>;
}

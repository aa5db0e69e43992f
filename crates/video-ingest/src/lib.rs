//! Capture collaborator for the detection pipeline: opens a live device or a
//! video file and yields BGR8 frames at a fixed target size.

#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod session;
pub mod types;

pub use session::{ChannelSource, SystemCapture};
pub use types::{
    CaptureBackend, CaptureError, Frame, FrameFormat, FrameSource, OpenRequest, ReadError,
    SourceKind,
};

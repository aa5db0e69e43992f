//! Channel-backed capture sessions and the default capture backend.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::{
    ffmpeg::{self, FrameReceiver, ProcessHandle},
    types::{CaptureBackend, CaptureError, Frame, FrameSource, OpenRequest, ReadError, SourceKind},
};

/// A capture session fed by a background reader thread.
///
/// Reads wait at most `read_timeout`. A stalled reader is a transient failure
/// for both kinds; a finished decoder ends a file stream.
pub struct ChannelSource {
    kind: SourceKind,
    rx: Option<FrameReceiver>,
    process: Option<ProcessHandle>,
    stop: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl ChannelSource {
    pub(crate) fn new(
        kind: SourceKind,
        rx: FrameReceiver,
        process: Option<ProcessHandle>,
        stop: Arc<AtomicBool>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            rx: Some(rx),
            process,
            stop,
            read_timeout,
        }
    }
}

impl FrameSource for ChannelSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let Some(rx) = self.rx.as_ref() else {
            return Err(ReadError::EndOfStream);
        };
        match self.kind {
            SourceKind::File => match rx.recv_timeout(self.read_timeout) {
                Ok(Ok(frame)) => Ok(frame),
                Ok(Err(err)) => {
                    warn!("file decode failed: {err}");
                    Err(ReadError::EndOfStream)
                }
                Err(RecvTimeoutError::Timeout) => Err(ReadError::Transient(format!(
                    "decoder produced no frame within {} ms",
                    self.read_timeout.as_millis()
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(ReadError::EndOfStream),
            },
            SourceKind::Live => match rx.recv_timeout(self.read_timeout) {
                Ok(Ok(frame)) => Ok(frame),
                Ok(Err(err)) => Err(ReadError::Transient(err.to_string())),
                Err(RecvTimeoutError::Timeout) => Err(ReadError::Transient(format!(
                    "no frame within {} ms",
                    self.read_timeout.as_millis()
                ))),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(ReadError::Transient("capture thread disconnected".into()))
                }
            },
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.rx = None;
        if let Some(process) = self.process.take() {
            process.kill();
        }
        debug!("closed {} capture session", self.kind);
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default backend: ffmpeg for files, OpenCV (or ffmpeg V4L2 without the
/// `opencv` feature) for live devices.
#[derive(Default)]
pub struct SystemCapture;

impl CaptureBackend for SystemCapture {
    fn open(&mut self, request: &OpenRequest) -> Result<Box<dyn FrameSource>, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let source = match request.kind {
            SourceKind::File => {
                let (rx, process) =
                    ffmpeg::spawn_file_reader(Path::new(&request.uri), request.target_size)?;
                ChannelSource::new(
                    SourceKind::File,
                    rx,
                    Some(process),
                    stop,
                    request.read_timeout,
                )
            }
            SourceKind::Live => open_live(request, stop)?,
        };
        info!(
            "opened {} capture {} at {}x{}",
            request.kind, request.uri, request.target_size.0, request.target_size.1
        );
        Ok(Box::new(source))
    }
}

#[cfg(feature = "opencv")]
fn open_live(request: &OpenRequest, stop: Arc<AtomicBool>) -> Result<ChannelSource, CaptureError> {
    let rx = crate::camera::spawn_camera_reader(&request.uri, request.target_size, stop.clone())?;
    Ok(ChannelSource::new(
        SourceKind::Live,
        rx,
        None,
        stop,
        request.read_timeout,
    ))
}

#[cfg(not(feature = "opencv"))]
fn open_live(request: &OpenRequest, stop: Arc<AtomicBool>) -> Result<ChannelSource, CaptureError> {
    let (rx, process) = ffmpeg::spawn_v4l2_reader(&request.uri, request.target_size)?;
    Ok(ChannelSource::new(
        SourceKind::Live,
        rx,
        Some(process),
        stop,
        request.read_timeout,
    ))
}

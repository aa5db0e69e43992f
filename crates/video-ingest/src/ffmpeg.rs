//! FFmpeg raw-video pipe readers for files and V4L2 devices.

use std::{
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, FrameFormat};

/// Handle to a running ffmpeg process; killing it ends the reader thread.
#[derive(Clone)]
pub struct ProcessHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl ProcessHandle {
    fn new(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(Some(child))),
        }
    }

    /// Kill and reap the process. Safe to call more than once.
    pub fn kill(&self) {
        let child = match self.child.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub(crate) type FrameReceiver = Receiver<Result<Frame, CaptureError>>;

/// Decode a video file to BGR8 frames scaled to `target_size`.
///
/// The channel closes without an error once ffmpeg reaches the end of the file.
pub fn spawn_file_reader(
    path: &Path,
    target_size: (i32, i32),
) -> Result<(FrameReceiver, ProcessHandle), CaptureError> {
    if !path.is_file() {
        return Err(CaptureError::Open {
            uri: path.display().to_string(),
        });
    }
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-nostdin")
        .arg("-i")
        .arg(path)
        .arg("-an");
    push_output_args(&mut cmd, target_size);
    spawn_ffmpeg_reader(cmd, target_size, 4)
}

/// Capture from a V4L2 device (`0`, `/dev/video0`) through ffmpeg.
pub fn spawn_v4l2_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<(FrameReceiver, ProcessHandle), CaptureError> {
    let device = device_path(uri);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-nostdin")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay")
        .arg("-f")
        .arg("video4linux2")
        .arg("-framerate")
        .arg("30")
        .arg("-i")
        .arg(&device);
    push_output_args(&mut cmd, target_size);
    spawn_ffmpeg_reader(cmd, target_size, 2)
}

/// Map `0` or `/dev/video0` style identifiers onto a device path; other URIs pass through.
pub(crate) fn device_path(uri: &str) -> String {
    match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

fn push_output_args(cmd: &mut Command, target_size: (i32, i32)) {
    cmd.arg("-vf")
        .arg(format!("scale={}:{}", target_size.0, target_size.1))
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    target_size: (i32, i32),
    queue_size: usize,
) -> Result<(FrameReceiver, ProcessHandle), CaptureError> {
    if target_size.0 <= 0 || target_size.1 <= 0 {
        return Err(CaptureError::Other(anyhow!(
            "target size must be positive, got {}x{}",
            target_size.0,
            target_size.1
        )));
    }
    let (tx, rx) = bounded(queue_size);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;
    let handle = ProcessHandle::new(child);

    let loop_handle = handle.clone();
    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, target_size, &tx) {
                let _ = tx.send(Err(err));
            }
            loop_handle.kill();
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok((rx, handle))
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    target_size: (i32, i32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let timestamp_ms = Utc::now().timestamp_millis();
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    debug!("frame receiver dropped; stopping ffmpeg reader");
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("ffmpeg output exhausted");
                return Ok(());
            }
            Err(err) => {
                warn!("ffmpeg read failed: {err}");
                return Err(CaptureError::Other(err.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_device_indices() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
        assert_eq!(device_path("1"), "/dev/video1");
        assert_eq!(device_path("rtsp://cam/stream"), "rtsp://cam/stream");
    }

    #[test]
    fn loop_splits_stream_into_frames_and_stops_at_eof() {
        // Two full 2x1 frames followed by a truncated one.
        let bytes: Vec<u8> = (0..15).collect();
        let (tx, rx) = bounded(4);
        ffmpeg_loop(Cursor::new(bytes), (2, 1), &tx).unwrap();
        drop(tx);

        let frames: Vec<Frame> = rx.iter().map(|frame| frame.unwrap()).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[1].data, vec![6, 7, 8, 9, 10, 11]);
        assert_eq!(frames[1].width, 2);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = spawn_file_reader(Path::new("/nonexistent/clip.mp4"), (640, 480))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}

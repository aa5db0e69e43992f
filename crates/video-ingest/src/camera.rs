//! Live capture through OpenCV, enabled with the `opencv` feature.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use chrono::Utc;
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, warn};

use crate::{
    ffmpeg::{parse_device_index, FrameReceiver},
    types::{CaptureError, Frame, FrameFormat},
};

const CAMERA_FPS: f64 = 30.0;

fn cv_err(err: opencv::Error) -> CaptureError {
    CaptureError::Other(err.into())
}

/// An opened device plus reusable decode buffers.
struct Camera {
    cap: VideoCapture,
    raw: Mat,
    resized: Mat,
    target: Size,
}

impl Camera {
    fn open(uri: &str, target_size: (i32, i32)) -> Result<Self, CaptureError> {
        let cap = match parse_device_index(uri) {
            Some(index) => open_index(index),
            None => VideoCapture::from_file(uri, videoio::CAP_ANY).ok(),
        }
        .filter(|cap| cap.is_opened().unwrap_or(false))
        .ok_or_else(|| CaptureError::Open {
            uri: uri.to_string(),
        })?;

        let mut camera = Self {
            cap,
            raw: Mat::default(),
            resized: Mat::default(),
            target: Size::new(target_size.0, target_size.1),
        };
        camera.request_mode();
        Ok(camera)
    }

    /// Ask the driver for MJPG at the working size. Drivers may ignore any of it.
    fn request_mode(&mut self) {
        if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
            let _ = self.cap.set(videoio::CAP_PROP_FOURCC, f64::from(mjpg));
        }
        let _ = self.cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(self.target.width));
        let _ = self.cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(self.target.height));
        let _ = self.cap.set(videoio::CAP_PROP_FPS, CAMERA_FPS);
    }

    /// Read one frame at the target size. `None` means the driver produced
    /// nothing this time.
    fn grab(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.cap.read(&mut self.raw).map_err(cv_err)? {
            return Ok(None);
        }
        let size = self.raw.size().map_err(cv_err)?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }
        let pixels = if size == self.target {
            &self.raw
        } else {
            imgproc::resize(
                &self.raw,
                &mut self.resized,
                self.target,
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )
            .map_err(cv_err)?;
            &self.resized
        };
        Ok(Some(Frame {
            data: pixels.data_bytes().map_err(cv_err)?.to_vec(),
            width: self.target.width,
            height: self.target.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        let _ = self.cap.release();
    }
}

fn open_index(index: i32) -> Option<VideoCapture> {
    [videoio::CAP_V4L2, videoio::CAP_ANY]
        .into_iter()
        .find_map(|api| match VideoCapture::new(index, api) {
            Ok(cap) if cap.is_opened().unwrap_or(false) => Some(cap),
            Ok(_) => None,
            Err(err) => {
                warn!("camera #{index} unavailable through api {api}: {err}");
                None
            }
        })
}

/// Open `uri` and stream frames from a reader thread until `stop` is set or
/// the receiver goes away. The channel holds two frames, so a slow consumer
/// sees recent frames rather than a backlog.
pub fn spawn_camera_reader(
    uri: &str,
    target_size: (i32, i32),
    stop: Arc<AtomicBool>,
) -> Result<FrameReceiver, CaptureError> {
    let mut camera = Camera::open(uri, target_size)?;
    let (tx, rx) = crossbeam_channel::bounded(2);

    thread::Builder::new()
        .name("camera-reader".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let next = match camera.grab() {
                    Ok(Some(frame)) => Ok(frame),
                    Ok(None) => continue,
                    Err(err) => Err(err),
                };
                let failed = next.is_err();
                if tx.send(next).is_err() || failed {
                    break;
                }
            }
            debug!("camera reader exiting");
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

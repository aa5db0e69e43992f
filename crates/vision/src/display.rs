//! Display/log collaborator.
//!
//! [`PreviewDisplay`] JPEG-encodes composited frames into the shared buffers
//! served by the preview server and keeps the alert log behind `/alerts`.

use std::time::Instant;

use anyhow::{Result, anyhow};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tracing::{info, warn};

use crate::{
    data::{AlertLog, AlertRecord, FRAME_HISTORY_CAPACITY, FrameHistory, FramePacket, SharedFrame},
    detector::{Alert, DetectorKind},
};

/// What happened in one processed cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp_ms: i64,
    pub active: Vec<DetectorKind>,
    /// Count drawn by the crowd detector this cycle, if it ran.
    pub crowd_count: Option<usize>,
    pub alerts: Vec<Alert>,
    pub detector_errors: usize,
}

/// Best-effort sink for operator messages and annotated frames.
pub trait Display: Send + Sync {
    fn emit(&self, message: &str, important: bool);

    fn show_frame(&self, frame: &RgbImage, report: &CycleReport);
}

pub struct PreviewDisplay {
    latest: SharedFrame,
    history: FrameHistory,
    alerts: AlertLog,
    jpeg_quality: u8,
}

impl PreviewDisplay {
    pub(crate) fn new(
        latest: SharedFrame,
        history: FrameHistory,
        alerts: AlertLog,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            latest,
            history,
            alerts,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

impl Display for PreviewDisplay {
    fn emit(&self, message: &str, important: bool) {
        if important {
            warn!(target: "railguard::alert", "{message}");
        } else {
            info!(target: "railguard::alert", "{message}");
        }
        self.alerts.push(AlertRecord {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            message: message.to_string(),
            important,
        });
    }

    fn show_frame(&self, frame: &RgbImage, report: &CycleReport) {
        let encode_start = Instant::now();
        let jpeg = match encode_jpeg(frame, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!("display frame dropped: {err}");
                return;
            }
        };
        metrics::histogram!("railguard_encode_seconds").record(encode_start.elapsed().as_secs_f64());

        let packet = FramePacket {
            jpeg,
            cycle: report.cycle,
            timestamp_ms: report.timestamp_ms,
            crowd_count: report.crowd_count,
        };
        if let Ok(mut guard) = self.history.lock() {
            guard.push_back(packet.clone());
            if guard.len() > FRAME_HISTORY_CAPACITY {
                guard.pop_front();
            }
        }
        if let Ok(mut guard) = self.latest.lock() {
            *guard = Some(packet);
        }
    }
}

pub(crate) fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

//! Configuration parsing for the detection pipeline.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which the runner and controller use without re-parsing flags.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use ml_core::ComputeDevice;
use serde::Deserialize;
use video_ingest::SourceKind;

use crate::{alert::DEFAULT_COOLDOWN, detector::DetectorKind};

/// Frame source selected by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Capture device.
    Live,
    /// Decoded video file.
    File,
}

impl From<CaptureMode> for SourceKind {
    fn from(mode: CaptureMode) -> Self {
        match mode {
            CaptureMode::Live => SourceKind::Live,
            CaptureMode::File => SourceKind::File,
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by the runner and the controller.
pub struct VisionConfig {
    /// Mode of the initial start issued from the command line.
    pub mode: SourceKind,
    /// Video file used by file mode.
    pub file: Option<PathBuf>,
    /// Capture device index or URI used by live mode.
    pub device: String,
    /// Detectors activated on startup. Empty leaves the pipeline idle.
    pub detectors: BTreeSet<DetectorKind>,
    pub confidence: BTreeMap<DetectorKind, f32>,
    pub cooldown: BTreeMap<DetectorKind, Duration>,
    /// Working resolution every frame is normalised to.
    pub width: u32,
    pub height: u32,
    pub models: ModelPaths,
    pub notify_url: String,
    pub notify_timeout: Duration,
    pub capture_timeout: Duration,
    /// Interval between pipeline cycles.
    pub tick: Duration,
    pub preview_addr: SocketAddr,
    pub jpeg_quality: u8,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
/// Model files per detector. `None` means the detector ships without a model.
pub struct ModelPaths {
    pub track: PathBuf,
    pub person: PathBuf,
    pub crowd: PathBuf,
    pub fall: PathBuf,
    pub fire: Option<PathBuf>,
    pub weapon: Option<PathBuf>,
    pub device: ComputeDevice,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log level to debug.
    pub verbose: bool,
}

/// CLI arguments accepted by the `watch` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Frame source for the initial start.
    #[arg(long, value_enum, default_value = "live")]
    pub mode: CaptureMode,
    /// Video file for file mode.
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,
    /// Capture device index or URI for live mode.
    #[arg(long, value_name = "INDEX|URI", default_value = "0")]
    pub device: String,
    /// Comma-separated detectors to start with (trespassing,fall,crowd,fire,weapon).
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub detectors: Vec<DetectorKind>,
    /// Confidence threshold override, e.g. `crowd=0.35`. Repeatable.
    #[arg(long = "confidence", value_name = "KIND=VALUE", value_parser = parse_assignment::<f32>)]
    pub confidence: Vec<(DetectorKind, f32)>,
    /// Alert cooldown override in seconds, e.g. `fall=10`. Repeatable.
    #[arg(long = "cooldown", value_name = "KIND=SECS", value_parser = parse_assignment::<f64>)]
    pub cooldown: Vec<(DetectorKind, f64)>,
    /// Working width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Working height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Track segmentation model.
    #[arg(long, value_name = "PATH", default_value = "train_segmented.pt")]
    pub track_model: PathBuf,
    /// Person detection model used for trespassing.
    #[arg(long, value_name = "PATH", default_value = "yolo11n.pt")]
    pub person_model: PathBuf,
    /// Person detection model used for crowd counting.
    #[arg(long, value_name = "PATH", default_value = "yolo11n.pt")]
    pub crowd_model: PathBuf,
    /// Fall classification model.
    #[arg(long, value_name = "PATH", default_value = "fall_model.pt")]
    pub fall_model: PathBuf,
    /// Fire and smoke model. Fire detection is unavailable without it.
    #[arg(long, value_name = "PATH")]
    pub fire_model: Option<PathBuf>,
    /// Weapon model. Weapon detection is unavailable without it.
    #[arg(long, value_name = "PATH")]
    pub weapon_model: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Base URL of the notification endpoint.
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8000")]
    pub notify_url: String,
    /// Per-request notification timeout.
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub notify_timeout_ms: u64,
    /// Longest a live read may block before the cycle is skipped.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub capture_timeout_ms: u64,
    /// Pipeline cycle interval.
    #[arg(long, value_name = "MS", default_value_t = 10)]
    pub tick_ms: u64,
    /// Address of the preview and control server.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8080")]
    pub preview_addr: SocketAddr,
    /// JPEG quality of preview frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

/// Parse `KIND=VALUE` where KIND names a detector.
fn parse_assignment<T>(raw: &str) -> std::result::Result<(DetectorKind, T), String>
where
    T: FromStr,
    T::Err: Display,
{
    let (kind, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=VALUE, got {raw:?}"))?;
    let kind = kind.parse::<DetectorKind>()?;
    let value = value
        .trim()
        .parse::<T>()
        .map_err(|err| format!("invalid value for {kind}: {err}"))?;
    Ok((kind, value))
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Working resolution must be positive (got {}x{}).", args.width, args.height);
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("JPEG quality must be within 1-100 (got {}).", args.jpeg_quality);
        }
        if args.tick_ms == 0 {
            bail!("--tick-ms must be greater than zero.");
        }

        let mut confidence: BTreeMap<DetectorKind, f32> = DetectorKind::ALL
            .into_iter()
            .map(|kind| (kind, kind.default_confidence()))
            .collect();
        for (kind, value) in args.confidence {
            if !(0.0..=1.0).contains(&value) {
                bail!("Confidence for {kind} must be within [0, 1] (got {value}).");
            }
            confidence.insert(kind, value);
        }

        let mut cooldown: BTreeMap<DetectorKind, Duration> = DetectorKind::ALL
            .into_iter()
            .map(|kind| (kind, DEFAULT_COOLDOWN))
            .collect();
        for (kind, secs) in args.cooldown {
            let Ok(period) = Duration::try_from_secs_f64(secs) else {
                bail!("Cooldown for {kind} must be a non-negative number of seconds (got {secs}).");
            };
            cooldown.insert(kind, period);
        }

        Ok(Self {
            mode: args.mode.into(),
            file: args.file,
            device: args.device,
            detectors: args.detectors.into_iter().collect(),
            confidence,
            cooldown,
            width: args.width,
            height: args.height,
            models: ModelPaths {
                track: args.track_model,
                person: args.person_model,
                crowd: args.crowd_model,
                fall: args.fall_model,
                fire: args.fire_model,
                weapon: args.weapon_model,
                device: if args.use_cpu {
                    ComputeDevice::Cpu
                } else {
                    ComputeDevice::CudaIfAvailable
                },
            },
            notify_url: args.notify_url,
            notify_timeout: Duration::from_millis(args.notify_timeout_ms),
            capture_timeout: Duration::from_millis(args.capture_timeout_ms),
            tick: Duration::from_millis(args.tick_ms),
            preview_addr: args.preview_addr,
            jpeg_quality: args.jpeg_quality,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

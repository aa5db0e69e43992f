//! Detector orchestration for the railway surveillance pipeline.
//!
//! - `detector`: the detector contract and the registered variants.
//! - `alert`: per-detector cooldown gate.
//! - `signal`: per-cycle person count shared between detectors.
//! - `pipeline`: controller state machine, runner, config and telemetry.
//! - `display`, `notify`: collaborators the controller reports to.
//! - `server`, `endpoint`: the preview/control API and the alert receiver.

pub mod alert;
pub(crate) mod annotation;
pub mod data;
pub mod detector;
pub mod display;
pub mod endpoint;
pub mod error;
pub mod models;
pub mod notify;
pub mod pipeline;
pub(crate) mod server;
pub mod signal;

pub use alert::{AlertGate, DEFAULT_COOLDOWN};
pub use detector::{Detector, DetectorKind};
pub use endpoint::run_alert_endpoint;
pub use error::PipelineError;
pub use pipeline::{
    ControlCommand, ControlRequest,
    config::{CaptureMode, VisionCliArgs, VisionConfig},
    controller::{PipelineController, TickOutcome},
    run,
};
pub use signal::SharedSignalBus;
pub use video_ingest::SourceKind;

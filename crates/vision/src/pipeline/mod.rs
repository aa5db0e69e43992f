//! Fixed-cadence runner tying capture, detectors, display and notification
//! together.
//!
//! - `config`: CLI flags and the validated `VisionConfig`.
//! - `controller`: the operator-facing state machine and the per-cycle work.
//! - `telemetry`: tracing subscriber and Prometheus recorder.

pub mod config;
pub mod controller;
pub(crate) mod telemetry;

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use video_ingest::{SourceKind, SystemCapture};

use crate::{
    data::{AlertLog, FrameHistory, PipelineStatus, SharedFrame, SharedStatus},
    detector::DetectorKind,
    display::{Display, PreviewDisplay},
    error::PipelineError,
    models::load_detectors,
    notify::HttpNotifier,
    server::{ServerState, spawn_preview_server},
};

use self::{
    config::VisionConfig,
    controller::{ControllerSettings, PipelineController, TickOutcome},
};

/// Operator action forwarded from the control API to the pipeline thread.
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        mode: SourceKind,
        detectors: BTreeSet<DetectorKind>,
    },
    Stop,
    SetConfidence {
        detector: DetectorKind,
        value: f32,
    },
    SelectFile(PathBuf),
}

/// A command plus the channel its outcome is reported on. Commands are applied
/// between cycles, never during one.
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<Result<PipelineStatus, PipelineError>>,
}

/// Run the detection pipeline until Ctrl+C.
pub fn run(config: VisionConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let prometheus = match telemetry::init_metrics_recorder() {
        Ok(handle) => Some(handle.clone()),
        Err(err) => {
            warn!("metrics disabled: {err:#}");
            None
        }
    };
    let run_span = tracing::info_span!(
        "railguard.run",
        mode = %config.mode,
        width = config.width,
        height = config.height,
    );
    let _run_guard = run_span.enter();

    let latest: SharedFrame = Arc::default();
    let history: FrameHistory = Arc::default();
    let alerts = AlertLog::default();
    let display: Arc<dyn Display> = Arc::new(PreviewDisplay::new(
        Arc::clone(&latest),
        Arc::clone(&history),
        alerts.clone(),
        config.jpeg_quality,
    ));
    let notifier = Arc::new(
        HttpNotifier::spawn(&config.notify_url, config.notify_timeout, display.clone())
            .context("failed to start notification worker")?,
    );

    let registry = load_detectors(&config.models, &config.cooldown);
    let mut controller = PipelineController::new(
        ControllerSettings {
            working_size: (config.width, config.height),
            confidence: config.confidence.clone(),
            file: config.file.clone(),
            device: config.device.clone(),
            read_timeout: config.capture_timeout,
        },
        registry,
        Box::new(SystemCapture::default()),
        display.clone(),
        notifier.clone(),
    );

    let running = Arc::new(AtomicBool::new(true));
    let stop = controller.stop_handle();
    CTRL_HANDLER.call_once({
        let running = running.clone();
        let stop = stop.clone();
        move || {
            if let Err(err) = ctrlc::set_handler(move || {
                running.store(false, Ordering::SeqCst);
                stop.request();
            }) {
                warn!("Failed to install Ctrl+C handler: {err}");
            }
        }
    });

    let status: SharedStatus = Arc::new(std::sync::Mutex::new(controller.status()));
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let preview_server = spawn_preview_server(
        config.preview_addr,
        ServerState {
            latest,
            history,
            alerts,
            status: status.clone(),
            prometheus,
            control: control_tx,
            stop,
        },
    )
    .context("failed to start preview server")?;
    info!(
        "preview available at http://{}/stream.mjpg, press Ctrl+C to exit",
        config.preview_addr
    );

    if !config.detectors.is_empty() {
        if let Err(err) = controller.start(config.mode, &config.detectors) {
            warn!("initial start failed: {err}");
            display.emit(&err.to_string(), false);
        }
    }
    publish(&status, &controller);

    let mut next_tick = Instant::now();
    while running.load(Ordering::SeqCst) {
        apply_pending(&mut controller, &control_rx, &status);

        match controller.tick() {
            TickOutcome::Ended => info!("end of video reached; waiting for a new start"),
            TickOutcome::Cancelled => debug!("cycle cancelled by stop request"),
            _ => {}
        }
        publish(&status, &controller);

        next_tick += config.tick;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    info!("shutting down");
    controller.stop();
    drop(controller);
    preview_server.stop();
    if let Ok(notifier) = Arc::try_unwrap(notifier) {
        notifier.shutdown();
    }
    Ok(())
}

fn apply_pending(
    controller: &mut PipelineController,
    requests: &Receiver<ControlRequest>,
    status: &SharedStatus,
) {
    for request in requests.try_iter() {
        let outcome = apply(controller, request.command);
        publish(status, controller);
        let _ = request.reply.send(outcome);
    }
}

fn apply(
    controller: &mut PipelineController,
    command: ControlCommand,
) -> Result<PipelineStatus, PipelineError> {
    debug!(?command, "applying control command");
    match command {
        ControlCommand::Start { mode, detectors } => controller.start(mode, &detectors)?,
        ControlCommand::Stop => {
            controller.stop();
        }
        ControlCommand::SetConfidence { detector, value } => {
            controller.set_confidence(detector, value)?
        }
        ControlCommand::SelectFile(path) => controller.select_file(path),
    }
    Ok(controller.status())
}

fn publish(status: &SharedStatus, controller: &PipelineController) {
    if let Ok(mut guard) = status.lock() {
        *guard = controller.status();
    }
}

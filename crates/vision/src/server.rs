//! Actix Web preview server: annotated frames, the alert log, pipeline status,
//! Prometheus metrics and the operator control API.
//!
//! The server runs on its own thread with its own actix system. Control
//! requests are forwarded to the pipeline thread and applied between cycles.

use std::{net::SocketAddr, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use crossbeam_channel::Sender;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    data::{AlertLog, FrameHistory, FramePacket, SharedFrame, SharedStatus},
    detector::DetectorKind,
    error::PipelineError,
    pipeline::{
        ControlCommand, ControlRequest,
        config::CaptureMode,
        controller::StopHandle,
    },
};

const STREAM_INTERVAL: Duration = Duration::from_millis(33);

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) latest: SharedFrame,
    pub(crate) history: FrameHistory,
    pub(crate) alerts: AlertLog,
    pub(crate) status: SharedStatus,
    pub(crate) prometheus: Option<PrometheusHandle>,
    pub(crate) control: Sender<ControlRequest>,
    pub(crate) stop: StopHandle,
}

/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct FrameQuery {
    cycle: Option<u64>,
}

#[derive(Deserialize)]
struct StartBody {
    mode: CaptureMode,
    detectors: Vec<DetectorKind>,
}

#[derive(Deserialize)]
struct ConfidenceBody {
    detector: DetectorKind,
    value: f32,
}

#[derive(Deserialize)]
struct FileBody {
    path: std::path::PathBuf,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Bind `addr` on the caller's thread, then serve from a dedicated thread.
pub(crate) fn spawn_preview_server(addr: SocketAddr, state: ServerState) -> Result<PreviewServer> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("failed to bind preview server to {addr}"))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = crate::pipeline::telemetry::spawn_thread("railguard-preview", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(configure)
            })
            .workers(2)
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("preview server error: {err}");
        }
    })
    .context("failed to spawn preview server thread")?;
    info!(%addr, "preview server listening");
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/frame.jpg", web::get().to(frame_handler))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/alerts", web::get().to(alerts_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/control/start", web::post().to(start_handler))
        .route("/control/stop", web::post().to(stop_handler))
        .route("/control/confidence", web::post().to(confidence_handler))
        .route("/control/file", web::post().to(file_handler));
}

fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    shared.lock().ok().and_then(|guard| guard.clone())
}

fn history_frame(history: &FrameHistory, cycle: u64) -> Option<FramePacket> {
    history
        .lock()
        .ok()
        .and_then(|buffer| buffer.iter().find(|packet| packet.cycle == cycle).cloned())
}

/// Return a buffered frame by cycle number, or the latest frame.
async fn frame_handler(
    query: web::Query<FrameQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    if let Some(requested) = query.cycle {
        if let Some(packet) = history_frame(&state.history, requested) {
            return jpeg_response(packet);
        }
        return match latest_frame(&state.latest) {
            Some(latest) => HttpResponse::Ok()
                .append_header((
                    header::WARNING,
                    format!(
                        "299 railguard \"cycle {requested} not buffered; returning latest {}\"",
                        latest.cycle
                    ),
                ))
                .content_type("image/jpeg")
                .body(latest.jpeg),
            None => HttpResponse::NoContent().finish(),
        };
    }

    match latest_frame(&state.latest) {
        Some(packet) => jpeg_response(packet),
        None => HttpResponse::NoContent().finish(),
    }
}

fn jpeg_response(packet: FramePacket) -> HttpResponse {
    let mut response = HttpResponse::Ok();
    response.append_header(("X-Cycle", packet.cycle.to_string()));
    if let Some(count) = packet.crowd_count {
        response.append_header(("X-Crowd-Count", count.to_string()));
    }
    response.content_type("image/jpeg").body(packet.jpeg)
}

/// Multipart MJPEG feed of the display frame.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_INTERVAL);
        let mut last_cycle = None;
        loop {
            interval.tick().await;
            let packet = match latest_frame(&state.latest) {
                Some(packet) if last_cycle != Some(packet.cycle) => packet,
                _ => continue,
            };
            last_cycle = Some(packet.cycle);
            let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Cycle: {}\r\n", packet.cycle).as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&packet.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        ))
        .streaming(stream)
}

async fn alerts_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.alerts.snapshot())
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.status.lock() {
        Ok(status) => HttpResponse::Ok().json(&*status),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    render_metrics(state.prometheus.as_ref())
}

/// Prometheus text exposition, or 503 when no recorder is installed.
pub(crate) fn render_metrics(handle: Option<&PrometheusHandle>) -> HttpResponse {
    match handle {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn start_handler(
    body: web::Json<StartBody>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let StartBody { mode, detectors } = body.into_inner();
    dispatch(
        &state,
        ControlCommand::Start {
            mode: mode.into(),
            detectors: detectors.into_iter().collect(),
        },
    )
    .await
}

async fn stop_handler(state: web::Data<ServerState>) -> HttpResponse {
    // Abandon the cycle in flight instead of waiting for it to finish.
    state.stop.request();
    dispatch(&state, ControlCommand::Stop).await
}

async fn confidence_handler(
    body: web::Json<ConfidenceBody>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let ConfidenceBody { detector, value } = body.into_inner();
    dispatch(&state, ControlCommand::SetConfidence { detector, value }).await
}

async fn file_handler(body: web::Json<FileBody>, state: web::Data<ServerState>) -> HttpResponse {
    dispatch(&state, ControlCommand::SelectFile(body.into_inner().path)).await
}

/// Forward a command to the pipeline thread and wait for its outcome.
async fn dispatch(state: &ServerState, command: ControlCommand) -> HttpResponse {
    let (reply, outcome) = oneshot::channel();
    if state.control.send(ControlRequest { command, reply }).is_err() {
        return unavailable("pipeline is not running");
    }
    match outcome.await {
        Ok(Ok(status)) => HttpResponse::Ok().json(status),
        Ok(Err(err)) => {
            warn!("control request rejected: {err}");
            HttpResponse::build(error_status(&err)).json(ErrorBody {
                error: err.to_string(),
            })
        }
        Err(_) => unavailable("pipeline dropped the request"),
    }
}

fn unavailable(message: &str) -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(ErrorBody {
        error: message.to_string(),
    })
}

fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Configuration(_) => StatusCode::BAD_REQUEST,
        PipelineError::ModelUnavailable(_) => StatusCode::CONFLICT,
        PipelineError::Capture(_) => StatusCode::BAD_GATEWAY,
    }
}

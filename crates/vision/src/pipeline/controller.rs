//! Pipeline controller: owns the detector set and the capture session and
//! drives one frame through every active detector per tick.
//!
//! A cycle runs all alert passes in [`DetectorKind`] order against the clean
//! working frame, then threads one display frame through every visual pass in
//! the same order. Cycles never overlap.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info, info_span, warn};
use video_ingest::{CaptureBackend, Frame, FrameSource, OpenRequest, ReadError, SourceKind};

use crate::{
    data::PipelineStatus,
    detector::{AlertContext, CycleInput, Detector, DetectorKind},
    display::{CycleReport, Display},
    error::PipelineError,
    models::DetectorRegistry,
    notify::Notifier,
    signal::SharedSignalBus,
};

/// Settings the controller consumes from configuration.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub working_size: (u32, u32),
    pub confidence: BTreeMap<DetectorKind, f32>,
    pub file: Option<PathBuf>,
    pub device: String,
    pub read_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running(SourceKind),
}

/// Result of one [`PipelineController::tick`].
#[derive(Debug, PartialEq)]
pub enum TickOutcome {
    Idle,
    /// No frame arrived within the capture timeout; the pipeline keeps running.
    Skipped,
    /// The file source is exhausted and the pipeline stopped itself.
    Ended,
    /// A stop was requested during the cycle; its results were discarded.
    Cancelled,
    Processed(CycleReport),
}

/// Active flag per registered detector. Keys never change after construction.
#[derive(Clone, Debug, Default)]
pub struct ModuleSet {
    entries: BTreeMap<DetectorKind, bool>,
}

impl ModuleSet {
    pub fn new(keys: impl IntoIterator<Item = DetectorKind>) -> Self {
        Self {
            entries: keys.into_iter().map(|kind| (kind, false)).collect(),
        }
    }

    fn activate_only(&mut self, selected: &BTreeSet<DetectorKind>) {
        for (kind, active) in self.entries.iter_mut() {
            *active = selected.contains(kind);
        }
    }

    fn deactivate_all(&mut self) {
        self.entries.values_mut().for_each(|active| *active = false);
    }

    pub fn is_active(&self, kind: DetectorKind) -> bool {
        self.entries.get(&kind).copied().unwrap_or(false)
    }

    /// Active detectors in execution order.
    pub fn active(&self) -> Vec<DetectorKind> {
        self.entries
            .iter()
            .filter(|(_, active)| **active)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// Requests a stop from another thread. The controller honours it at the
/// next cycle boundary and discards any results of the cycle in flight.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

pub struct PipelineController {
    settings: ControllerSettings,
    detectors: BTreeMap<DetectorKind, Box<dyn Detector>>,
    unavailable: BTreeSet<DetectorKind>,
    modules: ModuleSet,
    backend: Box<dyn CaptureBackend>,
    session: Option<Box<dyn FrameSource>>,
    state: ControllerState,
    bus: SharedSignalBus,
    display: Arc<dyn Display>,
    notifier: Arc<dyn Notifier>,
    stop: StopHandle,
    cycle: u64,
    crowd_count: Option<usize>,
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        registry: DetectorRegistry,
        backend: Box<dyn CaptureBackend>,
        display: Arc<dyn Display>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let DetectorRegistry {
            detectors,
            unavailable,
        } = registry;
        let mut unavailable: BTreeSet<DetectorKind> = unavailable.into_keys().collect();
        unavailable.extend(
            DetectorKind::ALL
                .into_iter()
                .filter(|kind| !detectors.contains_key(kind)),
        );
        Self {
            settings,
            detectors,
            unavailable,
            modules: ModuleSet::new(DetectorKind::ALL),
            backend,
            session: None,
            state: ControllerState::Idle,
            bus: SharedSignalBus::new(),
            display,
            notifier,
            stop: StopHandle::default(),
            cycle: 0,
            crowd_count: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Set the video file used by file mode.
    pub fn select_file(&mut self, path: PathBuf) {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.display.emit(&format!("Video selected: {name}"), false);
        self.settings.file = Some(path);
    }

    pub fn set_confidence(&mut self, kind: DetectorKind, value: f32) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(PipelineError::configuration(format!(
                "confidence for {kind} must be within [0, 1], got {value}"
            )));
        }
        self.settings.confidence.insert(kind, value);
        Ok(())
    }

    fn threshold(&self, kind: DetectorKind) -> f32 {
        self.settings
            .confidence
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_confidence())
    }

    /// Validate the request, open (or reuse) a capture session and activate
    /// exactly `selected`. Rejected requests leave the module set unchanged;
    /// a capture failure leaves the pipeline idle.
    pub fn start(
        &mut self,
        mode: SourceKind,
        selected: &BTreeSet<DetectorKind>,
    ) -> Result<(), PipelineError> {
        if selected.is_empty() {
            return Err(PipelineError::configuration("no detectors selected"));
        }
        let uri = match mode {
            SourceKind::File => self
                .settings
                .file
                .as_ref()
                .map(|path| path.display().to_string())
                .ok_or_else(|| PipelineError::configuration("no video file selected"))?,
            SourceKind::Live => self.settings.device.clone(),
        };
        if let Some(kind) = selected.iter().find(|kind| self.unavailable.contains(*kind)) {
            return Err(PipelineError::ModelUnavailable(*kind));
        }

        let reuse_live = mode == SourceKind::Live
            && self
                .session
                .as_ref()
                .is_some_and(|session| session.kind() == SourceKind::Live);
        if reuse_live {
            debug!("reusing open live capture session");
        } else {
            self.close_session();
            let request = OpenRequest {
                kind: mode,
                uri,
                target_size: (
                    self.settings.working_size.0 as i32,
                    self.settings.working_size.1 as i32,
                ),
                read_timeout: self.settings.read_timeout,
            };
            match self.backend.open(&request) {
                Ok(session) => self.session = Some(session),
                Err(err) => {
                    self.state = ControllerState::Idle;
                    self.modules.deactivate_all();
                    return Err(err.into());
                }
            }
        }

        self.modules.activate_only(selected);
        self.state = ControllerState::Running(mode);
        self.bus.clear();
        self.stop.clear();
        self.crowd_count = None;

        let names: Vec<&str> = selected.iter().map(|kind| kind.title()).collect();
        info!(mode = %mode, detectors = ?selected, "detection started");
        self.display
            .emit(&format!("Started: {} ({mode})", names.join(", ")), false);
        Ok(())
    }

    /// Deactivate every detector and close the session. Returns whether the
    /// pipeline was running.
    pub fn stop(&mut self) -> bool {
        self.stop.clear();
        if self.state == ControllerState::Idle {
            return false;
        }
        self.modules.deactivate_all();
        self.close_session();
        self.bus.clear();
        self.state = ControllerState::Idle;
        info!("detection stopped");
        self.display.emit("Detection stopped", false);
        true
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Run one cycle with `now` as the alert clock.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        let ControllerState::Running(source) = self.state else {
            self.stop.clear();
            return TickOutcome::Idle;
        };
        if self.stop.take() {
            self.stop();
            return TickOutcome::Cancelled;
        }
        let Some(session) = self.session.as_mut() else {
            self.stop();
            return TickOutcome::Ended;
        };

        let frame = match session.read_frame() {
            Ok(frame) => frame,
            Err(ReadError::Transient(reason)) => {
                debug!(%source, "read skipped: {reason}");
                metrics::counter!("railguard_capture_transient_total").increment(1);
                return TickOutcome::Skipped;
            }
            Err(ReadError::EndOfStream) => match source {
                SourceKind::File => {
                    info!("video file finished");
                    self.stop();
                    return TickOutcome::Ended;
                }
                SourceKind::Live => {
                    debug!("live capture ended");
                    metrics::counter!("railguard_capture_transient_total").increment(1);
                    return TickOutcome::Skipped;
                }
            },
        };

        let clean = match to_working_frame(&frame, self.settings.working_size) {
            Ok(clean) => clean,
            Err(err) => {
                warn!("dropping malformed frame: {err}");
                return match source {
                    SourceKind::File => {
                        self.stop();
                        TickOutcome::Ended
                    }
                    SourceKind::Live => TickOutcome::Skipped,
                };
            }
        };

        self.run_cycle(&clean, frame.timestamp_ms, now)
    }

    fn run_cycle(&mut self, clean: &RgbImage, timestamp_ms: i64, now: Instant) -> TickOutcome {
        let cycle_start = Instant::now();
        self.cycle += 1;
        let cycle = self.cycle;
        let active = self.modules.active();
        let thresholds: Vec<f32> = active.iter().map(|kind| self.threshold(*kind)).collect();
        let cycle_span = info_span!("cycle", cycle, active = active.len());
        let _cycle_guard = cycle_span.enter();

        let input = CycleInput {
            cycle,
            frame: clean,
            now,
        };
        let mut detector_errors = 0;

        let mut ctx = AlertContext::new(
            cycle,
            now,
            self.display.as_ref(),
            self.notifier.as_ref(),
            &mut self.bus,
        );
        for (kind, threshold) in active.iter().zip(&thresholds) {
            let Some(detector) = self.detectors.get_mut(kind) else {
                continue;
            };
            let _span = info_span!("detector.alert", detector = kind.name()).entered();
            if let Err(err) = detector.alert_pass(&input, *threshold, &mut ctx) {
                detector_errors += 1;
                warn!(detector = kind.name(), "alert pass failed: {err:#}");
                metrics::counter!(
                    "railguard_detector_errors_total",
                    "detector" => kind.name(),
                    "pass" => "alert"
                )
                .increment(1);
            }
        }
        let alerts = ctx.into_fired();

        if self.stop.is_requested() {
            self.stop();
            return TickOutcome::Cancelled;
        }

        let producer_active = active.contains(&DetectorKind::Trespassing);
        let mut display_frame = clean.clone();
        let mut crowd_count = None;
        for (kind, threshold) in active.iter().zip(&thresholds) {
            let Some(detector) = self.detectors.get_mut(kind) else {
                continue;
            };
            let shared = match kind {
                DetectorKind::Crowd => self.bus.consume(cycle, producer_active),
                _ => None,
            };
            let _span = info_span!("detector.visual", detector = kind.name()).entered();
            match detector.visual_pass(&input, &mut display_frame, *threshold, shared) {
                Ok(()) if *kind == DetectorKind::Crowd => crowd_count = detector.person_count(),
                Ok(()) => {}
                Err(err) => {
                    detector_errors += 1;
                    warn!(detector = kind.name(), "visual pass failed: {err:#}");
                    metrics::counter!(
                        "railguard_detector_errors_total",
                        "detector" => kind.name(),
                        "pass" => "visual"
                    )
                    .increment(1);
                }
            }
        }

        if self.stop.is_requested() {
            self.stop();
            return TickOutcome::Cancelled;
        }

        if crowd_count.is_some() {
            self.crowd_count = crowd_count;
        }
        let report = CycleReport {
            cycle,
            timestamp_ms,
            active,
            crowd_count,
            alerts,
            detector_errors,
        };
        self.display.show_frame(&display_frame, &report);

        metrics::counter!("railguard_cycles_total").increment(1);
        metrics::histogram!("railguard_cycle_latency_seconds")
            .record(cycle_start.elapsed().as_secs_f64());
        TickOutcome::Processed(report)
    }

    pub fn status(&self) -> PipelineStatus {
        let (state, mode) = match self.state {
            ControllerState::Idle => ("idle", None),
            ControllerState::Running(kind) => ("running", Some(kind.label())),
        };
        PipelineStatus {
            state,
            mode,
            active: self.modules.active(),
            unavailable: self.unavailable.iter().copied().collect(),
            confidence: DetectorKind::ALL
                .into_iter()
                .map(|kind| (kind, self.threshold(kind)))
                .collect(),
            file: self
                .settings
                .file
                .as_ref()
                .map(|path| path.display().to_string()),
            cycle: self.cycle,
            crowd_count: self.crowd_count,
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.close_session();
    }
}

/// Convert a captured BGR8 frame into an RGB frame at the working resolution.
pub(crate) fn to_working_frame(frame: &Frame, working_size: (u32, u32)) -> Result<RgbImage> {
    if frame.width <= 0 || frame.height <= 0 {
        return Err(anyhow!("frame has no pixels ({}x{})", frame.width, frame.height));
    }
    let (width, height) = (frame.width as u32, frame.height as u32);
    let expected = (width as usize) * (height as usize) * 3;
    if frame.data.len() < expected {
        return Err(anyhow!(
            "frame {}x{} carries {} bytes, expected {expected}",
            frame.width,
            frame.height,
            frame.data.len()
        ));
    }
    let mut rgb = Vec::with_capacity(expected);
    for pixel in frame.data[..expected].chunks_exact(3) {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    let image = RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;
    if (width, height) == working_size {
        Ok(image)
    } else {
        Ok(image::imageops::resize(
            &image,
            working_size.0,
            working_size.1,
            FilterType::Triangle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use image::Rgb;
    use ml_core::{BoundingBox, Detection, TrackMask};
    use video_ingest::{CaptureError, FrameFormat};

    use super::*;
    use crate::{
        alert::AlertGate,
        detector::{
            CrowdDetector, FallDetector, TrespassingDetector,
            testing::{FakeModel, FakeSegmenter, RecordingDisplay, RecordingNotifier},
        },
        notify::AlertRoute,
    };

    const W: u32 = 100;
    const H: u32 = 100;

    fn frame() -> Frame {
        Frame {
            data: vec![0; (W * H * 3) as usize],
            width: W as i32,
            height: H as i32,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    struct ScriptedSource {
        kind: SourceKind,
        reads: Arc<Mutex<VecDeque<Result<Frame, ReadError>>>>,
        closed: Arc<AtomicUsize>,
    }

    impl FrameSource for ScriptedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn read_frame(&mut self) -> Result<Frame, ReadError> {
            self.reads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| match self.kind {
                    SourceKind::File => Err(ReadError::EndOfStream),
                    SourceKind::Live => Ok(frame()),
                })
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedBackend {
        reads: Arc<Mutex<VecDeque<Result<Frame, ReadError>>>>,
        opened: Arc<Mutex<Vec<OpenRequest>>>,
        closed: Arc<AtomicUsize>,
        fail_open: bool,
    }

    impl ScriptedBackend {
        fn script(&self, reads: Vec<Result<Frame, ReadError>>) {
            *self.reads.lock().unwrap() = reads.into();
        }

        fn opened(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl CaptureBackend for ScriptedBackend {
        fn open(&mut self, request: &OpenRequest) -> Result<Box<dyn FrameSource>, CaptureError> {
            if self.fail_open {
                return Err(CaptureError::Open {
                    uri: request.uri.clone(),
                });
            }
            self.opened.lock().unwrap().push(request.clone());
            Ok(Box::new(ScriptedSource {
                kind: request.kind,
                reads: self.reads.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    struct Harness {
        controller: PipelineController,
        backend: ScriptedBackend,
        display: Arc<RecordingDisplay>,
        notifier: Arc<RecordingNotifier>,
        people: Arc<FakeModel>,
        crowd: Arc<FakeModel>,
        fall: Arc<FakeModel>,
    }

    fn track_band() -> TrackMask {
        let mut mask = TrackMask::empty(W, H);
        for y in 40..60 {
            for x in 0..W {
                mask.set(x, y);
            }
        }
        mask
    }

    fn person(x: i32, y: i32) -> Detection {
        Detection::new("person", 0.9, BoundingBox::new(x - 4, y - 4, x + 4, y + 4))
    }

    fn harness_with(backend: ScriptedBackend, file: Option<&str>) -> Harness {
        let people = FakeModel::with(vec![person(10, 10), person(50, 50), person(80, 80)]);
        let crowd = FakeModel::with(vec![person(10, 10), person(80, 80)]);
        let fall = FakeModel::with(Vec::new());
        let mut registry = DetectorRegistry::default();
        registry.insert(Box::new(TrespassingDetector::new(
            Arc::new(FakeSegmenter {
                mask: Some(track_band()),
            }),
            people.clone(),
            AlertGate::new(Duration::from_secs(5)),
        )));
        registry.insert(Box::new(CrowdDetector::new(crowd.clone())));
        registry.insert(Box::new(FallDetector::new(fall.clone(), AlertGate::default())));
        registry.mark_unavailable(DetectorKind::Weapon, "no model configured");

        let display = Arc::new(RecordingDisplay::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = ControllerSettings {
            working_size: (W, H),
            confidence: BTreeMap::new(),
            file: file.map(PathBuf::from),
            device: "0".into(),
            read_timeout: Duration::from_millis(50),
        };
        let controller = PipelineController::new(
            settings,
            registry,
            Box::new(backend.clone()),
            display.clone(),
            notifier.clone(),
        );
        Harness {
            controller,
            backend,
            display,
            notifier,
            people,
            crowd,
            fall,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedBackend::default(), Some("clip.mp4"))
    }

    fn select(kinds: &[DetectorKind]) -> BTreeSet<DetectorKind> {
        kinds.iter().copied().collect()
    }

    fn processed(outcome: TickOutcome) -> CycleReport {
        match outcome {
            TickOutcome::Processed(report) => report,
            other => panic!("expected a processed cycle, got {other:?}"),
        }
    }

    #[test]
    fn empty_selection_is_a_configuration_error() {
        let mut h = harness();
        let err = h.controller.start(SourceKind::Live, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert_eq!(h.backend.opened(), 0);
    }

    #[test]
    fn file_mode_without_path_leaves_modules_unchanged() {
        let mut h = harness_with(ScriptedBackend::default(), None);
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fall]))
            .unwrap();
        let err = h
            .controller
            .start(SourceKind::File, &select(&[DetectorKind::Crowd]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(h.controller.modules().active(), vec![DetectorKind::Fall]);
        assert_eq!(h.controller.state(), ControllerState::Running(SourceKind::Live));
    }

    #[test]
    fn unavailable_detector_is_rejected() {
        let mut h = harness();
        let err = h
            .controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Crowd, DetectorKind::Weapon]),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable(DetectorKind::Weapon)));
        // Fire was never registered either.
        let err = h
            .controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fire]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable(DetectorKind::Fire)));
        assert_eq!(h.controller.state(), ControllerState::Idle);
    }

    #[test]
    fn open_failure_stays_idle() {
        let backend = ScriptedBackend {
            fail_open: true,
            ..ScriptedBackend::default()
        };
        let mut h = harness_with(backend, Some("clip.mp4"));
        let err = h
            .controller
            .start(SourceKind::File, &select(&[DetectorKind::Fall]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Capture(_)));
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert!(h.controller.modules().active().is_empty());
    }

    #[test]
    fn start_announces_detectors_and_mode() {
        let mut h = harness();
        h.controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Crowd, DetectorKind::Trespassing]),
            )
            .unwrap();
        assert_eq!(
            h.display.all(),
            vec!["Started: Trespassing Detection, Crowd Detection (live)".to_string()]
        );
    }

    #[test]
    fn live_session_is_reused_across_starts() {
        let mut h = harness();
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fall]))
            .unwrap();
        h.controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Fall, DetectorKind::Crowd]),
            )
            .unwrap();
        assert_eq!(h.backend.opened(), 1);
        assert_eq!(
            h.controller.modules().active(),
            vec![DetectorKind::Fall, DetectorKind::Crowd]
        );

        h.controller
            .start(SourceKind::File, &select(&[DetectorKind::Fall]))
            .unwrap();
        assert_eq!(h.backend.opened(), 2);
        assert_eq!(h.backend.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = harness();
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fall]))
            .unwrap();
        assert!(h.controller.stop());
        assert!(!h.controller.stop());
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert!(h.controller.modules().active().is_empty());
        assert_eq!(h.backend.closed.load(Ordering::SeqCst), 1);
        let stops = h
            .display
            .all()
            .into_iter()
            .filter(|message| message == "Detection stopped")
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn idle_tick_is_a_no_op() {
        let mut h = harness();
        assert_eq!(h.controller.tick(), TickOutcome::Idle);
        assert_eq!(h.people.calls(), 0);
    }

    #[test]
    fn crowd_displays_the_trespassing_count_of_the_same_cycle() {
        let mut h = harness();
        h.controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Trespassing, DetectorKind::Crowd]),
            )
            .unwrap();

        let report = processed(h.controller.tick());

        assert_eq!(report.crowd_count, Some(3));
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].route, AlertRoute::Track);
        assert_eq!(h.notifier.routes(), vec![AlertRoute::Track]);
        // Crowd still infers for its boxes.
        assert_eq!(h.crowd.calls(), 1);
        // Trespassing inferred once for both passes.
        assert_eq!(h.people.calls(), 1);
        assert_eq!(h.controller.status().crowd_count, Some(3));
    }

    #[test]
    fn crowd_counts_itself_without_trespassing() {
        let mut h = harness();
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Crowd]))
            .unwrap();
        let report = processed(h.controller.tick());
        assert_eq!(report.crowd_count, Some(2));
        assert_eq!(h.people.calls(), 0);
    }

    #[test]
    fn stale_count_is_never_reused_after_producer_stops() {
        let mut h = harness();
        h.controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Trespassing, DetectorKind::Crowd]),
            )
            .unwrap();
        assert_eq!(processed(h.controller.tick()).crowd_count, Some(3));

        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Crowd]))
            .unwrap();
        assert_eq!(processed(h.controller.tick()).crowd_count, Some(2));
    }

    #[test]
    fn cooldown_limits_notifications_across_cycles() {
        let mut h = harness();
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Trespassing]))
            .unwrap();
        let t0 = Instant::now();
        for offset in [0, 3, 6] {
            processed(h.controller.tick_at(t0 + Duration::from_secs(offset)));
        }
        assert_eq!(h.notifier.routes().len(), 2);
        let important = h.display.important();
        assert_eq!(important.len(), 2);
        assert!(important.iter().all(|m| m == "Person detected on railway track!"));
    }

    #[test]
    fn end_of_file_stops_once_and_allows_restart() {
        let mut h = harness();
        h.backend.script(vec![Ok(frame())]);
        h.controller
            .start(SourceKind::File, &select(&[DetectorKind::Fall]))
            .unwrap();

        processed(h.controller.tick());
        assert_eq!(h.controller.tick(), TickOutcome::Ended);
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert_eq!(h.controller.tick(), TickOutcome::Idle);
        let stops = h
            .display
            .all()
            .into_iter()
            .filter(|message| message == "Detection stopped")
            .count();
        assert_eq!(stops, 1);

        h.backend.script(vec![Ok(frame())]);
        h.controller
            .start(SourceKind::File, &select(&[DetectorKind::Fall]))
            .unwrap();
        processed(h.controller.tick());
    }

    #[test]
    fn transient_live_failure_skips_the_cycle() {
        let mut h = harness();
        h.backend
            .script(vec![Err(ReadError::Transient("timeout".into())), Ok(frame())]);
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fall]))
            .unwrap();
        assert_eq!(h.controller.tick(), TickOutcome::Skipped);
        assert_eq!(h.controller.state(), ControllerState::Running(SourceKind::Live));
        assert_eq!(h.fall.calls(), 0);
        processed(h.controller.tick());
        assert_eq!(h.fall.calls(), 1);
    }

    #[test]
    fn stalled_file_read_skips_instead_of_stopping() {
        let mut h = harness();
        h.backend.script(vec![
            Err(ReadError::Transient("decoder stalled".into())),
            Ok(frame()),
        ]);
        h.controller
            .start(SourceKind::File, &select(&[DetectorKind::Fall]))
            .unwrap();
        assert_eq!(h.controller.tick(), TickOutcome::Skipped);
        assert_eq!(h.controller.state(), ControllerState::Running(SourceKind::File));
        processed(h.controller.tick());
        assert_eq!(h.controller.tick(), TickOutcome::Ended);
    }

    #[test]
    fn failing_detector_does_not_block_the_others() {
        let mut h = harness();
        let mut registry = DetectorRegistry::default();
        registry.insert(Box::new(FallDetector::new(FakeModel::failing(), AlertGate::default())));
        registry.insert(Box::new(CrowdDetector::new(h.crowd.clone())));
        h.controller = PipelineController::new(
            h.controller.settings.clone(),
            registry,
            Box::new(h.backend.clone()),
            h.display.clone(),
            h.notifier.clone(),
        );
        h.controller
            .start(
                SourceKind::Live,
                &select(&[DetectorKind::Fall, DetectorKind::Crowd]),
            )
            .unwrap();

        let report = processed(h.controller.tick());
        assert_eq!(report.detector_errors, 2);
        assert_eq!(report.crowd_count, Some(2));
    }

    #[test]
    fn stop_requested_mid_cycle_discards_results() {
        let mut h = harness();
        h.controller
            .start(SourceKind::Live, &select(&[DetectorKind::Fall]))
            .unwrap();
        h.controller.stop_handle().request();
        assert_eq!(h.controller.tick(), TickOutcome::Cancelled);
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert!(h.display.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn working_frame_swaps_channels_and_resizes() {
        let mut raw = frame();
        raw.data[0..3].copy_from_slice(&[10, 20, 30]);
        let image = to_working_frame(&raw, (W, H)).unwrap();
        assert_eq!(*image.get_pixel(0, 0), Rgb([30, 20, 10]));

        let resized = to_working_frame(&raw, (50, 40)).unwrap();
        assert_eq!(resized.dimensions(), (50, 40));

        raw.data.truncate(10);
        assert!(to_working_frame(&raw, (W, H)).is_err());
    }
}

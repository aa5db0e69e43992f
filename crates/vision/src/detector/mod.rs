//! Detector contract shared by every frame analyzer.
//!
//! A detector runs twice per cycle: an alert pass that may fire its
//! [`AlertGate`] and publish shared signals, then a visual pass that draws onto
//! the display frame. Both passes see the clean working frame. Detectors cache
//! their inference for one `(cycle, threshold)` pair so the visual pass reuses
//! what the alert pass computed.

use std::{fmt, str::FromStr, time::Instant};

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    alert::AlertGate,
    display::Display,
    notify::{AlertRoute, Notifier},
    signal::SharedSignalBus,
};

pub mod crowd;
pub mod fall;
pub mod fire;
pub mod trespassing;
pub mod weapon;

pub use crowd::CrowdDetector;
pub use fall::FallDetector;
pub use fire::FireDetector;
pub use trespassing::TrespassingDetector;
pub use weapon::WeaponDetector;

/// Registered detector variants. The derived ordering is the fixed per-cycle
/// execution order: the person count producer runs before its consumer.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Trespassing,
    Fall,
    Crowd,
    Fire,
    Weapon,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 5] = [
        DetectorKind::Trespassing,
        DetectorKind::Fall,
        DetectorKind::Crowd,
        DetectorKind::Fire,
        DetectorKind::Weapon,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DetectorKind::Trespassing => "trespassing",
            DetectorKind::Fall => "fall",
            DetectorKind::Crowd => "crowd",
            DetectorKind::Fire => "fire",
            DetectorKind::Weapon => "weapon",
        }
    }

    /// Operator-facing name used in status messages.
    pub fn title(self) -> &'static str {
        match self {
            DetectorKind::Trespassing => "Trespassing Detection",
            DetectorKind::Fall => "Fall Detection",
            DetectorKind::Crowd => "Crowd Detection",
            DetectorKind::Fire => "Fire Detection",
            DetectorKind::Weapon => "Weapon Detection",
        }
    }

    pub fn default_confidence(self) -> f32 {
        match self {
            DetectorKind::Crowd => 0.4,
            _ => 0.5,
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let name = normalized
            .strip_suffix("_detection")
            .unwrap_or(&normalized);
        DetectorKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| {
                format!(
                    "unknown detector {value:?} (expected one of trespassing, fall, crowd, fire, weapon)"
                )
            })
    }
}

/// The clean working frame of one cycle.
pub struct CycleInput<'a> {
    pub cycle: u64,
    pub frame: &'a RgbImage,
    pub now: Instant,
}

/// A gated alert that fired this cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub detector: DetectorKind,
    pub message: String,
    pub route: AlertRoute,
}

/// Side-effect surface handed to alert passes.
pub struct AlertContext<'a> {
    pub cycle: u64,
    pub now: Instant,
    display: &'a dyn Display,
    notifier: &'a dyn Notifier,
    bus: &'a mut SharedSignalBus,
    fired: Vec<Alert>,
}

impl<'a> AlertContext<'a> {
    pub fn new(
        cycle: u64,
        now: Instant,
        display: &'a dyn Display,
        notifier: &'a dyn Notifier,
        bus: &'a mut SharedSignalBus,
    ) -> Self {
        Self {
            cycle,
            now,
            display,
            notifier,
            bus,
            fired: Vec::new(),
        }
    }

    /// Offer `alert` to `gate`. When the gate fires the message is shown as
    /// important and the route is handed to the notifier; delivery happens off
    /// the cycle and its outcome never touches the gate.
    pub fn raise(&mut self, gate: &mut AlertGate, alert: Alert) -> bool {
        let detector = alert.detector.name();
        if !gate.try_fire(self.now) {
            metrics::counter!("railguard_alerts_suppressed_total", "detector" => detector)
                .increment(1);
            return false;
        }
        metrics::counter!("railguard_alerts_fired_total", "detector" => detector).increment(1);
        info!(detector, route = alert.route.path(), "{}", alert.message);
        self.display.emit(&alert.message, true);
        self.notifier.notify(alert.route);
        self.fired.push(alert);
        true
    }

    pub fn publish_count(&mut self, count: usize) {
        self.bus.publish(self.cycle, count);
    }

    pub fn into_fired(self) -> Vec<Alert> {
        self.fired
    }
}

/// One analysis capability over a single frame.
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    /// Evaluate the alert predicate against the clean frame and offer any
    /// alert to this detector's gate. Must not draw.
    fn alert_pass(
        &mut self,
        input: &CycleInput<'_>,
        threshold: f32,
        ctx: &mut AlertContext<'_>,
    ) -> Result<()>;

    /// Draw overlays for detections above `threshold` onto `display`.
    /// `shared_count` is the person count published this cycle, if any.
    fn visual_pass(
        &mut self,
        input: &CycleInput<'_>,
        display: &mut RgbImage,
        threshold: f32,
        shared_count: Option<usize>,
    ) -> Result<()>;

    /// Persons counted by the most recent pass, for detectors that count.
    fn person_count(&self) -> Option<usize> {
        None
    }
}

/// One inference result kept for the `(cycle, threshold)` it was computed for.
pub(crate) struct CycleCache<T> {
    entry: Option<((u64, u32), T)>,
}

impl<T> Default for CycleCache<T> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<T> CycleCache<T> {
    pub(crate) fn get_or_try_insert(
        &mut self,
        cycle: u64,
        threshold: f32,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<&T> {
        let key = (cycle, threshold.to_bits());
        match self.entry.take() {
            Some((cached, value)) if cached == key => Ok(&self.entry.insert((cached, value)).1),
            _ => {
                let value = compute()?;
                Ok(&self.entry.insert((key, value)).1)
            }
        }
    }
}

pub(crate) fn format_confidence(confidence: f32) -> String {
    format!("{confidence:.2}")
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators shared by the detector and controller tests.

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use anyhow::anyhow;
    use image::RgbImage;
    use ml_core::{Detection, InferenceModel, ModelError, SegmentationModel, TrackMask};

    use crate::{
        display::{CycleReport, Display},
        notify::{AlertRoute, Notifier},
    };

    /// Returns a fixed detection list filtered by threshold and counts calls.
    #[derive(Default)]
    pub struct FakeModel {
        pub detections: Mutex<Vec<Detection>>,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl FakeModel {
        pub fn with(detections: Vec<Detection>) -> Arc<Self> {
            Arc::new(Self {
                detections: Mutex::new(detections),
                ..Self::default()
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Self::default()
            })
        }

        pub fn set(&self, detections: Vec<Detection>) {
            *self.detections.lock().unwrap() = detections;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceModel for FakeModel {
        fn infer(&self, _frame: &RgbImage, threshold: f32) -> Result<Vec<Detection>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModelError::Inference(anyhow!("fake model failure")));
            }
            Ok(self
                .detections
                .lock()
                .unwrap()
                .iter()
                .filter(|detection| detection.confidence >= threshold)
                .cloned()
                .collect())
        }
    }

    pub struct FakeSegmenter {
        pub mask: Option<TrackMask>,
    }

    impl SegmentationModel for FakeSegmenter {
        fn segment(&self, _frame: &RgbImage) -> Result<Option<TrackMask>, ModelError> {
            Ok(self.mask.clone())
        }
    }

    #[derive(Default)]
    pub struct RecordingDisplay {
        pub messages: Mutex<Vec<(String, bool)>>,
        pub frames: Mutex<Vec<CycleReport>>,
    }

    impl RecordingDisplay {
        pub fn important(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, important)| *important)
                .map(|(message, _)| message.clone())
                .collect()
        }

        pub fn all(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(message, _)| message.clone())
                .collect()
        }
    }

    impl Display for RecordingDisplay {
        fn emit(&self, message: &str, important: bool) {
            self.messages
                .lock()
                .unwrap()
                .push((message.to_string(), important));
        }

        fn show_frame(&self, _frame: &RgbImage, report: &CycleReport) {
            self.frames.lock().unwrap().push(report.clone());
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub routes: Mutex<Vec<AlertRoute>>,
    }

    impl RecordingNotifier {
        pub fn routes(&self) -> Vec<AlertRoute> {
            self.routes.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, route: AlertRoute) {
            self.routes.lock().unwrap().push(route);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{testing::*, *};

    #[test]
    fn kinds_sort_in_execution_order() {
        let mut kinds = vec![
            DetectorKind::Weapon,
            DetectorKind::Crowd,
            DetectorKind::Trespassing,
            DetectorKind::Fire,
            DetectorKind::Fall,
        ];
        kinds.sort();
        assert_eq!(kinds, DetectorKind::ALL.to_vec());
    }

    #[test]
    fn parses_names_and_legacy_suffix() {
        assert_eq!("Crowd".parse::<DetectorKind>(), Ok(DetectorKind::Crowd));
        assert_eq!(
            "trespassing_detection".parse::<DetectorKind>(),
            Ok(DetectorKind::Trespassing)
        );
        assert!("smoke".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn default_confidences() {
        assert_eq!(DetectorKind::Crowd.default_confidence(), 0.4);
        assert_eq!(DetectorKind::Fall.default_confidence(), 0.5);
    }

    #[test]
    fn raise_notifies_only_when_gate_fires() {
        let display = RecordingDisplay::default();
        let notifier = RecordingNotifier::default();
        let mut bus = SharedSignalBus::new();
        let mut gate = AlertGate::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let alert = Alert {
            detector: DetectorKind::Fall,
            message: "Fall detected!".into(),
            route: AlertRoute::Fall,
        };

        for offset in [0, 3, 6] {
            let now = t0 + Duration::from_secs(offset);
            let mut ctx = AlertContext::new(offset, now, &display, &notifier, &mut bus);
            ctx.raise(&mut gate, alert.clone());
        }

        assert_eq!(notifier.routes(), vec![AlertRoute::Fall, AlertRoute::Fall]);
        assert_eq!(display.important().len(), 2);
    }

    #[test]
    fn cache_reuses_value_for_same_cycle_and_threshold() {
        let mut cache = CycleCache::default();
        let mut computed = 0;
        for _ in 0..2 {
            cache
                .get_or_try_insert(1, 0.5, || {
                    computed += 1;
                    Ok(computed)
                })
                .unwrap();
        }
        assert_eq!(computed, 1);
        let value = *cache.get_or_try_insert(2, 0.5, || Ok(10)).unwrap();
        assert_eq!(value, 10);
        let value = *cache.get_or_try_insert(2, 0.6, || Ok(11)).unwrap();
        assert_eq!(value, 11);
    }
}

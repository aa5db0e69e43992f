use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ml_core::{Detection, InferenceModel};

use super::{Alert, AlertContext, CycleCache, CycleInput, Detector, DetectorKind, format_confidence};
use crate::{
    alert::AlertGate,
    annotation::{GREEN, RED, draw_label, draw_rectangle, label_origin},
    notify::AlertRoute,
};

pub const FALL_LABEL: &str = "fall-detected";
pub const NO_FALL_LABEL: &str = "nofall";
const FALL_ALERT: &str = "Fall detected!";

pub struct FallDetector {
    model: Arc<dyn InferenceModel>,
    gate: AlertGate,
    detections: CycleCache<Vec<Detection>>,
}

impl FallDetector {
    pub fn new(model: Arc<dyn InferenceModel>, gate: AlertGate) -> Self {
        Self {
            model,
            gate,
            detections: CycleCache::default(),
        }
    }

    fn detect(&mut self, input: &CycleInput<'_>, threshold: f32) -> Result<&[Detection]> {
        let model = &self.model;
        let detections = self
            .detections
            .get_or_try_insert(input.cycle, threshold, || {
                Ok(model.infer(input.frame, threshold)?)
            })?;
        Ok(detections)
    }
}

impl Detector for FallDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Fall
    }

    fn alert_pass(
        &mut self,
        input: &CycleInput<'_>,
        threshold: f32,
        ctx: &mut AlertContext<'_>,
    ) -> Result<()> {
        let fallen = self
            .detect(input, threshold)?
            .iter()
            .any(|detection| detection.is(FALL_LABEL));
        if fallen {
            ctx.raise(
                &mut self.gate,
                Alert {
                    detector: DetectorKind::Fall,
                    message: FALL_ALERT.into(),
                    route: AlertRoute::Fall,
                },
            );
        }
        Ok(())
    }

    fn visual_pass(
        &mut self,
        input: &CycleInput<'_>,
        display: &mut RgbImage,
        threshold: f32,
        _shared_count: Option<usize>,
    ) -> Result<()> {
        for detection in self.detect(input, threshold)? {
            let (color, thickness, scale, text) = if detection.is(FALL_LABEL) {
                (RED, 3, 2, format!("FALL {}", format_confidence(detection.confidence)))
            } else if detection.is(NO_FALL_LABEL) {
                (GREEN, 2, 1, format!("No Fall {}", format_confidence(detection.confidence)))
            } else {
                continue;
            };
            draw_rectangle(display, detection.bbox, color, thickness);
            let (x, y) = label_origin(detection.bbox, scale);
            draw_label(display, x, y, &text, color, scale);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use ml_core::BoundingBox;

    use super::*;
    use crate::{
        detector::testing::{FakeModel, RecordingDisplay, RecordingNotifier},
        signal::SharedSignalBus,
    };

    fn run_alert(detector: &mut FallDetector, cycle: u64, now: Instant) -> Vec<AlertRoute> {
        let frame = RgbImage::new(64, 64);
        let input = CycleInput {
            cycle,
            frame: &frame,
            now,
        };
        let display = RecordingDisplay::default();
        let notifier = RecordingNotifier::default();
        let mut bus = SharedSignalBus::new();
        let mut ctx = AlertContext::new(cycle, now, &display, &notifier, &mut bus);
        detector.alert_pass(&input, 0.5, &mut ctx).unwrap();
        notifier.routes()
    }

    #[test]
    fn fall_label_fires_through_cooldown() {
        let model = FakeModel::with(vec![Detection::new(
            "Fall-Detected",
            0.91,
            BoundingBox::new(4, 20, 30, 40),
        )]);
        let mut detector = FallDetector::new(model, AlertGate::new(Duration::from_secs(5)));
        let t0 = Instant::now();

        let routes: Vec<_> = [0u64, 3, 6]
            .into_iter()
            .flat_map(|offset| run_alert(&mut detector, offset, t0 + Duration::from_secs(offset)))
            .collect();

        assert_eq!(routes, vec![AlertRoute::Fall, AlertRoute::Fall]);
    }

    #[test]
    fn nofall_and_low_confidence_do_not_fire() {
        let model = FakeModel::with(vec![
            Detection::new("nofall", 0.95, BoundingBox::new(0, 0, 10, 10)),
            Detection::new("fall-detected", 0.3, BoundingBox::new(0, 0, 10, 10)),
        ]);
        let mut detector = FallDetector::new(model, AlertGate::default());
        assert!(run_alert(&mut detector, 0, Instant::now()).is_empty());
    }

    #[test]
    fn visual_pass_draws_fall_in_red_and_nofall_in_green() {
        let model = FakeModel::with(vec![
            Detection::new("fall-detected", 0.9, BoundingBox::new(4, 30, 20, 50)),
            Detection::new("nofall", 0.9, BoundingBox::new(30, 30, 60, 60)),
        ]);
        let mut detector = FallDetector::new(model, AlertGate::default());
        let frame = RgbImage::new(64, 64);
        let input = CycleInput {
            cycle: 1,
            frame: &frame,
            now: Instant::now(),
        };
        let mut canvas = frame.clone();
        detector.visual_pass(&input, &mut canvas, 0.5, None).unwrap();
        assert_eq!(*canvas.get_pixel(10, 50), RED);
        assert_eq!(*canvas.get_pixel(45, 60), GREEN);
    }

    #[test]
    fn inference_failure_is_reported() {
        let mut detector = FallDetector::new(FakeModel::failing(), AlertGate::default());
        let frame = RgbImage::new(8, 8);
        let input = CycleInput {
            cycle: 1,
            frame: &frame,
            now: Instant::now(),
        };
        let mut canvas = frame.clone();
        assert!(detector.visual_pass(&input, &mut canvas, 0.5, None).is_err());
    }
}

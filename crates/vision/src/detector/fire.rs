use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ml_core::{Detection, InferenceModel};

use super::{Alert, AlertContext, CycleCache, CycleInput, Detector, DetectorKind, format_confidence};
use crate::{
    alert::AlertGate,
    annotation::{GREY, ORANGE, draw_label, draw_rectangle, label_origin},
    notify::AlertRoute,
};

pub const FIRE_LABEL: &str = "fire";
pub const SMOKE_LABEL: &str = "smoke";

pub struct FireDetector {
    model: Arc<dyn InferenceModel>,
    gate: AlertGate,
    detections: CycleCache<Vec<Detection>>,
}

impl FireDetector {
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

/// Alert text for the combination seen in one frame, evaluated after all boxes.
fn fire_message(fire: bool, smoke: bool) -> Option<&'static str> {
    match (fire, smoke) {
        (true, true) => Some("Fire and Smoke detected!"),
        (true, false) => Some("Fire detected!"),
        (false, true) => Some("Smoke detected!"),
        (false, false) => None,
    }
}

impl Detector for FireDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Fire
    }

    fn alert_pass(
        &mut self,
        input: &CycleInput<'_>,
        threshold: f32,
        ctx: &mut AlertContext<'_>,
    ) -> Result<()> {
        let detections = self.detect(input, threshold)?;
        let fire = detections.iter().any(|detection| detection.is(FIRE_LABEL));
        let smoke = detections.iter().any(|detection| detection.is(SMOKE_LABEL));
        if let Some(message) = fire_message(fire, smoke) {
            ctx.raise(
                &mut self.gate,
                Alert {
                    detector: DetectorKind::Fire,
                    message: message.into(),
                    route: AlertRoute::Fire,
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
            let (color, tag) = if detection.is(FIRE_LABEL) {
                (ORANGE, "FIRE")
            } else if detection.is(SMOKE_LABEL) {
                (GREY, "SMOKE")
            } else {
                continue;
            };
            draw_rectangle(display, detection.bbox, color, 3);
            let (x, y) = label_origin(detection.bbox, 2);
            let text = format!("{tag} {}", format_confidence(detection.confidence));
            draw_label(display, x, y, &text, color, 2);
        }
        Ok(())
    }
}

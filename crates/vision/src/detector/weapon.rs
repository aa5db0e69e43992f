use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ml_core::{Detection, InferenceModel};

use super::{Alert, AlertContext, CycleCache, CycleInput, Detector, DetectorKind, format_confidence};
use crate::{
    alert::AlertGate,
    annotation::{BLUE, MAGENTA, draw_label, draw_rectangle, label_origin},
    notify::AlertRoute,
};

pub const WEAPON_LABEL: &str = "weapon";
const WEAPON_ALERT: &str = "Weapon detected!";

pub struct WeaponDetector {
    model: Arc<dyn InferenceModel>,
    gate: AlertGate,
    detections: CycleCache<Vec<Detection>>,
}

impl WeaponDetector {
    pub fn new(model: Arc<dyn InferenceModel>, gate: AlertGate) -> Self {
        Self {
            model,
            gate,
            detections: CycleCache::default(),
        }
    }

    fn weapons(&mut self, input: &CycleInput<'_>, threshold: f32) -> Result<&[Detection]> {
        let model = &self.model;
        let weapons = self
            .detections
            .get_or_try_insert(input.cycle, threshold, || {
                Ok(model
                    .infer(input.frame, threshold)?
                    .into_iter()
                    .filter(|detection| detection.is(WEAPON_LABEL))
                    .collect())
            })?;
        Ok(weapons)
    }
}

impl Detector for WeaponDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Weapon
    }

    fn alert_pass(
        &mut self,
        input: &CycleInput<'_>,
        threshold: f32,
        ctx: &mut AlertContext<'_>,
    ) -> Result<()> {
        if !self.weapons(input, threshold)?.is_empty() {
            ctx.raise(
                &mut self.gate,
                Alert {
                    detector: DetectorKind::Weapon,
                    message: WEAPON_ALERT.into(),
                    route: AlertRoute::Weapon,
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
        for weapon in self.weapons(input, threshold)? {
            draw_rectangle(display, weapon.bbox, MAGENTA, 3);
            let (x, y) = label_origin(weapon.bbox, 1);
            let text = format!("{} {}", weapon.label, format_confidence(weapon.confidence));
            draw_label(display, x, y, &text, BLUE, 1);
        }
        Ok(())
    }
}

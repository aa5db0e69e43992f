//! Crowd counting. Has no alert predicate of its own; its visual pass boxes
//! every person and draws the head count, preferring the count the
//! trespassing detector published this cycle.

use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ml_core::{Detection, InferenceModel};

use super::{AlertContext, CycleCache, CycleInput, Detector, DetectorKind, trespassing::PERSON_LABEL};
use crate::annotation::{CYAN, YELLOW, draw_label, draw_rectangle};

pub struct CrowdDetector {
    model: Arc<dyn InferenceModel>,
    persons: CycleCache<Vec<Detection>>,
    person_count: usize,
}

impl CrowdDetector {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self {
            model,
            persons: CycleCache::default(),
            person_count: 0,
        }
    }
}

impl Detector for CrowdDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Crowd
    }

    fn alert_pass(
        &mut self,
        _input: &CycleInput<'_>,
        _threshold: f32,
        _ctx: &mut AlertContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn visual_pass(
        &mut self,
        input: &CycleInput<'_>,
        display: &mut RgbImage,
        threshold: f32,
        shared_count: Option<usize>,
    ) -> Result<()> {
        let model = &self.model;
        let persons = self.persons.get_or_try_insert(input.cycle, threshold, || {
            Ok(model
                .infer(input.frame, threshold)?
                .into_iter()
                .filter(|detection| detection.is(PERSON_LABEL))
                .collect())
        })?;
        for person in persons {
            draw_rectangle(display, person.bbox, YELLOW, 2);
        }
        let count = shared_count.unwrap_or(persons.len());
        self.person_count = count;
        draw_label(display, 10, 30, &format!("People: {count}"), CYAN, 2);
        Ok(())
    }

    fn person_count(&self) -> Option<usize> {
        Some(self.person_count)
    }
}

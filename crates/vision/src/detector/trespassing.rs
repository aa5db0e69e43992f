//! Person-on-track detection.
//!
//! A segmentation model marks the track area; a person is trespassing when the
//! centre of its box lies on the mask. This detector also produces the person
//! count consumed by the crowd detector.

use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use ml_core::{Detection, InferenceModel, SegmentationModel, TrackMask};

use super::{Alert, AlertContext, CycleCache, CycleInput, Detector, DetectorKind};
use crate::{
    alert::AlertGate,
    annotation::{GREEN, RED, blend_mask, draw_label, fill_circle},
    notify::AlertRoute,
};

pub const PERSON_LABEL: &str = "person";
const TRACK_ALERT: &str = "Person detected on railway track!";

pub struct TrespassingDetector {
    segmenter: Arc<dyn SegmentationModel>,
    people: Arc<dyn InferenceModel>,
    gate: AlertGate,
    track: CycleCache<Option<TrackMask>>,
    persons: CycleCache<Vec<Detection>>,
    person_count: usize,
}

/// Track mask and persons of one frame.
struct Scene<'a> {
    track: Option<&'a TrackMask>,
    persons: &'a [Detection],
}

impl Scene<'_> {
    fn person_on_track(&self) -> bool {
        let Some(track) = self.track else {
            return false;
        };
        self.persons.iter().any(|person| {
            let (cx, cy) = person.bbox.center();
            track.contains(cx, cy)
        })
    }
}

impl TrespassingDetector {
    pub fn new(
        segmenter: Arc<dyn SegmentationModel>,
        people: Arc<dyn InferenceModel>,
        gate: AlertGate,
    ) -> Self {
        Self {
            segmenter,
            people,
            gate,
            track: CycleCache::default(),
            persons: CycleCache::default(),
            person_count: 0,
        }
    }

    fn analyze(&mut self, input: &CycleInput<'_>, threshold: f32) -> Result<Scene<'_>> {
        let segmenter = &self.segmenter;
        let people = &self.people;
        // The mask does not depend on the threshold; key it at zero.
        let track = self
            .track
            .get_or_try_insert(input.cycle, 0.0, || Ok(segmenter.segment(input.frame)?))?
            .as_ref();
        let persons = self.persons.get_or_try_insert(input.cycle, threshold, || {
            Ok(people
                .infer(input.frame, threshold)?
                .into_iter()
                .filter(|detection| detection.is(PERSON_LABEL))
                .collect())
        })?;
        self.person_count = persons.len();
        Ok(Scene { track, persons })
    }
}

impl Detector for TrespassingDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Trespassing
    }

    fn alert_pass(
        &mut self,
        input: &CycleInput<'_>,
        threshold: f32,
        ctx: &mut AlertContext<'_>,
    ) -> Result<()> {
        let (count, on_track) = {
            let scene = self.analyze(input, threshold)?;
            (scene.persons.len(), scene.person_on_track())
        };
        ctx.publish_count(count);
        if on_track {
            ctx.raise(
                &mut self.gate,
                Alert {
                    detector: DetectorKind::Trespassing,
                    message: TRACK_ALERT.into(),
                    route: AlertRoute::Track,
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
        let scene = self.analyze(input, threshold)?;
        if let Some(mask) = scene.track {
            blend_mask(display, mask, RED, 0.5);
        }
        for person in scene.persons {
            let (cx, cy) = person.bbox.center();
            fill_circle(display, cx, cy, 5, GREEN);
            draw_label(display, person.bbox.x1, person.bbox.y1 - 10, "Person", GREEN, 1);
        }
        Ok(())
    }

    fn person_count(&self) -> Option<usize> {
        Some(self.person_count)
    }
}

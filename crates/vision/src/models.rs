//! Builds the detector set from configured model files.
//!
//! A model that fails to load makes its detector permanently unavailable for
//! this process; the other detectors are unaffected.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ml_core::{ComputeDevice, InferenceModel, ModelError};
use tracing::{info, warn};

use crate::{
    alert::{AlertGate, DEFAULT_COOLDOWN},
    detector::{
        CrowdDetector, Detector, DetectorKind, FallDetector, FireDetector, TrespassingDetector,
        WeaponDetector,
    },
    pipeline::config::ModelPaths,
};

/// Square input size the detection and segmentation models were exported with.
pub const MODEL_INPUT_SIZE: (i64, i64) = (640, 640);

/// Loaded detectors plus the reason each missing one is unavailable.
#[derive(Default)]
pub struct DetectorRegistry {
    pub detectors: BTreeMap<DetectorKind, Box<dyn Detector>>,
    pub unavailable: BTreeMap<DetectorKind, String>,
}

impl DetectorRegistry {
    pub fn insert(&mut self, detector: Box<dyn Detector>) {
        self.detectors.insert(detector.kind(), detector);
    }

    pub fn mark_unavailable(&mut self, kind: DetectorKind, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(detector = kind.name(), "{} unavailable: {reason}", kind.title());
        self.unavailable.insert(kind, reason);
    }
}

/// Loads each model file once, so detectors configured with the same path
/// share one instance.
struct ModelCache {
    device: ComputeDevice,
    detectors: HashMap<PathBuf, Arc<dyn InferenceModel>>,
}

impl ModelCache {
    fn detector(&mut self, path: &Path) -> Result<Arc<dyn InferenceModel>, ModelError> {
        if let Some(model) = self.detectors.get(path) {
            return Ok(model.clone());
        }
        let model = ml_core::load_detector(path, MODEL_INPUT_SIZE, self.device)?;
        info!(path = %path.display(), "loaded detection model");
        self.detectors.insert(path.to_path_buf(), model.clone());
        Ok(model)
    }
}

pub fn load_detectors(
    paths: &ModelPaths,
    cooldown: &BTreeMap<DetectorKind, Duration>,
) -> DetectorRegistry {
    let gate = |kind: DetectorKind| {
        AlertGate::new(cooldown.get(&kind).copied().unwrap_or(DEFAULT_COOLDOWN))
    };
    let mut cache = ModelCache {
        device: paths.device,
        detectors: HashMap::new(),
    };
    let mut registry = DetectorRegistry::default();

    let trespassing = ml_core::load_segmenter(&paths.track, MODEL_INPUT_SIZE, paths.device)
        .and_then(|segmenter| Ok((segmenter, cache.detector(&paths.person)?)));
    match trespassing {
        Ok((segmenter, people)) => registry.insert(Box::new(TrespassingDetector::new(
            segmenter,
            people,
            gate(DetectorKind::Trespassing),
        ))),
        Err(err) => registry.mark_unavailable(DetectorKind::Trespassing, err.to_string()),
    }

    match cache.detector(&paths.fall) {
        Ok(model) => registry.insert(Box::new(FallDetector::new(model, gate(DetectorKind::Fall)))),
        Err(err) => registry.mark_unavailable(DetectorKind::Fall, err.to_string()),
    }

    match cache.detector(&paths.crowd) {
        Ok(model) => registry.insert(Box::new(CrowdDetector::new(model))),
        Err(err) => registry.mark_unavailable(DetectorKind::Crowd, err.to_string()),
    }

    match paths.fire.as_deref().map(|path| cache.detector(path)) {
        Some(Ok(model)) => {
            registry.insert(Box::new(FireDetector::new(model, gate(DetectorKind::Fire))))
        }
        Some(Err(err)) => registry.mark_unavailable(DetectorKind::Fire, err.to_string()),
        None => registry.mark_unavailable(DetectorKind::Fire, "no model configured"),
    }

    match paths.weapon.as_deref().map(|path| cache.detector(path)) {
        Some(Ok(model)) => {
            registry.insert(Box::new(WeaponDetector::new(model, gate(DetectorKind::Weapon))))
        }
        Some(Err(err)) => registry.mark_unavailable(DetectorKind::Weapon, err.to_string()),
        None => registry.mark_unavailable(DetectorKind::Weapon, "no model configured"),
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> ModelPaths {
        ModelPaths {
            track: PathBuf::from("missing-track.pt"),
            person: PathBuf::from("missing-person.pt"),
            crowd: PathBuf::from("missing-person.pt"),
            fall: PathBuf::from("missing-fall.pt"),
            fire: None,
            weapon: None,
            device: ComputeDevice::Cpu,
        }
    }

    #[test]
    fn missing_models_mark_every_detector_unavailable() {
        let registry = load_detectors(&paths(), &BTreeMap::new());
        assert!(registry.detectors.is_empty());
        assert_eq!(
            registry.unavailable.keys().copied().collect::<Vec<_>>(),
            DetectorKind::ALL.to_vec()
        );
        assert_eq!(registry.unavailable[&DetectorKind::Fire], "no model configured");
    }
}

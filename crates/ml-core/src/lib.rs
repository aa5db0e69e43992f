//! Inference capabilities consumed by the detection pipeline.
//!
//! The pipeline only sees the [`InferenceModel`] and [`SegmentationModel`]
//! traits. TorchScript-backed implementations are compiled in with the
//! `with-tch` feature; without it every load reports [`ModelError::BackendDisabled`]
//! and the affected detectors stay unavailable.

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

pub mod detection;
pub mod labels;

#[cfg(feature = "with-tch")]
pub mod detector;
#[cfg(feature = "with-tch")]
pub mod segmentation;

pub use detection::{
    BoundingBox, DEFAULT_IOU_THRESHOLD, Detection, InferenceModel, SegmentationModel, TrackMask,
    suppress_overlaps,
};
pub use labels::ClassNames;

#[cfg(feature = "with-tch")]
pub use tch;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("inference backend not compiled in (enable the `with-tch` feature)")]
    BackendDisabled,
    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),
}

/// Where models are placed when loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    #[default]
    CudaIfAvailable,
}

#[cfg(feature = "with-tch")]
impl ComputeDevice {
    fn to_tch(self) -> tch::Device {
        match self {
            ComputeDevice::Cpu => tch::Device::Cpu,
            ComputeDevice::CudaIfAvailable => tch::Device::cuda_if_available(),
        }
    }
}

/// Load an object detection model with class names from its sidecar file.
#[cfg(feature = "with-tch")]
pub fn load_detector(
    model_path: &std::path::Path,
    input_size: (i64, i64),
    device: ComputeDevice,
) -> Result<Arc<dyn InferenceModel>, ModelError> {
    let names = ClassNames::for_model(model_path)?;
    let detector = detector::TorchDetector::new(model_path, device.to_tch(), input_size, names)?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
pub fn load_detector(
    _model_path: &std::path::Path,
    _input_size: (i64, i64),
    _device: ComputeDevice,
) -> Result<Arc<dyn InferenceModel>, ModelError> {
    Err(ModelError::BackendDisabled)
}

/// Load a track segmentation model.
#[cfg(feature = "with-tch")]
pub fn load_segmenter(
    model_path: &std::path::Path,
    input_size: (i64, i64),
    device: ComputeDevice,
) -> Result<Arc<dyn SegmentationModel>, ModelError> {
    let segmenter = segmentation::TorchSegmenter::new(model_path, device.to_tch(), input_size)?;
    Ok(Arc::new(segmenter))
}

#[cfg(not(feature = "with-tch"))]
pub fn load_segmenter(
    _model_path: &std::path::Path,
    _input_size: (i64, i64),
    _device: ComputeDevice,
) -> Result<Arc<dyn SegmentationModel>, ModelError> {
    Err(ModelError::BackendDisabled)
}

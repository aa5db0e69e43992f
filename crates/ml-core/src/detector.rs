use std::{convert::TryFrom, path::Path};

use anyhow::{anyhow, bail};
use image::{imageops::FilterType, RgbImage};
use tch::{self, Device, Kind, Tensor};

use crate::{
    BoundingBox, ClassNames, DEFAULT_IOU_THRESHOLD, Detection, InferenceModel, ModelError,
    suppress_overlaps,
};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed object detector.
///
/// The module is expected to return `[1, C, N]` predictions. Two row layouts
/// are understood: `x, y, w, h, score, class` and the anchor-free
/// `x, y, w, h, score_0 .. score_k` form where `C == 4 + names.len()`.
/// Overlapping same-label boxes are merged before results are returned.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    names: ClassNames,
}

impl TorchDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        names: ClassNames,
    ) -> Result<Self, ModelError> {
        let path = model_path.as_ref();
        let module =
            tch::CModule::load_on_device(path, device).map_err(|err| ModelError::Load {
                path: path.to_path_buf(),
                source: err.into(),
            })?;
        Ok(Self {
            module,
            device,
            input_size,
            names,
        })
    }

    /// Converts an RGB frame into a normalized `[1, 3, H, W]` tensor at the
    /// detector input size.
    pub fn rgb_to_tensor(&self, frame: &RgbImage) -> anyhow::Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        if in_w <= 0 || in_h <= 0 {
            bail!("detector input size must be positive, got {in_w}x{in_h}");
        }
        let resized;
        let pixels = if (frame.width() as i64, frame.height() as i64) != (in_w, in_h) {
            resized =
                image::imageops::resize(frame, in_w as u32, in_h as u32, FilterType::Triangle);
            resized.as_raw()
        } else {
            frame.as_raw()
        };

        let tensor = Tensor::from_slice(pixels.as_slice())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;

        Ok(tensor)
    }

    fn decode(
        &self,
        output: &Tensor,
        confidence_threshold: f32,
        frame_size: (u32, u32),
    ) -> anyhow::Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        let batch = shape[0];
        let channels = shape[1];
        if batch != 1 {
            bail!("detector expected batch=1 but received {batch}");
        }
        if channels < 5 {
            bail!("detector output requires at least 5 channels (x,y,w,h,conf), got {channels}");
        }
        let per_class_scores = !self.names.is_empty() && channels as usize == 4 + self.names.len();

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (frame_w, frame_h) = frame_size;
        let (in_w, in_h) = self.input_size;
        let scale_x = frame_w as f32 / in_w as f32;
        let scale_y = frame_h as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let (score, class_id) = if per_class_scores {
                row[4..]
                    .iter()
                    .enumerate()
                    .fold((f32::MIN, 0i64), |best, (idx, score)| {
                        if *score > best.0 {
                            (*score, idx as i64)
                        } else {
                            best
                        }
                    })
            } else {
                let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
                (row[4], class_id)
            };
            if score < confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center_size([row[0], row[1], row[2], row[3]], scale_x, scale_y)
                .clamp_to(frame_w, frame_h);
            detections.push(Detection::new(self.names.label(class_id), score, bbox));
        }

        Ok(suppress_overlaps(detections, DEFAULT_IOU_THRESHOLD, MAX_DETECTIONS))
    }
}

impl InferenceModel for TorchDetector {
    fn infer(
        &self,
        frame: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ModelError> {
        let input = self.rgb_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| anyhow!("detector forward pass failed: {err}"))?;
        Ok(self.decode(&output, confidence_threshold, frame.dimensions())?)
    }
}

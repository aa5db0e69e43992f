use std::{convert::TryFrom, path::Path};

use anyhow::{anyhow, bail};
use image::{imageops::FilterType, RgbImage};
use tch::{self, Device, Kind, Tensor};

use crate::{ModelError, SegmentationModel, TrackMask};

/// TorchScript segmentation model returning per-instance track masks.
///
/// Output must be `[N, h, w]` or `[1, N, h, w]` probabilities; instances are
/// merged with a per-pixel max before thresholding.
pub struct TorchSegmenter {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
}

impl TorchSegmenter {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self, ModelError> {
        let path = model_path.as_ref();
        ensure_positive(input_size).map_err(|err| ModelError::Load {
            path: path.to_path_buf(),
            source: err,
        })?;
        let module =
            tch::CModule::load_on_device(path, device).map_err(|err| ModelError::Load {
                path: path.to_path_buf(),
                source: err.into(),
            })?;
        Ok(Self {
            module,
            device,
            input_size,
        })
    }

    fn to_input(&self, frame: &RgbImage) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let resized = image::imageops::resize(frame, in_w as u32, in_h as u32, FilterType::Triangle);
        Tensor::from_slice(resized.as_raw().as_slice())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl SegmentationModel for TorchSegmenter {
    fn segment(&self, frame: &RgbImage) -> Result<Option<TrackMask>, ModelError> {
        let input = self.to_input(frame);
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| anyhow!("segmentation forward pass failed: {err}"))?;

        let masks = match output.size().len() {
            3 => output,
            4 => output.squeeze_dim(0),
            _ => return Err(anyhow!("unexpected mask output shape: {:?}", output.size()).into()),
        };
        let dims = masks.size();
        if dims[0] == 0 {
            return Ok(None);
        }
        let (mask_h, mask_w) = (dims[1], dims[2]);
        if mask_h <= 0 || mask_w <= 0 {
            return Err(anyhow!("mask output has empty spatial dims {dims:?}").into());
        }

        let merged = masks
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .amax(&[0i64][..], false)
            .contiguous()
            .view([-1]);
        let probs = Vec::<f32>::try_from(&merged).map_err(anyhow::Error::from)?;
        if probs.len() != (mask_w * mask_h) as usize {
            return Err(ModelError::Inference(anyhow!(
                "mask buffer has {} values, expected {}",
                probs.len(),
                mask_w * mask_h
            )));
        }

        let mask = TrackMask::from_probabilities(
            &probs,
            mask_w as u32,
            mask_h as u32,
            frame.width(),
            frame.height(),
        );
        if mask.is_empty() {
            Ok(None)
        } else {
            Ok(Some(mask))
        }
    }
}

fn ensure_positive(input_size: (i64, i64)) -> anyhow::Result<()> {
    if input_size.0 <= 0 || input_size.1 <= 0 {
        bail!("segmenter input size must be positive");
    }
    Ok(())
}

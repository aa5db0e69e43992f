//! Model-agnostic detection types shared by every inference backend.

use image::RgbImage;
use serde::Serialize;

use crate::ModelError;

/// Axis-aligned box in frame pixel coordinates. Always `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build a box from a centre/size tuple expressed in model input space,
    /// scaling it into frame space.
    pub fn from_center_size(xywh: [f32; 4], scale_x: f32, scale_y: f32) -> Self {
        let [cx, cy, w, h] = xywh;
        let left = (cx - w / 2.0) * scale_x;
        let top = (cy - h / 2.0) * scale_y;
        let right = (cx + w / 2.0) * scale_x;
        let bottom = (cy + h / 2.0) * scale_y;
        Self::new(
            left.round() as i32,
            top.round() as i32,
            right.round() as i32,
            bottom.round() as i32,
        )
    }

    /// Clamp the box so every corner lies inside a `width` x `height` frame.
    pub fn clamp_to(self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as i32;
        let max_y = height.saturating_sub(1) as i32;
        Self::new(
            self.x1.clamp(0, max_x),
            self.y1.clamp(0, max_y),
            self.x2.clamp(0, max_x),
            self.y2.clamp(0, max_y),
        )
    }

    /// Integer centre point, rounding towards the top-left.
    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) as f32 * (self.y2 - self.y1) as f32
    }

    /// Intersection over union. Zero when either box is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0) as f32;
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0) as f32;
        let intersection = w * h;
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Overlap above which two same-label boxes are treated as one object.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Class-wise non-maximum suppression. Keeps the most confident box of every
/// same-label cluster overlapping by more than `iou_threshold`, highest
/// confidence first, and returns at most `limit` detections.
pub fn suppress_overlaps(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    limit: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len().min(limit));
    for candidate in detections {
        if keep.len() >= limit {
            break;
        }
        let duplicate = keep.iter().any(|kept| {
            kept.label == candidate.label && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !duplicate {
            keep.push(candidate);
        }
    }
    keep
}

/// Single labelled detection returned by an [`InferenceModel`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    /// Case-insensitive label comparison.
    pub fn is(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

/// Binary per-pixel mask marking the railway track region of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl TrackMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; (width as usize) * (height as usize)],
        }
    }

    /// Threshold a probability map (`mask_w` x `mask_h`, row-major) at 0.5 and
    /// resize it to `width` x `height` with nearest-neighbour sampling.
    pub fn from_probabilities(
        probs: &[f32],
        mask_w: u32,
        mask_h: u32,
        width: u32,
        height: u32,
    ) -> Self {
        let mut mask = Self::empty(width, height);
        if mask_w == 0 || mask_h == 0 || probs.len() < (mask_w as usize) * (mask_h as usize) {
            return mask;
        }
        for y in 0..height {
            let src_y = ((y as u64 * mask_h as u64) / height.max(1) as u64) as usize;
            for x in 0..width {
                let src_x = ((x as u64 * mask_w as u64) / width.max(1) as u64) as usize;
                if probs[src_y * mask_w as usize + src_x] > 0.5 {
                    mask.set(x, y);
                }
            }
        }
        mask
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn set(&mut self, x: u32, y: u32) {
        if x < self.width && y < self.height {
            let idx = (y as usize) * (self.width as usize) + x as usize;
            self.bits[idx] = true;
        }
    }

    /// Whether the pixel is part of the track. Out-of-range coordinates are not.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return false;
        }
        self.bits[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|bit| *bit)
    }
}

/// Object detection capability: given a frame and a confidence threshold,
/// return the labelled boxes above that threshold.
pub trait InferenceModel: Send + Sync {
    fn infer(&self, frame: &RgbImage, confidence_threshold: f32)
        -> Result<Vec<Detection>, ModelError>;
}

/// Semantic segmentation capability producing the track mask for a frame.
/// `Ok(None)` means the model found no track at all.
pub trait SegmentationModel: Send + Sync {
    fn segment(&self, frame: &RgbImage) -> Result<Option<TrackMask>, ModelError>;
}

impl<T: InferenceModel + ?Sized> InferenceModel for std::sync::Arc<T> {
    fn infer(
        &self,
        frame: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ModelError> {
        (**self).infer(frame, confidence_threshold)
    }
}

impl<T: SegmentationModel + ?Sized> SegmentationModel for std::sync::Arc<T> {
    fn segment(&self, frame: &RgbImage) -> Result<Option<TrackMask>, ModelError> {
        (**self).segment(frame)
    }
}

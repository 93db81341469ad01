#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Tract-based backend running a YOLOv8-style ONNX detection model.
///
/// Frames are letterboxed onto a square model input; the output head
/// `[1, 4 + classes, anchors]` is decoded with per-anchor class argmax,
/// a confidence threshold, and class-aware IoU suppression. Class
/// indices are returned as-is, so an 80-class COCO model yields COCO
/// ids directly.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Override the default IoU suppression threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    /// Letterbox the frame onto the square model input and return the
    /// tensor plus the scale ratio needed to map boxes back.
    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<(Tensor, f32)> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }

        let frame = image::RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match dimensions"))?;

        let size = self.input_size;
        let ratio = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_w = ((width as f32 * ratio).round() as u32).max(1);
        let scaled_h = ((height as f32 * ratio).round() as u32).max(1);
        let resized = image::imageops::resize(
            &frame,
            scaled_w,
            scaled_h,
            image::imageops::FilterType::Triangle,
        );
        let mut canvas = image::RgbImage::from_pixel(size, size, image::Rgb([114, 114, 114]));
        image::imageops::replace(&mut canvas, &resized, 0, 0);

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );

        Ok((input.into_tensor(), ratio))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let (input, ratio) = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        decode_yolo_output(
            view,
            self.confidence_threshold,
            self.iou_threshold,
            ratio,
            width,
            height,
        )
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size as usize;
        let input =
            tract_ndarray::Array4::<f32>::zeros((1, 3, size, size)).into_tensor();
        self.model
            .run(tvec!(input.into()))
            .context("warm-up inference failed")?;
        Ok(())
    }
}

/// Candidate box in frame pixel coordinates, pre-suppression.
#[derive(Clone, Copy, Debug)]
struct BoxCandidate {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    score: f32,
    class_id: usize,
}

/// Decode a `[1, 4 + classes, anchors]` YOLO output head.
fn decode_yolo_output(
    output: tract_ndarray::ArrayViewD<'_, f32>,
    confidence_threshold: f32,
    iou_threshold: f32,
    ratio: f32,
    frame_width: u32,
    frame_height: u32,
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(anyhow!("unexpected detection output shape {:?}", shape));
    }
    let classes = shape[1] - 4;
    let anchors = shape[2];

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..classes {
            let score = output[[0, 4 + class, anchor]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score < confidence_threshold {
            continue;
        }

        let cx = output[[0, 0, anchor]];
        let cy = output[[0, 1, anchor]];
        let w = output[[0, 2, anchor]];
        let h = output[[0, 3, anchor]];

        // Undo the letterbox scale back into frame pixels.
        candidates.push(BoxCandidate {
            x: (cx - w / 2.0) / ratio,
            y: (cy - h / 2.0) / ratio,
            w: w / ratio,
            h: h / ratio,
            score: best_score,
            class_id: best_class,
        });
    }

    suppress_overlaps(&mut candidates, iou_threshold);

    let frame_w = frame_width as f32;
    let frame_h = frame_height as f32;
    Ok(candidates
        .into_iter()
        .map(|c| Detection {
            x: (c.x / frame_w).clamp(0.0, 1.0),
            y: (c.y / frame_h).clamp(0.0, 1.0),
            w: (c.w / frame_w).clamp(0.0, 1.0),
            h: (c.h / frame_h).clamp(0.0, 1.0),
            confidence: c.score,
            class_id: c.class_id as u32,
        })
        .collect())
}

/// Greedy class-aware non-maximum suppression.
fn suppress_overlaps(candidates: &mut Vec<BoxCandidate>, iou_threshold: f32) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<BoxCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates.iter() {
        let overlaps = keep
            .iter()
            .any(|kept| kept.class_id == candidate.class_id && iou(kept, candidate) > iou_threshold);
        if !overlaps {
            keep.push(*candidate);
        }
    }
    *candidates = keep;
}

fn iou(a: &BoxCandidate, b: &BoxCandidate) -> f32 {
    let left = a.x.max(b.x);
    let top = a.y.max(b.y);
    let right = (a.x + a.w).min(b.x + b.w);
    let bottom = (a.y + a.h).min(b.y + b.h);
    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = a.w * a.h + b.w * b.h - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_output(anchors: &[(f32, f32, f32, f32, &[f32])]) -> tract_ndarray::ArrayD<f32> {
        let classes = anchors[0].4.len();
        let mut output =
            tract_ndarray::ArrayD::<f32>::zeros(tract_ndarray::IxDyn(&[1, 4 + classes, anchors.len()]));
        for (i, (cx, cy, w, h, scores)) in anchors.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            for (class, score) in scores.iter().enumerate() {
                output[[0, 4 + class, i]] = *score;
            }
        }
        output
    }

    #[test]
    fn decode_thresholds_argmaxes_and_suppresses() {
        let output = synthetic_output(&[
            (100.0, 100.0, 50.0, 40.0, &[0.9, 0.1]),
            // Near-duplicate of the first box, lower score: suppressed.
            (102.0, 101.0, 50.0, 40.0, &[0.8, 0.1]),
            // Below the confidence threshold.
            (300.0, 300.0, 60.0, 60.0, &[0.1, 0.05]),
        ]);

        let detections =
            decode_yolo_output(output.view(), 0.25, 0.45, 1.0, 640, 640).expect("decode");

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert!((detections[0].x - (100.0 - 25.0) / 640.0).abs() < 1e-6);
        assert!((detections[0].w - 50.0 / 640.0).abs() < 1e-6);
    }

    #[test]
    fn decode_keeps_overlapping_boxes_of_different_classes() {
        let output = synthetic_output(&[
            (100.0, 100.0, 50.0, 40.0, &[0.9, 0.0]),
            (102.0, 101.0, 50.0, 40.0, &[0.0, 0.8]),
        ]);

        let detections =
            decode_yolo_output(output.view(), 0.25, 0.45, 1.0, 640, 640).expect("decode");
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn decode_rejects_unexpected_shapes() {
        let output = tract_ndarray::ArrayD::<f32>::zeros(tract_ndarray::IxDyn(&[1, 3]));
        assert!(decode_yolo_output(output.view(), 0.25, 0.45, 1.0, 640, 640).is_err());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoxCandidate {
            x: 0.0,
            y: 0.0,
            w: 10.0,
            h: 10.0,
            score: 1.0,
            class_id: 0,
        };
        let b = BoxCandidate {
            x: 100.0,
            y: 100.0,
            w: 10.0,
            h: 10.0,
            score: 1.0,
            class_id: 0,
        };
        assert_eq!(iou(&a, &b), 0.0);
    }
}

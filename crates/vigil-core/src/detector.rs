//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the det_10g SCRFD model: anchor-free detection over three feature-map
//! strides, with five-point landmarks per face and greedy NMS.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from ArcFace!) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0; // NOT 127.5 — SCRFD uses asymmetric normalization
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_NMS_IOU: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    BadFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    score_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, score_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs.iter().map(|i| (&i.name, &i.input_type)).collect::<Vec<_>>(),
            outputs = ?session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>(),
            score_threshold,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            score_threshold,
        })
    }

    /// Detect faces in an RGB8 frame.
    ///
    /// Returns boxes in original-frame coordinates, sorted by confidence
    /// descending, each with five landmarks.
    pub fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() < expected {
            return Err(DetectorError::BadFrame {
                expected,
                actual: rgb.len(),
            });
        }

        let (input, scale) = Self::preprocess(rgb, width, height);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // det_10g emits 9 tensors: [scores, boxes, landmarks] per stride,
        // grouped stride-major (scores x3, boxes x3, kps x3).
        if outputs.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 output tensors, got {}",
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();
        let score_threshold = self.score_threshold;
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
            let (_, boxes) = outputs[level + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;
            let (_, kps) = outputs[level + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;

            Self::decode_level(score_threshold, stride, scores, boxes, kps, scale, &mut candidates);
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let faces = nms(candidates, SCRFD_NMS_IOU);

        tracing::debug!(count = faces.len(), "faces detected");
        Ok(faces)
    }

    /// Decode one feature-map level into candidate boxes above the score
    /// threshold, mapping coordinates back into the original frame.
    fn decode_level(
        score_threshold: f32,
        stride: usize,
        scores: &[f32],
        boxes: &[f32],
        kps: &[f32],
        scale: f32,
        out: &mut Vec<BoundingBox>,
    ) {
        let cells = SCRFD_INPUT_SIZE / stride;
        let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;
        let n = scores.len().min(anchors);

        for i in 0..n {
            let score = scores[i];
            if score < score_threshold {
                continue;
            }
            if boxes.len() < (i + 1) * 4 || kps.len() < (i + 1) * 10 {
                break;
            }

            // Anchor center: two anchors share each grid cell.
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = ((cell % cells) * stride) as f32;
            let cy = ((cell / cells) * stride) as f32;

            // Box regression is distance-to-sides in stride units.
            let l = boxes[i * 4] * stride as f32;
            let t = boxes[i * 4 + 1] * stride as f32;
            let r = boxes[i * 4 + 2] * stride as f32;
            let b = boxes[i * 4 + 3] * stride as f32;

            let x1 = (cx - l) / scale;
            let y1 = (cy - t) / scale;
            let x2 = (cx + r) / scale;
            let y2 = (cy + b) / scale;

            let mut landmarks = [(0.0f32, 0.0f32); 5];
            for (p, lm) in landmarks.iter_mut().enumerate() {
                let lx = cx + kps[i * 10 + p * 2] * stride as f32;
                let ly = cy + kps[i * 10 + p * 2 + 1] * stride as f32;
                *lm = (lx / scale, ly / scale);
            }

            out.push(BoundingBox {
                x: x1,
                y: y1,
                width: (x2 - x1).max(0.0),
                height: (y2 - y1).max(0.0),
                confidence: score,
                landmarks: Some(landmarks),
            });
        }
    }

    /// Letterbox an RGB frame into a 640x640 NCHW tensor.
    ///
    /// Returns the tensor and the scale factor applied to the source frame
    /// (nearest-neighbour resample; the image is anchored top-left and the
    /// remainder is zero-padded).
    fn preprocess(rgb: &[u8], width: u32, height: u32) -> (Array4<f32>, f32) {
        let size = SCRFD_INPUT_SIZE;
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_w = ((width as f32 * scale) as usize).min(size);
        let scaled_h = ((height as f32 * scale) as usize).min(size);

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let w = width as usize;

        for y in 0..scaled_h {
            let sy = ((y as f32 / scale) as usize).min(height as usize - 1);
            for x in 0..scaled_w {
                let sx = ((x as f32 / scale) as usize).min(w - 1);
                let base = (sy * w + sx) * 3;
                for c in 0..3 {
                    let pixel = rgb.get(base + c).copied().unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, scale)
    }
}

/// Greedy non-maximum suppression over confidence-sorted boxes.
fn nms(sorted: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in sorted {
        if kept.iter().all(|k| iou(k, &candidate) < iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

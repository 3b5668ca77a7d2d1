//! ONNX-backed embedding provider: SCRFD detection + ArcFace embeddings.

use crate::detector::FaceDetector;
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::recognizer::FaceRecognizer;
use crate::types::DetectedFace;
use parking_lot::Mutex;

/// Production [`EmbeddingProvider`]: SCRFD for detection, landmark alignment,
/// ArcFace for embeddings.
///
/// Sessions are not `Sync`, so each model sits behind its own mutex; the two
/// stages of a single `detect` call hold at most one lock at a time, which
/// lets detection for the next frame start while the previous frame embeds.
pub struct OnnxProvider {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxProvider {
    /// Load both models, failing fast if either file is missing.
    pub fn load(
        scrfd_path: &str,
        arcface_path: &str,
        detection_threshold: f32,
    ) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(scrfd_path, detection_threshold)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() < expected {
            return Err(ProviderError::InvalidFrame(format!(
                "expected {expected} RGB bytes, got {}",
                rgb.len()
            )));
        }

        let boxes = self.detector.lock().detect(rgb, width, height)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        // Alignment and ArcFace run on the luma plane.
        let luma = rgb_to_luma(rgb, width, height);

        let mut faces = Vec::with_capacity(boxes.len());
        let mut recognizer = self.recognizer.lock();
        for bbox in boxes {
            let embedding = match recognizer.extract(&luma, width, height, &bbox) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(error = %err, "embedding extraction failed for face; skipping");
                    continue;
                }
            };
            faces.push(DetectedFace {
                quality: bbox.confidence,
                bbox,
                embedding,
            });
        }

        Ok(faces)
    }
}

/// ITU-R BT.601 luma conversion of an RGB8 buffer.
pub fn rgb_to_luma(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    let mut luma = Vec::with_capacity(pixels);
    for i in 0..pixels {
        let r = rgb[i * 3] as f32;
        let g = rgb[i * 3 + 1] as f32;
        let b = rgb[i * 3 + 2] as f32;
        luma.push((0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8);
    }
    luma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luma_gray_is_identity() {
        let rgb = vec![100u8; 4 * 4 * 3];
        let luma = rgb_to_luma(&rgb, 4, 4);
        assert_eq!(luma, vec![100u8; 16]);
    }

    #[test]
    fn test_luma_weights() {
        // Pure red pixel: 0.299 * 255 ≈ 76
        let rgb = vec![255u8, 0, 0];
        let luma = rgb_to_luma(&rgb, 1, 1);
        assert_eq!(luma, vec![76]);
    }
}

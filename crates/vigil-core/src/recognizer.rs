//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from aligned face crops using the
//! w600k_r50 ArcFace model. Camera frames reach this module as grayscale
//! luma planes; the aligned crop is replicated across the three input
//! channels before inference.

use crate::alignment;
use crate::types::{BoundingBox, Embedding, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks — detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs.iter().map(|i| (&i.name, &i.input_type)).collect::<Vec<_>>(),
            outputs = ?session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract a unit-norm embedding for a detected face in a grayscale frame.
    ///
    /// The face must carry landmarks (from the SCRFD detector); it is aligned
    /// to the canonical 112x112 position before embedding extraction.
    pub fn extract(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;

        let aligned = alignment::align_face(luma, width, height, landmarks);
        self.extract_aligned(&aligned)
    }

    /// Run inference over an already-aligned 112x112 grayscale crop.
    fn extract_aligned(&mut self, aligned: &[u8]) -> Result<Embedding, RecognizerError> {
        let input = Self::preprocess(aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        let mut embedding = Embedding::from_values(raw_data.to_vec());
        embedding.l2_normalize();
        embedding.model_version = Some(ARCFACE_MODEL_VERSION.to_string());
        Ok(embedding)
    }

    /// Preprocess a 112x112 grayscale aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0) as f32;

                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = vec![128u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = FaceRecognizer::preprocess(&aligned);
        let val = tensor[[0, 0, 0, 0]];
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let aligned = vec![100u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let tensor = FaceRecognizer::preprocess(&aligned);
        for y in 0..ARCFACE_INPUT_SIZE {
            for x in 0..ARCFACE_INPUT_SIZE {
                let r = tensor[[0, 0, y, x]];
                let g = tensor[[0, 1, y, x]];
                let b = tensor[[0, 2, y, x]];
                assert_eq!(r, g);
                assert_eq!(g, b);
            }
        }
    }

    #[test]
    fn test_preprocess_short_crop_zero_filled() {
        // Truncated crop: missing pixels read as 0 and normalize to -1.
        let aligned = vec![128u8; 10];
        let tensor = FaceRecognizer::preprocess(&aligned);
        let last = tensor[[0, 0, ARCFACE_INPUT_SIZE - 1, ARCFACE_INPUT_SIZE - 1]];
        assert!((last - (0.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
    }
}

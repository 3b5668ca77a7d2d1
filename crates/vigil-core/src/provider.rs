//! The embedding-provider seam.
//!
//! Everything downstream of detection (index, engine, enrollment) only sees
//! this trait, so the ONNX pipeline can be swapped for a fake in tests.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Detects faces in a frame and produces one unit-norm embedding per face.
///
/// Implementations are called from blocking contexts (inference is CPU-bound);
/// they must be shareable across camera workers.
pub trait EmbeddingProvider: Send + Sync {
    /// Detect all faces in an RGB8 frame (`width * height * 3` bytes).
    ///
    /// Returned faces carry their detection quality and an L2-normalized
    /// embedding. Order is unspecified.
    fn detect(&self, rgb: &[u8], width: u32, height: u32)
        -> Result<Vec<DetectedFace>, ProviderError>;
}

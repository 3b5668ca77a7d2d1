//! vigil-core — Face detection, recognition and similarity search.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime, plus a flat inner-product index mapping
//! embeddings to enrolled persons.

pub mod alignment;
pub mod detector;
pub mod engine;
pub mod index;
pub mod onnx;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use engine::RecognitionEngine;
pub use index::{FaceIndex, IndexError, SearchHit};
pub use onnx::OnnxProvider;
pub use provider::{EmbeddingProvider, ProviderError};
pub use types::{BoundingBox, DetectedFace, Embedding, Match, EMBEDDING_DIM};

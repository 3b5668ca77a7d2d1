use serde::{Deserialize, Serialize};

/// Embedding dimension produced by the ArcFace recognizer.
pub const EMBEDDING_DIM: usize = 512;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence for this box.
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box area in square pixels.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Wrap a raw vector without normalizing.
    pub fn from_values(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Normalize to unit length in place. A zero vector is left untouched.
    pub fn l2_normalize(&mut self) {
        let norm = self.norm();
        if norm > 0.0 && (norm - 1.0).abs() > 1e-6 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One face found in a frame: where it is, how good the detection is, and
/// its embedding. Produced by an [`EmbeddingProvider`](crate::EmbeddingProvider).
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// Detection quality score in [0, 1].
    pub quality: f32,
    pub embedding: Embedding,
}

/// A recognized person in a frame.
#[derive(Debug, Clone)]
pub struct Match {
    pub person_id: i64,
    /// Inner product against the best index slot; cosine similarity in [-1, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: None,
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut a = emb(vec![3.0, 4.0]);
        a.l2_normalize();
        assert!((a.norm() - 1.0).abs() < 1e-6);
        assert!((a.values[0] - 0.6).abs() < 1e-6);
        assert!((a.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_unchanged() {
        let mut a = emb(vec![0.0, 0.0, 0.0]);
        a.l2_normalize();
        assert_eq!(a.values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bbox_area() {
        let b = BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 80.0,
            height: 100.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert_eq!(b.area(), 8000.0);
    }
}

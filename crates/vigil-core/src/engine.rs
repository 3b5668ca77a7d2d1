//! Recognition engine: one frame in, zero or more person matches out.

use crate::index::FaceIndex;
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::Match;
use parking_lot::RwLock;
use std::sync::Arc;

/// Stateless recognition pipeline over a shared provider and index.
///
/// Safe to call concurrently from any number of camera workers; searches
/// take the index read lock only.
pub struct RecognitionEngine {
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<RwLock<FaceIndex>>,
    /// Faces below this detection quality are ignored.
    min_quality: f32,
    /// Faces with a smaller bbox area (px²) are ignored.
    min_face_area: f32,
    /// Similarity floor for a positive match.
    confidence_threshold: f32,
}

impl RecognitionEngine {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<RwLock<FaceIndex>>,
        min_quality: f32,
        min_face_area: f32,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            provider,
            index,
            min_quality,
            min_face_area,
            confidence_threshold,
        }
    }

    pub fn index(&self) -> &Arc<RwLock<FaceIndex>> {
        &self.index
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Recognize every enrolled person visible in an RGB8 frame.
    ///
    /// If the same person matches two faces in one frame (lookalikes in
    /// shot), only the higher-scoring face is kept.
    pub fn recognize(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Match>, ProviderError> {
        let faces = self.provider.detect(rgb, width, height)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<Match> = Vec::new();
        {
            let index = self.index.read();
            for face in &faces {
                if face.quality < self.min_quality {
                    continue;
                }
                if face.bbox.area() < self.min_face_area {
                    continue;
                }

                let hits = match index.search(&face.embedding, 1, self.confidence_threshold) {
                    Ok(hits) => hits,
                    Err(err) => {
                        tracing::warn!(error = %err, "index search failed for face; skipping");
                        continue;
                    }
                };
                let Some(hit) = hits.first() else {
                    continue;
                };

                if let Some(existing) = matches.iter_mut().find(|m| m.person_id == hit.person_id) {
                    tracing::warn!(
                        person_id = hit.person_id,
                        kept = existing.confidence.max(hit.score),
                        dropped = existing.confidence.min(hit.score),
                        "same person matched two faces in one frame"
                    );
                    if hit.score > existing.confidence {
                        existing.confidence = hit.score;
                        existing.bbox = face.bbox.clone();
                    }
                } else {
                    matches.push(Match {
                        person_id: hit.person_id,
                        confidence: hit.score,
                        bbox: face.bbox.clone(),
                    });
                }
            }
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DetectedFace, Embedding};

    /// Provider that returns a canned list of faces.
    struct FakeProvider {
        faces: Vec<DetectedFace>,
    }

    impl EmbeddingProvider for FakeProvider {
        fn detect(
            &self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(self.faces.clone())
        }
    }

    fn bbox(size: f32, quality: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: size,
            height: size,
            confidence: quality,
            landmarks: None,
        }
    }

    fn face(values: Vec<f32>, size: f32, quality: f32) -> DetectedFace {
        DetectedFace {
            bbox: bbox(size, quality),
            quality,
            embedding: Embedding::from_values(values),
        }
    }

    fn engine_with(faces: Vec<DetectedFace>, index: FaceIndex) -> RecognitionEngine {
        RecognitionEngine::new(
            Arc::new(FakeProvider { faces }),
            Arc::new(RwLock::new(index)),
            0.5,
            100.0,
            0.6,
        )
    }

    #[test]
    fn test_recognizes_enrolled_person() {
        let mut index = FaceIndex::new(2);
        index.add(5, &Embedding::from_values(vec![1.0, 0.0])).unwrap();

        let engine = engine_with(vec![face(vec![1.0, 0.0], 100.0, 0.9)], index);
        let matches = engine.recognize(&[], 640, 480).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].person_id, 5);
        assert!(matches[0].confidence >= 0.99);
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let mut index = FaceIndex::new(2);
        index.add(5, &Embedding::from_values(vec![1.0, 0.0])).unwrap();

        // Orthogonal embedding: similarity 0 < 0.6 threshold.
        let engine = engine_with(vec![face(vec![0.0, 1.0], 100.0, 0.9)], index);
        assert!(engine.recognize(&[], 640, 480).unwrap().is_empty());
    }

    #[test]
    fn test_low_quality_face_skipped() {
        let mut index = FaceIndex::new(2);
        index.add(5, &Embedding::from_values(vec![1.0, 0.0])).unwrap();

        let engine = engine_with(vec![face(vec![1.0, 0.0], 100.0, 0.3)], index);
        assert!(engine.recognize(&[], 640, 480).unwrap().is_empty());
    }

    #[test]
    fn test_small_face_skipped() {
        let mut index = FaceIndex::new(2);
        index.add(5, &Embedding::from_values(vec![1.0, 0.0])).unwrap();

        // 5x5 px face: area 25 < 100 floor.
        let engine = engine_with(vec![face(vec![1.0, 0.0], 5.0, 0.9)], index);
        assert!(engine.recognize(&[], 640, 480).unwrap().is_empty());
    }

    #[test]
    fn test_lookalike_collision_keeps_best() {
        let mut index = FaceIndex::new(2);
        index.add(5, &Embedding::from_values(vec![1.0, 0.0])).unwrap();

        let engine = engine_with(
            vec![
                face(vec![0.9, 0.1], 100.0, 0.9),
                face(vec![1.0, 0.0], 120.0, 0.9),
            ],
            index,
        );
        let matches = engine.recognize(&[], 640, 480).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].person_id, 5);
        // The exact-match face (width 120) must win.
        assert_eq!(matches[0].bbox.width, 120.0);
    }

    #[test]
    fn test_multiple_persons_in_frame() {
        let mut index = FaceIndex::new(2);
        index.add(1, &Embedding::from_values(vec![1.0, 0.0])).unwrap();
        index.add(2, &Embedding::from_values(vec![0.0, 1.0])).unwrap();

        let engine = engine_with(
            vec![
                face(vec![1.0, 0.0], 100.0, 0.9),
                face(vec![0.0, 1.0], 100.0, 0.9),
            ],
            index,
        );
        let mut ids: Vec<i64> = engine
            .recognize(&[], 640, 480)
            .unwrap()
            .iter()
            .map(|m| m.person_id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}

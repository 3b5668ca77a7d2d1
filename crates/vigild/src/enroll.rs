//! Enrollment coordinator.
//!
//! Turns raw reference images into store rows plus index slots, keeping the
//! two in lockstep: a row only survives if its slot was added, and a slot is
//! only added for a row that exists. Per-person enrollment is serialized;
//! different persons enroll concurrently.

use crate::config::Config;
use crate::store::{encode_embedding, Store, StoreError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::timeout;
use vigil_core::{EmbeddingProvider, FaceIndex, IndexError};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("student not found")]
    PersonNotFound,
    #[error("too many images: {count} exceeds cap of {max}")]
    TooManyImages { count: usize, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-reason skip counters reported back to the caller.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct SkipCounts {
    pub decode: usize,
    pub no_face: usize,
    pub multi_face: usize,
    pub low_quality: usize,
    pub timeout: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EnrollSummary {
    pub successful: usize,
    pub skipped: SkipCounts,
    pub reference_ids: Vec<i64>,
}

enum ImageOutcome {
    Embedded {
        embedding: vigil_core::Embedding,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy)]
enum SkipReason {
    Decode,
    NoFace,
    MultiFace,
    LowQuality,
    Timeout,
}

pub struct EnrollmentCoordinator {
    store: Store,
    index: Arc<parking_lot::RwLock<FaceIndex>>,
    provider: Arc<dyn EmbeddingProvider>,
    images_dir: PathBuf,
    index_vectors_path: PathBuf,
    index_slots_path: PathBuf,
    min_quality: f32,
    min_face_area: f32,
    image_timeout: std::time::Duration,
    max_images: usize,
    /// One lock per person currently enrolling.
    in_flight: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnrollmentCoordinator {
    pub fn new(
        store: Store,
        index: Arc<parking_lot::RwLock<FaceIndex>>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            index,
            provider,
            images_dir: config.images_dir(),
            index_vectors_path: config.index_vectors_path(),
            index_slots_path: config.index_slots_path(),
            min_quality: config.enroll_min_quality,
            min_face_area: config.min_face_area,
            image_timeout: config.image_timeout,
            max_images: config.max_images_per_person,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn person_lock(&self, person_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(person_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Enroll a batch of reference images for an existing person.
    pub async fn enroll(
        &self,
        person_id: i64,
        images: Vec<Bytes>,
    ) -> Result<EnrollSummary, EnrollError> {
        if images.len() > self.max_images {
            return Err(EnrollError::TooManyImages {
                count: images.len(),
                max: self.max_images,
            });
        }
        let student = self
            .store
            .student_by_id(person_id)
            .await?
            .ok_or(EnrollError::PersonNotFound)?;

        let lock = self.person_lock(person_id);
        let _guard = lock.lock().await;

        let mut summary = EnrollSummary::default();
        for (i, image) in images.into_iter().enumerate() {
            match self.process_image(image.clone()).await {
                ImageOutcome::Skipped(reason) => {
                    tracing::info!(person_id, image = i, ?reason, "enrollment image skipped");
                    match reason {
                        SkipReason::Decode => summary.skipped.decode += 1,
                        SkipReason::NoFace => summary.skipped.no_face += 1,
                        SkipReason::MultiFace => summary.skipped.multi_face += 1,
                        SkipReason::LowQuality => summary.skipped.low_quality += 1,
                        SkipReason::Timeout => summary.skipped.timeout += 1,
                    }
                }
                ImageOutcome::Embedded { embedding } => {
                    let reference_id = self
                        .commit_reference(&student.student_no, person_id, i, &image, &embedding)
                        .await?;
                    summary.successful += 1;
                    summary.reference_ids.push(reference_id);
                }
            }
        }

        if summary.successful > 0 {
            self.persist_index();
        }

        tracing::info!(
            person_id,
            successful = summary.successful,
            "enrollment finished"
        );
        Ok(summary)
    }

    /// Decode + detect one image off the async runtime, bounded in time.
    async fn process_image(&self, image: Bytes) -> ImageOutcome {
        let provider = self.provider.clone();
        let min_quality = self.min_quality;
        let min_face_area = self.min_face_area;

        let work = tokio::task::spawn_blocking(move || {
            let decoded = match image::load_from_memory(&image) {
                Ok(img) => img.to_rgb8(),
                Err(_) => return ImageOutcome::Skipped(SkipReason::Decode),
            };
            let (width, height) = (decoded.width(), decoded.height());

            let faces = match provider.detect(decoded.as_raw(), width, height) {
                Ok(faces) => faces,
                Err(err) => {
                    tracing::warn!(error = %err, "detection failed during enrollment");
                    return ImageOutcome::Skipped(SkipReason::NoFace);
                }
            };
            match faces.len() {
                0 => return ImageOutcome::Skipped(SkipReason::NoFace),
                1 => {}
                _ => return ImageOutcome::Skipped(SkipReason::MultiFace),
            }
            let face = &faces[0];
            if face.quality < min_quality || face.bbox.area() < min_face_area {
                return ImageOutcome::Skipped(SkipReason::LowQuality);
            }
            ImageOutcome::Embedded {
                embedding: face.embedding.clone(),
            }
        });

        match timeout(self.image_timeout, work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "enrollment image task failed");
                ImageOutcome::Skipped(SkipReason::Decode)
            }
            Err(_) => ImageOutcome::Skipped(SkipReason::Timeout),
        }
    }

    /// Write the image file, insert the DB row and add the index slot as one
    /// logical unit: whichever half fails, the other is undone.
    async fn commit_reference(
        &self,
        student_no: &str,
        person_id: i64,
        ordinal: usize,
        image: &Bytes,
        embedding: &vigil_core::Embedding,
    ) -> Result<i64, EnrollError> {
        let dir = self.images_dir.join(student_no);
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{student_no}_{stamp}_{ordinal}.jpg"));
        tokio::fs::write(&path, image).await?;

        let reference_id = self
            .store
            .insert_reference_image(
                person_id,
                path.to_string_lossy().into_owned(),
                encode_embedding(&embedding.values),
            )
            .await?;

        if let Err(index_err) = self.index.write().add(person_id, embedding) {
            // Undo the row so store and index stay consistent.
            if let Err(db_err) = self.store.delete_reference_image(reference_id).await {
                tracing::error!(
                    reference_id,
                    error = %db_err,
                    "rollback of reference row failed after index error"
                );
            }
            let _ = tokio::fs::remove_file(&path).await;
            return Err(index_err.into());
        }

        Ok(reference_id)
    }

    /// Delete a person and every trace of them: reference rows and
    /// attendance cascade in the store, index slots are removed here.
    ///
    /// Returns `(person_id, removed_slots)` if the person existed. The
    /// caller clears presence entries.
    pub async fn delete_person(&self, student_no: &str) -> Result<Option<(i64, usize)>, EnrollError> {
        let Some(person_id) = self.store.delete_student_by_no(student_no.to_string()).await? else {
            return Ok(None);
        };

        let removed = self.index.write().remove_by_person(person_id);
        if removed > 0 {
            self.persist_index();
        }
        tracing::info!(student_no, person_id, removed, "person deleted");
        Ok(Some((person_id, removed)))
    }

    /// Snapshot the index artifacts. Failure leaves the in-memory index
    /// authoritative and is retried on the next structural change.
    fn persist_index(&self) {
        let index = self.index.read();
        if let Err(err) = index.persist(&self.index_vectors_path, &self.index_slots_path) {
            tracing::error!(error = %err, "index persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::NewStudent;
    use parking_lot::RwLock;
    use std::collections::VecDeque;
    use vigil_core::{BoundingBox, DetectedFace, Embedding, ProviderError, EMBEDDING_DIM};

    /// Provider fed with a script of per-call responses.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Vec<DetectedFace>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Vec<DetectedFace>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl EmbeddingProvider for ScriptedProvider {
        fn detect(
            &self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(self.script.lock().pop_front().unwrap_or_default())
        }
    }

    fn face(axis: usize, quality: f32, size: f32) -> DetectedFace {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[axis] = 1.0;
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: size,
                height: size,
                confidence: quality,
                landmarks: None,
            },
            quality,
            embedding: Embedding::from_values(values),
        }
    }

    fn jpeg_bytes() -> Bytes {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([90, 90, 90]));
        let mut buf = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90)
            .encode(img.as_raw(), 8, 8, image::ColorType::Rgb8)
            .unwrap();
        Bytes::from(buf)
    }

    struct Fixture {
        coordinator: EnrollmentCoordinator,
        store: Store,
        index: Arc<RwLock<FaceIndex>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(script: Vec<Vec<DetectedFace>>) -> Fixture {
        let (store, dir) = temp_store();
        let mut config = Config::from_env();
        config.data_dir = dir.path().to_path_buf();

        let index = Arc::new(RwLock::new(FaceIndex::new(EMBEDDING_DIM)));
        let coordinator = EnrollmentCoordinator::new(
            store.clone(),
            index.clone(),
            ScriptedProvider::new(script),
            &config,
        );
        Fixture {
            coordinator,
            store,
            index,
            _dir: dir,
        }
    }

    async fn student(store: &Store, no: &str) -> i64 {
        store
            .create_student(NewStudent {
                student_no: no.into(),
                first_name: "A".into(),
                last_name: "B".into(),
                group_name: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_enroll_happy_path() {
        let fx = fixture(vec![
            vec![face(0, 0.9, 120.0)],
            vec![face(1, 0.9, 120.0)],
        ]);
        let id = student(&fx.store, "2024001").await;

        let summary = fx
            .coordinator
            .enroll(id, vec![jpeg_bytes(), jpeg_bytes()])
            .await
            .unwrap();

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.skipped, SkipCounts::default());
        assert_eq!(summary.reference_ids.len(), 2);

        // Store rows and index slots agree.
        assert_eq!(fx.store.count_reference_images(id).await.unwrap(), 2);
        assert_eq!(fx.index.read().slots_for_person(id), 2);
    }

    #[tokio::test]
    async fn test_enroll_skips_undecodable_image() {
        let fx = fixture(vec![vec![face(0, 0.9, 120.0)]]);
        let id = student(&fx.store, "2024001").await;

        let summary = fx
            .coordinator
            .enroll(id, vec![Bytes::from_static(b"not an image"), jpeg_bytes()])
            .await
            .unwrap();

        assert_eq!(summary.successful, 1);
        assert_eq!(summary.skipped.decode, 1);
    }

    #[tokio::test]
    async fn test_enroll_skips_zero_and_multi_face() {
        let fx = fixture(vec![
            vec![],                                     // no face
            vec![face(0, 0.9, 120.0), face(1, 0.9, 120.0)], // two faces
            vec![face(2, 0.9, 120.0)],
        ]);
        let id = student(&fx.store, "2024001").await;

        let summary = fx
            .coordinator
            .enroll(id, vec![jpeg_bytes(), jpeg_bytes(), jpeg_bytes()])
            .await
            .unwrap();

        assert_eq!(summary.successful, 1);
        assert_eq!(summary.skipped.no_face, 1);
        assert_eq!(summary.skipped.multi_face, 1);
    }

    #[tokio::test]
    async fn test_enroll_skips_low_quality_and_small_faces() {
        let fx = fixture(vec![
            vec![face(0, 0.2, 120.0)], // low quality
            vec![face(1, 0.9, 10.0)],  // 100 px² < 3600 floor
        ]);
        let id = student(&fx.store, "2024001").await;

        let summary = fx
            .coordinator
            .enroll(id, vec![jpeg_bytes(), jpeg_bytes()])
            .await
            .unwrap();

        assert_eq!(summary.successful, 0);
        assert_eq!(summary.skipped.low_quality, 2);
        assert_eq!(fx.index.read().size(), 0);
    }

    #[tokio::test]
    async fn test_enroll_unknown_person_fails() {
        let fx = fixture(vec![]);
        let err = fx.coordinator.enroll(999, vec![jpeg_bytes()]).await.unwrap_err();
        assert!(matches!(err, EnrollError::PersonNotFound));
    }

    #[tokio::test]
    async fn test_enroll_rejects_oversized_batch() {
        let fx = fixture(vec![]);
        let id = student(&fx.store, "2024001").await;
        let images = vec![jpeg_bytes(); 11]; // cap is 10
        let err = fx.coordinator.enroll(id, images).await.unwrap_err();
        assert!(matches!(err, EnrollError::TooManyImages { count: 11, max: 10 }));
    }

    #[tokio::test]
    async fn test_index_rollback_when_dimension_mismatch() {
        // Provider hands back a 3-dim embedding; the 512-dim index rejects it
        // and the just-inserted row must be rolled back.
        let bad = DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 120.0,
                height: 120.0,
                confidence: 0.9,
                landmarks: None,
            },
            quality: 0.9,
            embedding: Embedding::from_values(vec![1.0, 0.0, 0.0]),
        };
        let fx = fixture(vec![vec![bad]]);
        let id = student(&fx.store, "2024001").await;

        let err = fx.coordinator.enroll(id, vec![jpeg_bytes()]).await.unwrap_err();
        assert!(matches!(err, EnrollError::Index(IndexError::InvalidDimension { .. })));
        assert_eq!(fx.store.count_reference_images(id).await.unwrap(), 0);
        assert_eq!(fx.index.read().size(), 0);
    }

    #[tokio::test]
    async fn test_delete_person_clears_rows_and_slots() {
        let fx = fixture(vec![
            vec![face(0, 0.9, 120.0)],
            vec![face(1, 0.9, 120.0)],
        ]);
        let id = student(&fx.store, "2024001").await;
        fx.coordinator
            .enroll(id, vec![jpeg_bytes(), jpeg_bytes()])
            .await
            .unwrap();
        assert_eq!(fx.index.read().size(), 2);

        let (deleted_id, removed) = fx
            .coordinator
            .delete_person("2024001")
            .await
            .unwrap()
            .expect("person existed");
        assert_eq!(deleted_id, id);
        assert_eq!(removed, 2);
        assert_eq!(fx.index.read().size(), 0);
        assert!(fx.store.student_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_person_is_none() {
        let fx = fixture(vec![]);
        assert!(fx.coordinator.delete_person("nope").await.unwrap().is_none());
    }
}

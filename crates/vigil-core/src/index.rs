//! In-memory similarity index over face embeddings.
//!
//! A flat inner-product index: all vectors live in one dense `Vec<f32>` and a
//! search is a full scan. At the design ceiling (10^5 vectors of dimension
//! 512) a scan is tens of millions of multiply-adds, well under 10 ms, so no
//! approximate structure is needed and tie-breaking stays deterministic.
//!
//! Vectors are L2-normalized at insertion, so the inner product equals cosine
//! similarity. Each vector occupies a slot; slot ids grow monotonically and
//! are never reused, even after the owning person is removed.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// Magic prefix of the vector store file.
const VECTOR_FILE_MAGIC: [u8; 4] = *b"VGIX";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One search hit: a person and the best similarity across their slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub person_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Slot {
    slot_id: u64,
    person_id: i64,
}

/// On-disk shape of the slot map file.
#[derive(Serialize, Deserialize)]
struct SlotMapFile {
    dimension: usize,
    next_slot_id: u64,
    slots: Vec<Slot>,
}

/// Flat inner-product similarity index.
pub struct FaceIndex {
    dimension: usize,
    /// Dense vector store; `slots.len() * dimension` floats.
    vectors: Vec<f32>,
    slots: Vec<Slot>,
    next_slot_id: u64,
}

impl FaceIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            slots: Vec::new(),
            next_slot_id: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of live slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of distinct persons with at least one slot.
    pub fn person_count(&self) -> usize {
        let mut ids: Vec<i64> = self.slots.iter().map(|s| s.person_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Number of slots owned by one person.
    pub fn slots_for_person(&self, person_id: i64) -> usize {
        self.slots.iter().filter(|s| s.person_id == person_id).count()
    }

    /// Add an embedding for a person, returning the new slot id.
    ///
    /// The vector is L2-normalized on the way in (a no-op within 1e-6 if it
    /// already is unit-norm).
    pub fn add(&mut self, person_id: i64, embedding: &Embedding) -> Result<u64, IndexError> {
        if embedding.values.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: embedding.values.len(),
            });
        }

        let mut normalized = embedding.clone();
        normalized.l2_normalize();

        let slot_id = self.next_slot_id;
        self.next_slot_id += 1;
        self.vectors.extend_from_slice(&normalized.values);
        self.slots.push(Slot { slot_id, person_id });

        tracing::debug!(person_id, slot_id, total = self.slots.len(), "index: slot added");
        Ok(slot_id)
    }

    /// Remove every slot owned by a person, compacting the vector store.
    ///
    /// Returns the number of slots removed. Slot ids of survivors are kept;
    /// freed ids are never handed out again.
    pub fn remove_by_person(&mut self, person_id: i64) -> usize {
        let before = self.slots.len();
        let dim = self.dimension;

        let mut write = 0usize;
        for read in 0..self.slots.len() {
            if self.slots[read].person_id == person_id {
                continue;
            }
            if write != read {
                self.slots[write] = self.slots[read];
                let (dst, src) = (write * dim, read * dim);
                self.vectors.copy_within(src..src + dim, dst);
            }
            write += 1;
        }
        self.slots.truncate(write);
        self.vectors.truncate(write * dim);

        let removed = before - write;
        if removed > 0 {
            tracing::info!(person_id, removed, remaining = write, "index: person removed");
        }
        removed
    }

    /// Search for the `k` most similar persons with `score >= min_score`.
    ///
    /// The query is normalized first. Results are sorted by score descending;
    /// ties break toward the smaller person id, then the smaller slot id.
    /// Each person appears at most once (their best-scoring slot).
    pub fn search(
        &self,
        query: &Embedding,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if query.values.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.values.len(),
            });
        }
        if k == 0 || self.slots.is_empty() {
            return Ok(Vec::new());
        }

        let mut q = query.clone();
        q.l2_normalize();

        // (score, person_id, slot_id) for every slot above the floor.
        let mut scored: Vec<(f32, i64, u64)> = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let offset = i * self.dimension;
            let row = &self.vectors[offset..offset + self.dimension];
            let score: f32 = row.iter().zip(q.values.iter()).map(|(a, b)| a * b).sum();
            if score >= min_score {
                scored.push((score, slot.person_id, slot.slot_id));
            }
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        // Best slot per person only.
        let mut hits: Vec<SearchHit> = Vec::new();
        for (score, person_id, _) in scored {
            if hits.iter().any(|h| h.person_id == person_id) {
                continue;
            }
            hits.push(SearchHit { person_id, score });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    /// Snapshot the index to its two on-disk artifacts.
    ///
    /// Both files are written to a temp path in the same directory and
    /// renamed into place, so readers never observe a torn write.
    pub fn persist(&self, vectors_path: &Path, slots_path: &Path) -> Result<(), IndexError> {
        if let Some(dir) = vectors_path.parent() {
            fs::create_dir_all(dir)?;
        }

        // Vector store: magic, dimension, count, then raw little-endian f32s.
        let mut buf = Vec::with_capacity(12 + self.vectors.len() * 4);
        buf.extend_from_slice(&VECTOR_FILE_MAGIC);
        buf.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        buf.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        for v in &self.vectors {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        write_atomic(vectors_path, &buf)?;

        let map = SlotMapFile {
            dimension: self.dimension,
            next_slot_id: self.next_slot_id,
            slots: self.slots.clone(),
        };
        let json = serde_json::to_vec(&map)
            .map_err(|e| IndexError::CorruptIndex(format!("slot map encode: {e}")))?;
        write_atomic(slots_path, &json)?;

        tracing::info!(
            vectors = %vectors_path.display(),
            slots = %slots_path.display(),
            count = self.slots.len(),
            "index persisted"
        );
        Ok(())
    }

    /// Load an index from its two artifacts.
    ///
    /// Missing files yield an empty index (first start). Any disagreement
    /// between the artifacts, or a dimension mismatch, is `CorruptIndex` and
    /// leaves the returned state empty for the caller to decide on.
    pub fn load(
        dimension: usize,
        vectors_path: &Path,
        slots_path: &Path,
    ) -> Result<Self, IndexError> {
        if !vectors_path.exists() && !slots_path.exists() {
            return Ok(Self::new(dimension));
        }
        if vectors_path.exists() != slots_path.exists() {
            return Err(IndexError::CorruptIndex(
                "one index artifact is missing".to_string(),
            ));
        }

        let mut raw = Vec::new();
        fs::File::open(vectors_path)?.read_to_end(&mut raw)?;
        if raw.len() < 12 || raw[..4] != VECTOR_FILE_MAGIC {
            return Err(IndexError::CorruptIndex("bad vector store header".to_string()));
        }
        let file_dim = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let count = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
        if file_dim != dimension {
            return Err(IndexError::CorruptIndex(format!(
                "vector store dimension {file_dim} != configured {dimension}"
            )));
        }
        let expected_len = 12 + count * dimension * 4;
        if raw.len() != expected_len {
            return Err(IndexError::CorruptIndex(format!(
                "vector store length {} != expected {expected_len}",
                raw.len()
            )));
        }

        let mut vectors = Vec::with_capacity(count * dimension);
        for chunk in raw[12..].chunks_exact(4) {
            vectors.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        let map_raw = fs::read(slots_path)?;
        let map: SlotMapFile = serde_json::from_slice(&map_raw)
            .map_err(|e| IndexError::CorruptIndex(format!("slot map decode: {e}")))?;
        if map.dimension != dimension {
            return Err(IndexError::CorruptIndex(format!(
                "slot map dimension {} != configured {dimension}",
                map.dimension
            )));
        }
        if map.slots.len() != count {
            return Err(IndexError::CorruptIndex(format!(
                "slot map has {} entries, vector store has {count}",
                map.slots.len()
            )));
        }
        if map.slots.iter().any(|s| s.slot_id >= map.next_slot_id) {
            return Err(IndexError::CorruptIndex(
                "slot id beyond allocation watermark".to_string(),
            ));
        }

        tracing::info!(count, dimension, "index loaded");
        Ok(Self {
            dimension,
            vectors,
            slots: map.slots,
            next_slot_id: map.next_slot_id,
        })
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), IndexError> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

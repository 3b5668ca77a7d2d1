//! Frame type shared between frame sources and camera workers.

use bytes::Bytes;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// One captured camera frame, kept in its wire encoding.
///
/// Frames travel through the pipeline as JPEG bytes so the streaming path
/// never pays for a decode; recognition decodes on demand.
#[derive(Clone)]
pub struct Frame {
    /// JPEG-encoded image bytes.
    pub jpeg: Bytes,
    pub captured_at: Instant,
    /// Per-source monotonic frame counter.
    pub sequence: u64,
}

impl Frame {
    pub fn new(jpeg: Bytes, sequence: u64) -> Self {
        Self {
            jpeg,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Decode to a raw RGB8 buffer, returning `(pixels, width, height)`.
    pub fn decode_rgb(&self) -> Result<(Vec<u8>, u32, u32), FrameError> {
        let img = image::load_from_memory(&self.jpeg)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        let rgb = img.to_rgb8();
        let (width, height) = (rgb.width(), rgb.height());
        Ok((rgb.into_raw(), width, height))
    }
}

//! The frame-source seam.
//!
//! Camera workers consume frames through these traits only; the ffmpeg
//! implementation and test fakes plug in behind them.

use crate::frame::Frame;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream disconnected")]
    Disconnected,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A live, connected camera stream.
///
/// `next_frame` always yields the newest frame the source has; frames that
/// arrived while the caller was busy are silently discarded (freshness over
/// completeness). Dropping the source releases the underlying stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, StreamError>;
}

/// Opens frame sources from a camera's stream address.
#[async_trait]
pub trait FrameConnector: Send + Sync {
    /// Connect and wait for the first decodable frame.
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError>;
}

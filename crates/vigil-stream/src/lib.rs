//! vigil-stream — Frame acquisition for camera workers.
//!
//! Abstracts the RTSP grabber behind [`FrameConnector`]/[`FrameSource`] and
//! ships an ffmpeg-subprocess implementation that re-encodes any input the
//! tool can open into an MJPEG frame stream.

pub mod ffmpeg;
pub mod frame;
pub mod source;

pub use ffmpeg::FfmpegConnector;
pub use frame::{Frame, FrameError};
pub use source::{FrameConnector, FrameSource, StreamError};

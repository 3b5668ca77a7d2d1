//! ffmpeg-subprocess frame source.
//!
//! Spawns `ffmpeg` reading the camera's RTSP (or file/HTTP) address and
//! re-emitting it as an MJPEG stream on stdout. A reader task splits the
//! byte stream into JPEG frames and keeps only the newest one in a watch
//! channel, so a slow consumer naturally skips the backlog.

use crate::frame::Frame;
use crate::source::{FrameConnector, FrameSource, StreamError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
/// Hard cap on one encoded frame; anything larger means we lost sync.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Connector that shells out to ffmpeg for RTSP demux/decode.
pub struct FfmpegConnector {
    binary: String,
    jpeg_quality: u8,
}

impl FfmpegConnector {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            jpeg_quality: 5,
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            jpeg_quality: 5,
        }
    }
}

impl Default for FfmpegConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameConnector for FfmpegConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        let mut cmd = Command::new(&self.binary);
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            // TCP transport is far more reliable than UDP through NAT.
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-i", url])
            .args(["-f", "image2pipe", "-vcodec", "mjpeg"])
            .args(["-q:v", &self.jpeg_quality.to_string()])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StreamError::Connect(format!("spawn {}: {e}", self.binary)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Connect("ffmpeg stdout unavailable".to_string()))?;

        let (tx, mut rx) = watch::channel::<Option<Frame>>(None);
        tokio::spawn(read_mjpeg_stream(stdout, tx));

        // The connect phase completes on the first decodable frame; the
        // caller bounds this whole call with its connect timeout.
        loop {
            rx.changed()
                .await
                .map_err(|_| StreamError::Connect("stream ended before first frame".to_string()))?;
            if rx.borrow().is_some() {
                break;
            }
        }

        tracing::info!(url, "frame source connected");
        Ok(Box::new(FfmpegSource {
            _child: child,
            rx,
        }))
    }
}

struct FfmpegSource {
    /// Held for kill_on_drop; the reader task owns stdout.
    _child: Child,
    rx: watch::Receiver<Option<Frame>>,
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn next_frame(&mut self) -> Result<Frame, StreamError> {
        self.rx
            .changed()
            .await
            .map_err(|_| StreamError::Disconnected)?;
        let frame = self.rx.borrow_and_update().clone();
        frame.ok_or(StreamError::Disconnected)
    }
}

/// Read the MJPEG byte stream, publishing each complete JPEG as a frame.
async fn read_mjpeg_stream(
    mut stdout: tokio::process::ChildStdout,
    tx: watch::Sender<Option<Frame>>,
) {
    let mut buf = BytesMut::with_capacity(256 * 1024);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut sequence = 0u64;

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }

        while let Some(jpeg) = take_next_jpeg(&mut buf) {
            sequence += 1;
            if tx.send(Some(Frame::new(jpeg, sequence))).is_err() {
                return; // source dropped
            }
        }

        if buf.len() > MAX_FRAME_BYTES {
            tracing::warn!(buffered = buf.len(), "mjpeg stream lost sync; resetting buffer");
            buf.clear();
        }
    }
    tracing::debug!(frames = sequence, "mjpeg stream ended");
}

/// Extract the next complete JPEG (SOI..EOI) from the buffer, discarding any
/// garbage before the start marker.
fn take_next_jpeg(buf: &mut BytesMut) -> Option<Bytes> {
    let start = find(buf, &SOI)?;
    if start > 0 {
        let _ = buf.split_to(start);
    }
    let end = find(&buf[SOI.len()..], &EOI)? + SOI.len() + EOI.len();
    Some(buf.split_to(end).freeze())
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

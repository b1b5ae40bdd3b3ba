//! Live recording of color, depth and pose streams
//!
//! This module provides:
//! - Encoder process adapters (one external transcoder per chunk and stream)
//! - The per-device `RecordingSession` state machine with timed chunk rotation
//! - The `DeviceRegistry` that owns one session per connected device

pub mod encoder;
pub mod pose;
pub mod registry;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::storage::StreamKind;

pub use encoder::{
    encoder_factory, EncoderFactory, EncoderProcess, EncoderState, RawFileEncoderFactory,
    SubprocessEncoderFactory,
};
pub use pose::{PoseBuffer, PoseSample};
pub use registry::DeviceRegistry;
pub use session::{Frame, RecordingEvent, RecordingSession, SessionStats, StreamStatus};

/// Configuration for recording sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Duration of each chunk before rotating encoders
    /// Default: 15000 ms
    pub chunk_interval_ms: u64,

    /// Container extension of color chunks
    pub color_extension: String,

    /// Container extension of depth chunks
    pub depth_extension: String,
}

impl RecordingConfig {
    pub fn extension(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Color => &self.color_extension,
            StreamKind::Depth => &self.depth_extension,
            StreamKind::Pose => "json",
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 15_000,
            color_extension: "mp4".to_string(),
            depth_extension: "mp4".to_string(),
        }
    }
}

/// External transcoder invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Program to spawn per chunk; empty writes raw frames to the chunk file
    pub program: String,

    /// Arguments for color chunks, `{output}` is replaced by the chunk path
    pub color_args: Vec<String>,

    /// Arguments for depth chunks, `{output}` is replaced by the chunk path
    pub depth_args: Vec<String>,

    /// Written to stdin before closing it
    #[serde(default)]
    pub end_sentinel: Option<String>,

    /// Frames queued per encoder before new frames are dropped
    pub queue_frames: usize,

    /// How long `stop` waits for the transcoder to exit before killing it
    /// Default: 10000 ms
    pub stop_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let args = |input_format: &str| {
            [
                "-y", "-loglevel", "error", "-f", input_format, "-i", "-", "-c:v", "libx264",
                "-preset", "ultrafast", "-pix_fmt", "yuv420p", "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
        };

        Self {
            program: "ffmpeg".to_string(),
            color_args: args("mjpeg"),
            depth_args: args("mjpeg"),
            end_sentinel: None,
            queue_frames: 32,
            stop_timeout_ms: 10_000,
        }
    }
}

//! Windowed, zoomable timeline driving synchronized playback
//!
//! - `window`: unzoomed and current bounds with nonlinear zoom
//! - `model`: tracks, segments, playhead, selection events
//! - `playback`: fixed-rate ticker advancing the playhead
//! - `loader`: finished sessions on disk → tracks and segments

pub mod loader;
pub mod model;
pub mod playback;
pub mod window;

use serde::{Deserialize, Serialize};

pub use loader::load_tracks;
pub use model::{
    tracks_range, DataPiece, PieceValue, PlayheadPercent, Segment, SelectionChange,
    TimelineEvent, TimelineModel, Track,
};
pub use playback::{spawn_playback, PlaybackController};
pub use window::{TimeRange, TimelineWindow, WindowBounds, WindowEvent};

/// Timeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Exponent applied to the raw zoom-handle position
    pub zoom_exponent: f64,
    /// Ratio between the unzoomed range and the narrowest window
    /// Default: 96 (a day down to 15 minutes)
    pub max_zoom: f64,
    /// Playback tick period in milliseconds
    pub tick_ms: u64,
    /// Upper bound of the playback speed multiplier
    pub max_speed: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            zoom_exponent: 0.5,
            max_zoom: 96.0,
            tick_ms: 16,
            max_speed: 64.0,
        }
    }
}

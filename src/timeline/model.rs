use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::window::{TimeRange, TimelineWindow, WindowBounds, WindowEvent};
use super::TimelineConfig;
use crate::recording::PoseSample;

/// A named data source within a segment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataPiece {
    /// A playable media resource covering the whole segment
    Media { resource: PathBuf },
    /// Discrete timestamped samples
    Samples { samples: Vec<PoseSample> },
}

/// What a data piece holds at one timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PieceValue {
    /// Seek position inside the media resource
    Media { resource: PathBuf, offset_ms: i64 },
    /// Latest sample at or before the timestamp
    Sample { sample: PoseSample },
}

impl DataPiece {
    pub fn value_at(&self, segment_start: i64, timestamp: i64) -> Option<PieceValue> {
        match self {
            DataPiece::Media { resource } => Some(PieceValue::Media {
                resource: resource.clone(),
                offset_ms: (timestamp - segment_start).max(0),
            }),
            DataPiece::Samples { samples } => {
                let after = samples.partition_point(|s| s.timestamp <= timestamp);
                let sample = samples.get(after.checked_sub(1)?)?;
                Some(PieceValue::Sample {
                    sample: sample.clone(),
                })
            }
        }
    }
}

/// A time-bounded unit of data within a track; never mutated once built
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub id: String,
    pub track_id: String,
    pub start: i64,
    pub end: i64,
    /// Free-form type tag, e.g. `rgbd`
    #[serde(rename = "type")]
    pub kind: String,
    pub pieces: BTreeMap<String, DataPiece>,
}

impl Segment {
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    pub fn values_at(&self, timestamp: i64) -> BTreeMap<String, PieceValue> {
        self.pieces
            .iter()
            .filter_map(|(name, piece)| {
                piece
                    .value_at(self.start, timestamp)
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }
}

/// Per-device lane of segments, assumed time-disjoint
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub segments: Vec<Arc<Segment>>,
}

impl Track {
    pub fn new(id: impl Into<String>, segments: Vec<Segment>) -> Self {
        let mut segments: Vec<Arc<Segment>> = segments.into_iter().map(Arc::new).collect();
        segments.sort_by_key(|s| (s.start, s.end));
        Self {
            id: id.into(),
            segments,
        }
    }

    pub fn segment_at(&self, timestamp: i64) -> Option<&Arc<Segment>> {
        self.segments.iter().find(|s| s.contains(timestamp))
    }
}

/// Span of every segment of every track
pub fn tracks_range(tracks: &[Track]) -> Option<TimeRange> {
    let segments = tracks.iter().flat_map(|t| t.segments.iter());
    let min = segments.clone().map(|s| s.start).min()?;
    let max = segments.map(|s| s.end).max()?;
    Some(TimeRange::new(min, max))
}

/// Notifications for the renderer
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    SegmentSelected(Arc<Segment>),
    SegmentDeselected(Arc<Segment>),
    SegmentData {
        segment: Arc<Segment>,
        timestamp: i64,
        pieces: BTreeMap<String, PieceValue>,
    },
    TimestampUpdated(i64),
    WindowUpdated(WindowBounds),
    PlaybackChanged {
        is_playing: bool,
    },
}

/// Segments entering and leaving the selection in one `set_timestamp` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionChange {
    pub selected: Vec<Arc<Segment>>,
    pub deselected: Vec<Arc<Segment>>,
}

/// Playhead position against both the unzoomed and the current range
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayheadPercent {
    /// Position inside the zoomed window; outside `[0, 1]` when off-screen
    pub in_window: f64,
    /// Position inside the unzoomed range (miniature indicator)
    pub in_full: f64,
    pub visible: bool,
}

/// Tracks, playhead and selection driven by a single writer
pub struct TimelineModel {
    window: TimelineWindow,
    tracks: Vec<Track>,
    current_timestamp: i64,
    playback_speed: f64,
    is_playing: bool,
    /// track_id → selected segment
    selected: BTreeMap<String, Arc<Segment>>,
    config: TimelineConfig,
    events: broadcast::Sender<TimelineEvent>,
}

impl TimelineModel {
    pub fn new(without_zoom: TimeRange, config: TimelineConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            window: TimelineWindow::new(without_zoom, &config),
            tracks: Vec::new(),
            current_timestamp: without_zoom.min,
            playback_speed: 1.0,
            is_playing: false,
            selected: BTreeMap::new(),
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_window(&self) -> broadcast::Receiver<WindowEvent> {
        self.window.subscribe()
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn window(&self) -> &TimelineWindow {
        &self.window
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn current_timestamp(&self) -> i64 {
        self.current_timestamp
    }

    pub fn playback_speed(&self) -> f64 {
        self.playback_speed
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn selected_segments(&self) -> Vec<Arc<Segment>> {
        self.selected.values().cloned().collect()
    }

    /// Replace all tracks and re-evaluate the selection
    pub fn load_tracks(&mut self, tracks: Vec<Track>) -> SelectionChange {
        self.tracks = tracks;
        self.notify_window();
        self.set_timestamp(self.current_timestamp)
    }

    /// Set the unzoomed range to the span of the loaded segments
    pub fn fit_to_tracks(&mut self) {
        if let Some(range) = tracks_range(&self.tracks) {
            self.set_without_zoom(range);
        }
    }

    /// Move the playhead and recompute the selection from scratch
    pub fn set_timestamp(&mut self, timestamp: i64) -> SelectionChange {
        self.current_timestamp = timestamp;

        let mut next = BTreeMap::new();
        for track in &self.tracks {
            if let Some(segment) = track.segment_at(timestamp) {
                next.insert(track.id.clone(), Arc::clone(segment));
            }
        }

        let mut change = SelectionChange::default();
        for (track_id, previous) in &self.selected {
            if next.get(track_id).map(|s| s.id != previous.id).unwrap_or(true) {
                change.deselected.push(Arc::clone(previous));
            }
        }
        for (track_id, segment) in &next {
            if self
                .selected
                .get(track_id)
                .map(|s| s.id != segment.id)
                .unwrap_or(true)
            {
                change.selected.push(Arc::clone(segment));
            }
        }
        self.selected = next;

        for segment in &change.deselected {
            debug!("Segment deselected: {}/{}", segment.track_id, segment.id);
            self.emit(TimelineEvent::SegmentDeselected(Arc::clone(segment)));
        }
        for segment in &change.selected {
            debug!("Segment selected: {}/{}", segment.track_id, segment.id);
            self.emit(TimelineEvent::SegmentSelected(Arc::clone(segment)));
        }
        for segment in self.selected.values() {
            self.emit(TimelineEvent::SegmentData {
                segment: Arc::clone(segment),
                timestamp,
                pieces: segment.values_at(timestamp),
            });
        }
        self.emit(TimelineEvent::TimestampUpdated(timestamp));

        change
    }

    /// Start or stop playback; the ticker calls `tick` while playing
    pub fn toggle_playback(&mut self, on: bool) {
        if self.is_playing == on {
            return;
        }
        self.is_playing = on;
        self.emit(TimelineEvent::PlaybackChanged { is_playing: on });
    }

    /// Advance the playhead by `elapsed_real_ms × playback_speed`
    ///
    /// Clamps at the unzoomed maximum and stops playback there. Returns
    /// whether playback is still running.
    pub fn tick(&mut self, elapsed_real_ms: f64) -> bool {
        if !self.is_playing {
            return false;
        }

        let max = self.window.without_zoom().max;
        let advanced = self.current_timestamp as f64 + elapsed_real_ms * self.playback_speed;
        if advanced >= max as f64 {
            self.set_timestamp(max);
            self.toggle_playback(false);
            return false;
        }

        self.set_timestamp(advanced.round() as i64);
        true
    }

    /// Multiply the playback speed, wrapping or clamping at `[1, max_speed]`
    pub fn multiply_speed(&mut self, factor: f64, allow_loop: bool) -> f64 {
        let max_speed = self.config.max_speed.max(1.0);
        let speed = self.playback_speed * factor;

        self.playback_speed = if speed > max_speed {
            if allow_loop {
                1.0
            } else {
                max_speed
            }
        } else if speed < 1.0 {
            if allow_loop {
                max_speed
            } else {
                1.0
            }
        } else {
            speed
        };

        self.playback_speed
    }

    pub fn timestamp_as_percent(&self, timestamp: i64) -> PlayheadPercent {
        let current = self.window.current();
        PlayheadPercent {
            in_window: current.percent_of(timestamp),
            in_full: self.window.without_zoom().percent_of(timestamp),
            visible: current.contains(timestamp),
        }
    }

    pub fn playhead_percent(&self) -> PlayheadPercent {
        self.timestamp_as_percent(self.current_timestamp)
    }

    /// Segments overlapping the current window, per track
    pub fn visible_segments(&self) -> Vec<(String, Vec<Arc<Segment>>)> {
        let current = self.window.current();
        self.tracks
            .iter()
            .map(|track| {
                let segments = track
                    .segments
                    .iter()
                    .filter(|s| current.overlaps(s.start, s.end))
                    .cloned()
                    .collect();
                (track.id.clone(), segments)
            })
            .collect()
    }

    pub fn set_without_zoom(&mut self, range: TimeRange) {
        self.window.set_without_zoom(range);
        self.notify_window();
    }

    pub fn set_current_from_percent(&mut self, left: f64, right: f64) {
        self.window.set_current_from_percent(left, right);
        self.notify_window();
    }

    pub fn set_zoom_from_handle(&mut self, handle: f64) {
        self.window.set_zoom_from_handle(handle);
        self.notify_window();
    }

    fn notify_window(&self) {
        self.emit(TimelineEvent::WindowUpdated(self.window.bounds()));
    }

    fn emit(&self, event: TimelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

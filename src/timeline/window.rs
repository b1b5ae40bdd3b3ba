use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::TimelineConfig;

/// Closed interval of absolute timestamps in milliseconds, `min < max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    /// A degenerate or reversed pair is widened to a 1 ms range
    pub fn new(a: i64, b: i64) -> Self {
        let (min, max) = if a <= b { (a, b) } else { (b, a) };
        Self {
            min,
            max: max.max(min + 1),
        }
    }

    /// The UTC calendar day containing `timestamp_ms`
    pub fn day_containing(timestamp_ms: i64) -> Self {
        let start = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .and_then(|t| t.date_naive().and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc().timestamp_millis())
            .unwrap_or(timestamp_ms);
        Self::new(start, start + ChronoDuration::days(1).num_milliseconds())
    }

    pub fn duration(&self) -> i64 {
        self.max - self.min
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.min <= timestamp && timestamp <= self.max
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        start <= self.max && end >= self.min
    }

    /// Position of `timestamp` in this range; outside `[0, 1]` when outside
    pub fn percent_of(&self, timestamp: i64) -> f64 {
        (timestamp - self.min) as f64 / self.duration() as f64
    }

    pub fn at_percent(&self, percent: f64) -> i64 {
        self.min + (self.duration() as f64 * percent).round() as i64
    }
}

/// Unzoomed and current (zoomed) bounds
///
/// `without_zoom.min <= current.min < current.max <= without_zoom.max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBounds {
    pub without_zoom: TimeRange,
    pub current: TimeRange,
}

/// Level-triggered: fired on every change with the full new bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    WithoutZoomUpdated(WindowBounds),
    CurrentUpdated(WindowBounds),
}

/// Scrollable, zoomable view over a fixed time range
pub struct TimelineWindow {
    bounds: WindowBounds,
    zoom_exponent: f64,
    max_zoom: f64,
    events: broadcast::Sender<WindowEvent>,
}

impl TimelineWindow {
    pub fn new(without_zoom: TimeRange, config: &TimelineConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            bounds: WindowBounds {
                without_zoom,
                current: without_zoom,
            },
            zoom_exponent: config.zoom_exponent,
            max_zoom: config.max_zoom.max(1.0),
            events,
        }
    }

    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    pub fn without_zoom(&self) -> TimeRange {
        self.bounds.without_zoom
    }

    pub fn current(&self) -> TimeRange {
        self.bounds.current
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowEvent> {
        self.events.subscribe()
    }

    /// Replace the unzoomed range, keeping as much of the current view as fits
    pub fn set_without_zoom(&mut self, range: TimeRange) {
        self.bounds.without_zoom = range;
        let current = self.bounds.current;
        self.bounds.current = if range.overlaps(current.min, current.max) {
            self.clamp(current.min, current.max)
        } else {
            range
        };

        let _ = self.events.send(WindowEvent::WithoutZoomUpdated(self.bounds));
        let _ = self.events.send(WindowEvent::CurrentUpdated(self.bounds));
    }

    /// Map two scroll-handle positions linearly onto the unzoomed range
    ///
    /// Positions are clamped to `[0, 1]` and reordered if reversed.
    pub fn set_current_from_percent(&mut self, left: f64, right: f64) {
        let left = sanitize_percent(left);
        let right = sanitize_percent(right);
        let (left, right) = if left <= right { (left, right) } else { (right, left) };

        let full = self.bounds.without_zoom;
        self.set_current(full.at_percent(left), full.at_percent(right));
    }

    /// Set the current range directly, clamped into the unzoomed range
    pub fn set_current(&mut self, min: i64, max: i64) {
        self.bounds.current = self.clamp(min, max);
        let _ = self.events.send(WindowEvent::CurrentUpdated(self.bounds));
    }

    /// Current range as two scroll-handle positions
    pub fn current_as_percent(&self) -> (f64, f64) {
        let full = self.bounds.without_zoom;
        (
            full.percent_of(self.bounds.current.min),
            full.percent_of(self.bounds.current.max),
        )
    }

    /// Window duration selected by a raw zoom-handle position in `[0, 1]`
    ///
    /// `0` is the deepest zoom (`1 / max_zoom` of the unzoomed range), `1` the
    /// full range. The position is raised to `zoom_exponent` first. That keeps
    /// the duration strictly increasing in the handle, but with an exponent
    /// below one the handle is most sensitive at the zoomed-in end, not the
    /// zoomed-out end. An exponent above one flips that at the cost of a
    /// coarse first step out of the deepest zoom.
    pub fn zoom_duration(&self, handle: f64) -> i64 {
        let full = self.bounds.without_zoom.duration() as f64;
        let narrowest = full / self.max_zoom;
        let fraction = sanitize_percent(handle).powf(self.zoom_exponent);
        let duration = narrowest + (full - narrowest) * fraction;
        (duration.round() as i64).clamp(1, self.bounds.without_zoom.duration())
    }

    /// Inverse of `zoom_duration` for the current window
    pub fn zoom_handle(&self) -> f64 {
        let full = self.bounds.without_zoom.duration() as f64;
        let narrowest = full / self.max_zoom;
        if full - narrowest <= 0.0 {
            return 1.0;
        }
        let fraction = (self.bounds.current.duration() as f64 - narrowest) / (full - narrowest);
        fraction.clamp(0.0, 1.0).powf(1.0 / self.zoom_exponent)
    }

    /// Zoom around the centre of the current window
    pub fn set_zoom_from_handle(&mut self, handle: f64) {
        let duration = self.zoom_duration(handle);
        let current = self.bounds.current;
        let centre = current.min + current.duration() / 2;
        let min = centre - duration / 2;
        self.set_current(min, min + duration);
    }

    /// Clamp a range into the unzoomed range, shifting it rather than
    /// shrinking it where possible
    fn clamp(&self, min: i64, max: i64) -> TimeRange {
        let full = self.bounds.without_zoom;
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let duration = (max - min).clamp(1, full.duration());

        let mut start = min;
        if start < full.min {
            start = full.min;
        }
        if start + duration > full.max {
            start = full.max - duration;
        }
        TimeRange {
            min: start,
            max: start + duration,
        }
    }
}

fn sanitize_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

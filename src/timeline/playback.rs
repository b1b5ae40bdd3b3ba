use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use super::model::TimelineModel;

/// Drives a shared timeline model from a fixed-rate ticker while playing
///
/// While the ticker runs it is the only writer of the playhead.
#[derive(Clone)]
pub struct PlaybackController {
    model: Arc<Mutex<TimelineModel>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PlaybackController {
    pub fn new(model: Arc<Mutex<TimelineModel>>) -> Self {
        Self {
            model,
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn model(&self) -> &Arc<Mutex<TimelineModel>> {
        &self.model
    }

    pub async fn play(&self) {
        self.model.lock().await.toggle_playback(true);
        self.spawn_ticker().await;
    }

    pub async fn pause(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
        self.model.lock().await.toggle_playback(false);
    }

    /// Seek, pausing first so the ticker never races a user-driven move
    pub async fn seek(&self, timestamp: i64) {
        self.pause().await;
        self.model.lock().await.set_timestamp(timestamp);
    }

    pub async fn is_playing(&self) -> bool {
        self.model.lock().await.is_playing()
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }
        let tick_ms = self.model.lock().await.config().tick_ms;
        *ticker_guard = Some(spawn_playback(Arc::clone(&self.model), tick_ms));
    }
}

/// Advance `model` every `tick_ms` by the real time elapsed since the last tick
///
/// The task ends as soon as the model reports playback stopped, either because
/// it was paused or because the playhead reached the end of the range.
pub fn spawn_playback(model: Arc<Mutex<TimelineModel>>, tick_ms: u64) -> JoinHandle<()> {
    let period = Duration::from_millis(tick_ms.max(1));

    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        let mut last = Instant::now();

        loop {
            interval.tick().await;
            let now = Instant::now();
            let elapsed_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            last = now;

            let mut guard = model.lock().await;
            if !guard.tick(elapsed_ms) {
                info!("Playback stopped at {}", guard.current_timestamp());
                break;
            }
        }
    })
}

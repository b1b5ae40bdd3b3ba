use anyhow::{bail, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::encoder::EncoderFactory;
use super::session::{Frame, RecordingEvent, RecordingSession, SessionStats};
use super::RecordingConfig;
use crate::storage::{CompletionMarker, StoragePipeline};

/// Owns the recording session of every connected device
///
/// Entries are inserted on connect and removed on disconnect; nothing else
/// holds per-device recording state.
#[derive(Clone)]
pub struct DeviceRegistry {
    /// Connected devices (device_id → session)
    sessions: Arc<RwLock<HashMap<String, Arc<RecordingSession>>>>,
    root: PathBuf,
    config: RecordingConfig,
    encoders: Arc<dyn EncoderFactory>,
    events: broadcast::Sender<RecordingEvent>,
}

impl DeviceRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        config: RecordingConfig,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            root: root.into(),
            config,
            encoders,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Register a device and start recording it
    pub async fn connect(&self, device_id: &str) -> Result<String> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(device_id) {
                bail!("Device {} is already connected", device_id);
            }
            let session = Arc::new(RecordingSession::new(
                device_id,
                &self.root,
                self.config.clone(),
                Arc::clone(&self.encoders),
                self.events.clone(),
            ));
            sessions.insert(device_id.to_string(), Arc::clone(&session));
            session
        };

        info!("Device connected: {}", device_id);

        match session.start_recording().await {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                self.sessions.write().await.remove(device_id);
                Err(e)
            }
        }
    }

    /// Start a new session on an already connected device
    pub async fn start_recording(&self, device_id: &str) -> Result<String> {
        match self.get(device_id).await {
            Some(session) => session.start_recording().await,
            None => bail!("Device {} is not connected", device_id),
        }
    }

    /// User-initiated stop; the device stays connected
    pub async fn stop_recording(&self, device_id: &str) -> Result<Option<CompletionMarker>> {
        match self.get(device_id).await {
            Some(session) => session.stop_recording(false).await,
            None => bail!("Device {} is not connected", device_id),
        }
    }

    /// Remove a device, ending its session as disconnected
    pub async fn disconnect(&self, device_id: &str) -> Result<Option<CompletionMarker>> {
        let session = self.sessions.write().await.remove(device_id);
        match session {
            Some(session) => {
                info!("Device disconnected: {}", device_id);
                session.stop_recording(true).await
            }
            None => {
                warn!("Disconnect for unknown device {}", device_id);
                Ok(None)
            }
        }
    }

    /// Route a frame to the device's session; `false` if the device is unknown
    pub async fn on_frame(&self, device_id: &str, frame: Frame) -> bool {
        match self.get(device_id).await {
            Some(session) => {
                session.on_frame(frame).await;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<RecordingSession>> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub async fn stats(&self) -> Vec<SessionStats> {
        let sessions: Vec<Arc<RecordingSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(sessions.len());
        for session in sessions {
            stats.push(session.get_stats().await);
        }
        stats.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        stats
    }

    /// Disconnect every device, e.g. on shutdown
    pub async fn disconnect_all(&self) {
        let devices = self.devices().await;
        let results = join_all(devices.iter().map(|device_id| self.disconnect(device_id))).await;
        for (device_id, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to stop {} on shutdown: {:#}", device_id, e);
            }
        }
    }

    /// Sweep a device's storage whenever one of its sessions finishes
    pub fn spawn_sweeper(&self, pipeline: StoragePipeline) -> JoinHandle<()> {
        let mut events = self.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RecordingEvent::Done { device_id, session_id, .. }) => {
                        info!("Session {} of {} finished, sweeping", session_id, device_id);
                        if let Err(e) = pipeline.sweep(&device_id).await {
                            error!("Sweep after session {} failed: {:#}", session_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Sweeper lagged behind by {} recording events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

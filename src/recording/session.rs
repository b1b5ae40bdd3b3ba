use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::encoder::{EncoderFactory, EncoderProcess};
use super::pose::{write_pose_chunk, PoseBuffer, PoseSample};
use super::RecordingConfig;
use crate::storage::naming::{generate_session_id, now_ms, ChunkName};
use crate::storage::{CompletionMarker, DeviceLayout, StreamKind};

/// Status of one stream of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    NotStarted,
    Started,
    Ending,
    Stopped,
    Disconnected,
}

/// One frame delivered by a device; any part may be missing
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Raw color bytes as produced by the device
    pub color: Option<Vec<u8>>,
    /// Raw depth bytes as produced by the device
    pub depth: Option<Vec<u8>>,
    pub pose: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// Lifecycle notifications published by recording sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordingEvent {
    Started {
        device_id: String,
        session_id: String,
    },
    ChunkRotated {
        device_id: String,
        session_id: String,
        chunk_index: u32,
    },
    /// The single hand-off point to session concatenation
    Done {
        device_id: String,
        session_id: String,
        last_chunk_index: u32,
        disconnected: bool,
    },
}

/// Snapshot of a recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub device_id: String,
    pub session_id: Option<String>,
    pub is_recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Index of the chunk currently being written (or the last one written)
    pub chunk_index: u32,
    pub color: StreamStatus,
    pub depth: StreamStatus,
    pub buffered_poses: usize,
}

struct StreamSlot {
    status: StreamStatus,
    encoder: Option<Box<dyn EncoderProcess>>,
}

impl StreamSlot {
    fn idle() -> Self {
        Self {
            status: StreamStatus::NotStarted,
            encoder: None,
        }
    }
}

struct SessionState {
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    chunk_index: u32,
    active: bool,
    streams: BTreeMap<StreamKind, StreamSlot>,
    poses: PoseBuffer,
}

impl SessionState {
    fn new() -> Self {
        let mut streams = BTreeMap::new();
        for kind in StreamKind::VIDEO {
            streams.insert(kind, StreamSlot::idle());
        }
        Self {
            session_id: None,
            started_at: None,
            chunk_index: 0,
            active: false,
            streams,
            poses: PoseBuffer::default(),
        }
    }

    fn status(&self, kind: StreamKind) -> StreamStatus {
        self.streams
            .get(&kind)
            .map(|slot| slot.status)
            .unwrap_or(StreamStatus::NotStarted)
    }
}

/// A chunk whose encoders were detached and still have to be closed
struct ClosingChunk {
    session_id: String,
    chunk_index: u32,
    encoders: Vec<Box<dyn EncoderProcess>>,
    poses: Vec<PoseSample>,
}

struct RotationTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything the rotation task shares with the session handle
struct SessionCore {
    device_id: String,
    config: RecordingConfig,
    layout: DeviceLayout,
    encoders: Arc<dyn EncoderFactory>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<RecordingEvent>,
}

/// Per-device recording state machine
///
/// `NOT_STARTED → STARTED → ENDING → (STARTED | STOPPED | DISCONNECTED)` per
/// stream. A background task rotates chunks every `chunk_interval`; frames
/// arriving while a stream is `ENDING` are dropped.
pub struct RecordingSession {
    core: Arc<SessionCore>,
    rotation: Mutex<Option<RotationTask>>,
}

impl RecordingSession {
    pub fn new(
        device_id: impl Into<String>,
        root: &Path,
        config: RecordingConfig,
        encoders: Arc<dyn EncoderFactory>,
        events: broadcast::Sender<RecordingEvent>,
    ) -> Self {
        let device_id = device_id.into();
        let layout = DeviceLayout::new(root, &device_id);

        Self {
            core: Arc::new(SessionCore {
                device_id,
                config,
                layout,
                encoders,
                state: Mutex::new(SessionState::new()),
                events,
            }),
            rotation: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.core.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.core.events.subscribe()
    }

    /// Start a new session and its rotation timer, returning the session ID
    ///
    /// Starting a device that is already recording returns the active ID and
    /// leaves its timer alone.
    pub async fn start_recording(&self) -> Result<String> {
        match self.core.start().await? {
            Started::New(session_id) => {
                self.spawn_rotation().await;
                Ok(session_id)
            }
            Started::AlreadyActive(session_id) => Ok(session_id),
        }
    }

    /// Forward one frame to the active encoders and pose buffer
    pub async fn on_frame(&self, frame: Frame) {
        self.core.on_frame(frame).await
    }

    /// Close the current chunk and open the next one
    ///
    /// Called by the rotation timer; exposed so callers can force a boundary.
    pub async fn rotate(&self) -> Result<()> {
        self.core.rotate().await
    }

    /// End the session and write its completion marker
    ///
    /// Returns `None` when no session was active.
    pub async fn stop_recording(&self, disconnected: bool) -> Result<Option<CompletionMarker>> {
        self.cancel_rotation().await;
        self.core.stop(disconnected).await
    }

    pub async fn stream_status(&self, kind: StreamKind) -> StreamStatus {
        self.core.state.lock().await.status(kind)
    }

    pub async fn is_recording(&self) -> bool {
        self.core.state.lock().await.active
    }

    pub async fn get_stats(&self) -> SessionStats {
        let state = self.core.state.lock().await;
        SessionStats {
            device_id: self.core.device_id.clone(),
            session_id: state.session_id.clone(),
            is_recording: state.active,
            started_at: state.started_at,
            chunk_index: state.chunk_index,
            color: state.status(StreamKind::Color),
            depth: state.status(StreamKind::Depth),
            buffered_poses: state.poses.len(),
        }
    }

    async fn spawn_rotation(&self) {
        self.cancel_rotation().await;
        let mut rotation = self.rotation.lock().await;

        let core = Arc::clone(&self.core);
        let interval = Duration::from_millis(self.core.config.chunk_interval_ms);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = core.rotate().await {
                            error!("Chunk rotation failed for {}: {:#}", core.device_id, e);
                        }
                        if !core.state.lock().await.active {
                            break;
                        }
                    }
                }
            }
        });

        *rotation = Some(RotationTask { stop_tx, handle });
    }

    /// Stop the timer, letting an in-flight rotation finish first
    async fn cancel_rotation(&self) {
        let task = self.rotation.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(());
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    error!("Rotation task for {} panicked: {}", self.core.device_id, e);
                }
            }
        }
    }
}

enum Started {
    New(String),
    AlreadyActive(String),
}

impl SessionCore {
    async fn start(&self) -> Result<Started> {
        let mut state = self.state.lock().await;
        if state.active {
            warn!("Device {} is already recording", self.device_id);
            return state
                .session_id
                .clone()
                .map(Started::AlreadyActive)
                .context("Active session without an ID");
        }

        self.layout
            .ensure()
            .context("Failed to prepare device directories")?;

        let session_id = generate_session_id();
        info!(
            "Starting recording session {} for device {} ({}ms chunks)",
            session_id, self.device_id, self.config.chunk_interval_ms
        );

        state.session_id = Some(session_id.clone());
        state.started_at = Some(Utc::now());
        state.chunk_index = 0;
        state.active = true;
        state.poses = PoseBuffer::default();
        self.spawn_encoders(&mut state, &session_id, 0);
        drop(state);

        let _ = self.events.send(RecordingEvent::Started {
            device_id: self.device_id.clone(),
            session_id: session_id.clone(),
        });

        Ok(Started::New(session_id))
    }

    /// Spawn color and depth encoders for one chunk
    ///
    /// A spawn failure leaves that stream `NotStarted` for this chunk; the
    /// next rotation tries again.
    fn spawn_encoders(&self, state: &mut SessionState, session_id: &str, chunk_index: u32) {
        for kind in StreamKind::VIDEO {
            let name = ChunkName::new(
                session_id,
                chunk_index,
                now_ms(),
                self.config.extension(kind),
            );
            let path = self.layout.unprocessed_dir(kind).join(name.file_name());

            let slot = state.streams.entry(kind).or_insert_with(StreamSlot::idle);
            match self.encoders.spawn(kind, &path) {
                Ok(encoder) => {
                    slot.encoder = Some(encoder);
                    slot.status = StreamStatus::Started;
                }
                Err(e) => {
                    error!(
                        "Failed to start {} encoder for {} chunk {}: {:#}",
                        kind, self.device_id, chunk_index, e
                    );
                    slot.encoder = None;
                    slot.status = StreamStatus::NotStarted;
                }
            }
        }
    }

    async fn on_frame(&self, frame: Frame) {
        let mut state = self.state.lock().await;
        if !state.active {
            return;
        }

        for (kind, bytes) in [
            (StreamKind::Color, frame.color.as_deref()),
            (StreamKind::Depth, frame.depth.as_deref()),
        ] {
            let Some(bytes) = bytes else { continue };
            if let Some(slot) = state.streams.get_mut(&kind) {
                if slot.status != StreamStatus::Started {
                    continue;
                }
                if let Some(encoder) = slot.encoder.as_mut() {
                    encoder.write(bytes).await;
                }
            }
        }

        if let Some(pose) = frame.pose {
            state.poses.push(pose, frame.timestamp_ms);
        }
    }

    /// Mark streams `Ending` and detach their encoders and poses
    fn detach_chunk(&self, state: &mut SessionState) -> Option<ClosingChunk> {
        let session_id = state.session_id.clone()?;

        let mut encoders = Vec::new();
        for slot in state.streams.values_mut() {
            if let Some(encoder) = slot.encoder.take() {
                slot.status = StreamStatus::Ending;
                encoders.push(encoder);
            }
        }

        Some(ClosingChunk {
            session_id,
            chunk_index: state.chunk_index,
            encoders,
            poses: state.poses.take(),
        })
    }

    /// Close the detached encoders and flush the poses to their chunk file
    async fn close_chunk(&self, mut chunk: ClosingChunk) {
        for encoder in chunk.encoders.iter_mut() {
            if let Err(e) = encoder.stop().await {
                error!("Failed to stop encoder {}: {:#}", encoder.name(), e);
            }
        }

        let name = ChunkName::new(chunk.session_id.as_str(), chunk.chunk_index, now_ms(), "json");
        match write_pose_chunk(&self.layout, &name, &chunk.poses) {
            Ok(path) => info!(
                "Chunk {} of session {} closed ({} poses in {})",
                chunk.chunk_index,
                chunk.session_id,
                chunk.poses.len(),
                path.display()
            ),
            Err(e) => error!(
                "Failed to flush poses for chunk {} of {}: {:#}",
                chunk.chunk_index, chunk.session_id, e
            ),
        }
    }

    async fn rotate(&self) -> Result<()> {
        let closing = {
            let mut state = self.state.lock().await;
            if !state.active {
                return Ok(());
            }
            self.detach_chunk(&mut state)
        };

        // Lock released: frames arriving now see `Ending` and are dropped
        if let Some(chunk) = closing {
            self.close_chunk(chunk).await;
        }

        let mut state = self.state.lock().await;
        if !state.active {
            return Ok(());
        }
        let session_id = state
            .session_id
            .clone()
            .context("Active session without an ID")?;
        state.chunk_index += 1;
        let chunk_index = state.chunk_index;
        self.spawn_encoders(&mut state, &session_id, chunk_index);
        drop(state);

        let _ = self.events.send(RecordingEvent::ChunkRotated {
            device_id: self.device_id.clone(),
            session_id,
            chunk_index,
        });

        Ok(())
    }

    async fn stop(&self, disconnected: bool) -> Result<Option<CompletionMarker>> {
        let closing = {
            let mut state = self.state.lock().await;
            if !state.active {
                warn!("Device {} is not recording", self.device_id);
                return Ok(None);
            }
            state.active = false;
            self.detach_chunk(&mut state)
        };

        let Some(chunk) = closing else {
            return Ok(None);
        };
        let session_id = chunk.session_id.clone();
        let last_chunk_index = chunk.chunk_index;

        info!(
            "Stopping recording session {} for device {} ({})",
            session_id,
            self.device_id,
            if disconnected { "disconnected" } else { "stopped" }
        );

        self.close_chunk(chunk).await;

        {
            let mut state = self.state.lock().await;
            let final_status = if disconnected {
                StreamStatus::Disconnected
            } else {
                StreamStatus::Stopped
            };
            for slot in state.streams.values_mut() {
                slot.status = final_status;
            }
        }

        let marker = CompletionMarker {
            device_id: self.device_id.clone(),
            session_id: session_id.clone(),
            last_chunk_index,
            disconnected,
            ended_at: Utc::now(),
        };
        marker
            .write(&self.layout)
            .context("Failed to write completion marker")?;

        info!(
            "Recording session {} done: {} chunks",
            session_id,
            marker.expected_chunks()
        );

        let _ = self.events.send(RecordingEvent::Done {
            device_id: self.device_id.clone(),
            session_id,
            last_chunk_index,
            disconnected,
        });

        Ok(Some(marker))
    }
}

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::layout::{list_file_names, DeviceLayout, StreamKind};
use super::marker::CompletionMarker;
use super::naming::{extract_session_id, session_pose_file_name, ChunkName, SessionVideoName};
use super::tool::MediaTool;

/// Why a session is not concatenated yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Every chunk was recorded but some are still being post-processed
    Processing,
    /// Chunks are missing altogether; waits for the next sweep
    MissingChunks,
}

/// Outcome of one concatenation attempt for one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcatOutcome {
    /// The session has not ended yet
    NoMarker,
    /// The finished file already exists
    AlreadyFinished,
    Concatenated {
        output: PathBuf,
    },
    Deferred {
        reason: DeferReason,
        kind: StreamKind,
        processed: usize,
        unprocessed: usize,
        expected: usize,
    },
}

/// Outcomes for the video streams and the pose record of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatReport {
    pub color: ConcatOutcome,
    pub depth: ConcatOutcome,
    pub pose: ConcatOutcome,
}

/// Estimate session bounds from chunk file names
///
/// The timestamp embedded in a processed chunk name marks when the chunk
/// ended, so the start is the earliest one minus one rotation interval.
pub fn derive_time_bounds<S: AsRef<str>>(
    chunk_file_names: &[S],
    rotation_interval_ms: i64,
) -> Option<(i64, i64)> {
    let timestamps: Vec<i64> = chunk_file_names
        .iter()
        .filter_map(|name| ChunkName::parse(name.as_ref()))
        .map(|c| c.timestamp_ms)
        .collect();

    let first = timestamps.iter().min()?;
    let last = timestamps.iter().max()?;
    Some((first - rotation_interval_ms, *last))
}

/// Sort chunks by embedded index, dropping duplicates and unparseable names
pub fn order_chunks(chunk_file_names: &[String]) -> Vec<ChunkName> {
    let mut by_index: BTreeMap<u32, ChunkName> = BTreeMap::new();
    for name in chunk_file_names {
        if let Some(chunk) = ChunkName::parse(name) {
            by_index.entry(chunk.chunk_index).or_insert(chunk);
        }
    }
    by_index.into_values().collect()
}

/// Assembles ended sessions of one device into finished session files
pub struct SessionConcatenator {
    layout: DeviceLayout,
    tool: Arc<dyn MediaTool>,
    rotation_interval_ms: i64,
}

impl SessionConcatenator {
    pub fn new(layout: DeviceLayout, tool: Arc<dyn MediaTool>, rotation_interval_ms: i64) -> Self {
        Self {
            layout,
            tool,
            rotation_interval_ms,
        }
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Concatenate a session's video and pose outputs if it is complete
    ///
    /// Safe to call repeatedly: finished outputs are detected and skipped.
    pub async fn concatenate_if_ready(&self, session_id: &str) -> Result<ConcatReport> {
        let Some(marker) = CompletionMarker::read(&self.layout, session_id)? else {
            debug!("Session {} has not ended, nothing to concatenate", session_id);
            return Ok(ConcatReport {
                color: ConcatOutcome::NoMarker,
                depth: ConcatOutcome::NoMarker,
                pose: ConcatOutcome::NoMarker,
            });
        };

        let (color, depth) = self.concatenate_video(&marker).await?;
        let pose = self.concatenate_pose(&marker).await?;

        Ok(ConcatReport { color, depth, pose })
    }

    async fn concatenate_video(
        &self,
        marker: &CompletionMarker,
    ) -> Result<(ConcatOutcome, ConcatOutcome)> {
        let expected = marker.expected_chunks();
        let mut processed: BTreeMap<StreamKind, Vec<ChunkName>> = BTreeMap::new();

        for kind in StreamKind::VIDEO {
            let chunks = self.session_chunks(&self.layout.processed_dir(kind), marker)?;
            if chunks.len() < expected {
                let unprocessed = self
                    .session_chunks(&self.layout.unprocessed_dir(kind), marker)?
                    .len();
                let reason = if unprocessed >= expected {
                    DeferReason::Processing
                } else {
                    DeferReason::MissingChunks
                };

                info!(
                    "Deferring session {}: {} has {}/{} processed chunks ({} unprocessed)",
                    marker.session_id,
                    kind,
                    chunks.len(),
                    expected,
                    unprocessed
                );

                let deferred = ConcatOutcome::Deferred {
                    reason,
                    kind,
                    processed: chunks.len(),
                    unprocessed,
                    expected,
                };
                return Ok((deferred.clone(), deferred));
            }
            processed.insert(kind, chunks);
        }

        let names: Vec<String> = processed
            .values()
            .flatten()
            .map(|chunk| chunk.file_name())
            .collect();
        let Some((start_ms, end_ms)) = derive_time_bounds(&names, self.rotation_interval_ms) else {
            bail!("No timestamps found for session {}", marker.session_id);
        };

        let mut outcomes = Vec::new();
        for kind in StreamKind::VIDEO {
            let chunks = processed.get(&kind).map(Vec::as_slice).unwrap_or_default();
            outcomes.push(
                self.concatenate_stream(marker, kind, chunks, start_ms, end_ms)
                    .await?,
            );
        }

        let depth = outcomes.pop().unwrap_or(ConcatOutcome::NoMarker);
        let color = outcomes.pop().unwrap_or(ConcatOutcome::NoMarker);
        Ok((color, depth))
    }

    async fn concatenate_stream(
        &self,
        marker: &CompletionMarker,
        kind: StreamKind,
        chunks: &[ChunkName],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ConcatOutcome> {
        if self.finished_exists(kind, &marker.session_id)? {
            debug!("Session {} already has a finished {} file", marker.session_id, kind);
            return Ok(ConcatOutcome::AlreadyFinished);
        }

        let extension = chunks
            .first()
            .map(|c| c.extension.clone())
            .unwrap_or_else(|| "mp4".to_string());
        let name = SessionVideoName {
            device_id: marker.device_id.clone(),
            session_id: marker.session_id.clone(),
            start_ms,
            end_ms,
            extension,
        };

        let processed_dir = self.layout.processed_dir(kind);
        let inputs: Vec<PathBuf> = chunks
            .iter()
            .map(|c| processed_dir.join(c.file_name()))
            .collect();

        let tmp_dir = self.layout.tmp_dir();
        std::fs::create_dir_all(&tmp_dir).context("Failed to create tmp directory")?;
        let list_file = tmp_dir.join(format!("concat_{}_{}.txt", marker.session_id, kind));
        let staging = tmp_dir.join(name.file_name());

        self.tool
            .concat(&inputs, &list_file, &staging)
            .await
            .with_context(|| format!("Failed to concatenate {} for {}", kind, marker.session_id))?;

        let session_dir = self.layout.session_dir(kind);
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("Failed to create {:?}", session_dir))?;
        let output = session_dir.join(name.file_name());
        std::fs::rename(&staging, &output)
            .with_context(|| format!("Failed to move finished {} file into place", kind))?;

        info!(
            "Concatenated {} chunks of session {} into {}",
            inputs.len(),
            marker.session_id,
            output.display()
        );

        Ok(ConcatOutcome::Concatenated { output })
    }

    /// Flatten the session's pose chunks, in chunk order, into one JSON array
    async fn concatenate_pose(&self, marker: &CompletionMarker) -> Result<ConcatOutcome> {
        if self.finished_exists(StreamKind::Pose, &marker.session_id)? {
            return Ok(ConcatOutcome::AlreadyFinished);
        }

        let pose_dir = self.layout.unprocessed_dir(StreamKind::Pose);
        let chunks = self.session_chunks(&pose_dir, marker)?;
        if chunks.is_empty() {
            warn!("Session {} has no pose chunks", marker.session_id);
            return Ok(ConcatOutcome::Deferred {
                reason: DeferReason::MissingChunks,
                kind: StreamKind::Pose,
                processed: 0,
                unprocessed: 0,
                expected: marker.expected_chunks(),
            });
        }

        let mut samples: Vec<serde_json::Value> = Vec::new();
        for chunk in &chunks {
            let path = pose_dir.join(chunk.file_name());
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read pose chunk {:?}", path))?;
            let chunk_samples: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
                .with_context(|| format!("Malformed pose chunk {:?}", path))?;
            samples.extend(chunk_samples);
        }

        let session_dir = self.layout.session_dir(StreamKind::Pose);
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("Failed to create {:?}", session_dir))?;
        let output =
            session_dir.join(session_pose_file_name(&marker.device_id, &marker.session_id));
        let staging = self.layout.tmp_dir().join(format!("pose_{}.json", marker.session_id));

        tokio::fs::write(&staging, serde_json::to_vec(&samples)?)
            .await
            .with_context(|| format!("Failed to write {:?}", staging))?;
        std::fs::rename(&staging, &output)
            .with_context(|| format!("Failed to move pose record into place {:?}", output))?;

        info!(
            "Merged {} pose chunks ({} samples) of session {}",
            chunks.len(),
            samples.len(),
            marker.session_id
        );

        Ok(ConcatOutcome::Concatenated { output })
    }

    /// Chunks of this session within the marker's index range, ordered by index
    fn session_chunks(&self, dir: &std::path::Path, marker: &CompletionMarker) -> Result<Vec<ChunkName>> {
        let names: Vec<String> = list_file_names(dir)?
            .into_iter()
            .filter(|name| extract_session_id(name) == Some(marker.session_id.as_str()))
            .collect();

        Ok(order_chunks(&names)
            .into_iter()
            .filter(|c| c.chunk_index <= marker.last_chunk_index)
            .collect())
    }

    fn finished_exists(&self, kind: StreamKind, session_id: &str) -> Result<bool> {
        Ok(list_file_names(&self.layout.session_dir(kind))?
            .iter()
            .any(|name| extract_session_id(name) == Some(session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_time_bounds() {
        let names = vec![
            "chunk_ab12cd34_1_130000.mp4",
            "chunk_ab12cd34_0_115000.mp4",
            "chunk_ab12cd34_2_132000.mp4",
        ];
        assert_eq!(derive_time_bounds(&names, 15_000), Some((100_000, 132_000)));
    }

    #[test]
    fn test_derive_time_bounds_empty() {
        let names: Vec<String> = vec!["garbage.mp4".to_string()];
        assert_eq!(derive_time_bounds(&names, 15_000), None);
    }

    #[test]
    fn test_order_chunks_uses_embedded_index() {
        let names = vec![
            "chunk_ab12cd34_3_400.mp4".to_string(),
            "chunk_ab12cd34_1_200.mp4".to_string(),
            "chunk_ab12cd34_10_900.mp4".to_string(),
            "chunk_ab12cd34_2_300.mp4".to_string(),
        ];
        let indices: Vec<u32> = order_chunks(&names).iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 10]);
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::layout::{list_file_names, DeviceLayout, StreamKind};
use super::marker::CompletionMarker;
use super::naming::{now_ms, ChunkName};
use super::tool::MediaTool;

/// Result of one post-processing pass over a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Processed chunk files created in this pass
    pub processed: Vec<PathBuf>,
    /// Closed chunks left in place because they are below the size threshold
    pub skipped_small: Vec<PathBuf>,
    /// Chunks the media tool failed on
    pub failed: Vec<PathBuf>,
}

/// Post-process every closed, not yet processed color and depth chunk
///
/// A chunk is closed once its session has a completion marker or a later
/// chunk of the same session and kind exists (the recorder only opens chunk
/// `n + 1` after chunk `n` was fully written). The processed file name embeds
/// the unprocessed file's modification time, i.e. the moment the chunk ended.
pub async fn process_pending(
    layout: &DeviceLayout,
    tool: &dyn MediaTool,
    min_chunk_bytes: u64,
) -> Result<ProcessReport> {
    let mut report = ProcessReport::default();
    let ended: HashSet<String> = CompletionMarker::list(layout)?.into_iter().collect();

    for kind in StreamKind::VIDEO {
        let unprocessed_dir = layout.unprocessed_dir(kind);
        let processed_dir = layout.processed_dir(kind);

        let chunks: Vec<ChunkName> = list_file_names(&unprocessed_dir)?
            .iter()
            .filter_map(|name| ChunkName::parse(name))
            .collect();
        if chunks.is_empty() {
            continue;
        }

        let done: HashSet<(String, u32)> = list_file_names(&processed_dir)?
            .iter()
            .filter_map(|name| ChunkName::parse(name))
            .map(|c| (c.session_id, c.chunk_index))
            .collect();

        let mut last_index: BTreeMap<&str, u32> = BTreeMap::new();
        for chunk in &chunks {
            let entry = last_index.entry(chunk.session_id.as_str()).or_insert(0);
            *entry = (*entry).max(chunk.chunk_index);
        }

        for chunk in &chunks {
            if done.contains(&(chunk.session_id.clone(), chunk.chunk_index)) {
                continue;
            }

            let closed = ended.contains(&chunk.session_id)
                || chunk.chunk_index < last_index[chunk.session_id.as_str()];
            if !closed {
                continue;
            }

            let input = unprocessed_dir.join(chunk.file_name());
            let metadata = std::fs::metadata(&input)
                .with_context(|| format!("Failed to stat chunk {:?}", input))?;

            if metadata.len() < min_chunk_bytes {
                warn!(
                    "Skipping {} chunk {:?}: {} bytes is below the {} byte minimum",
                    kind,
                    input,
                    metadata.len(),
                    min_chunk_bytes
                );
                report.skipped_small.push(input);
                continue;
            }

            let ended_at = metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or_else(now_ms);

            let processed_name = ChunkName::new(
                chunk.session_id.clone(),
                chunk.chunk_index,
                ended_at,
                chunk.extension.clone(),
            );

            match process_chunk(layout, tool, &input, &processed_dir, &processed_name).await {
                Ok(output) => {
                    info!("Processed {} chunk {}", kind, output.display());
                    report.processed.push(output);
                }
                Err(e) => {
                    error!("Failed to process {} chunk {:?}: {:#}", kind, input, e);
                    report.failed.push(input);
                }
            }
        }
    }

    Ok(report)
}

/// Remux into `tmp/` first so a half-written output never counts as processed
async fn process_chunk(
    layout: &DeviceLayout,
    tool: &dyn MediaTool,
    input: &Path,
    processed_dir: &Path,
    name: &ChunkName,
) -> Result<PathBuf> {
    std::fs::create_dir_all(processed_dir)
        .with_context(|| format!("Failed to create {:?}", processed_dir))?;
    std::fs::create_dir_all(layout.tmp_dir()).context("Failed to create tmp directory")?;

    let staging = layout.tmp_dir().join(name.file_name());
    let output = processed_dir.join(name.file_name());

    tool.remux(input, &staging).await?;
    std::fs::rename(&staging, &output)
        .with_context(|| format!("Failed to move {:?} into {:?}", staging, processed_dir))?;

    Ok(output)
}

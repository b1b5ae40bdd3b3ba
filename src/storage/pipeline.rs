use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use super::concat::{ConcatReport, SessionConcatenator};
use super::index::{FileIndexBuilder, PersistentIndex};
use super::layout::{list_device_ids, DeviceLayout};
use super::marker::CompletionMarker;
use super::process::{process_pending, ProcessReport};
use super::tool::MediaTool;
use super::StorageConfig;

/// Result of sweeping one device
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub device_id: String,
    pub processing: ProcessReport,
    pub sessions: Vec<(String, ConcatReport)>,
}

/// Runs post-processing, concatenation and index rebuilding over the output root
///
/// Every step reads its inputs from disk, so a sweep after a crash picks up
/// exactly where the previous process left off.
#[derive(Clone)]
pub struct StoragePipeline {
    config: StorageConfig,
    rotation_interval_ms: i64,
    tool: Arc<dyn MediaTool>,
}

impl StoragePipeline {
    pub fn new(config: StorageConfig, rotation_interval_ms: i64, tool: Arc<dyn MediaTool>) -> Self {
        Self {
            config,
            rotation_interval_ms,
            tool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root_path
    }

    pub fn layout(&self, device_id: &str) -> DeviceLayout {
        DeviceLayout::new(&self.config.root_path, device_id)
    }

    pub fn index_builder(&self) -> FileIndexBuilder {
        FileIndexBuilder::new(self.config.root_path.clone(), self.config.index_file.clone())
    }

    pub fn concatenator(&self, device_id: &str) -> SessionConcatenator {
        SessionConcatenator::new(
            self.layout(device_id),
            Arc::clone(&self.tool),
            self.rotation_interval_ms,
        )
    }

    /// Post-process closed chunks of one device
    pub async fn process_pending(&self, device_id: &str) -> Result<ProcessReport> {
        process_pending(
            &self.layout(device_id),
            self.tool.as_ref(),
            self.config.min_chunk_bytes,
        )
        .await
    }

    /// Try to concatenate one session of one device
    pub async fn concatenate_if_ready(&self, device_id: &str, session_id: &str) -> Result<ConcatReport> {
        self.concatenator(device_id)
            .concatenate_if_ready(session_id)
            .await
    }

    /// Post-process and concatenate everything that is ready for one device
    pub async fn sweep_device(&self, device_id: &str) -> Result<SweepReport> {
        let processing = self.process_pending(device_id).await?;

        let concatenator = self.concatenator(device_id);
        let mut sessions = Vec::new();
        for session_id in CompletionMarker::list(concatenator.layout())? {
            match concatenator.concatenate_if_ready(&session_id).await {
                Ok(report) => sessions.push((session_id, report)),
                Err(e) => error!(
                    "Concatenation failed for {}/{}: {:#}",
                    device_id, session_id, e
                ),
            }
        }

        Ok(SweepReport {
            device_id: device_id.to_string(),
            processing,
            sessions,
        })
    }

    /// Sweep one device and refresh the index
    pub async fn sweep(&self, device_id: &str) -> Result<(SweepReport, PersistentIndex)> {
        let report = self.sweep_device(device_id).await?;
        let index = self.rebuild_index()?;
        Ok((report, index))
    }

    /// Sweep every device directory and refresh the index
    pub async fn sweep_all(&self) -> Result<(Vec<SweepReport>, PersistentIndex)> {
        let mut reports = Vec::new();
        for device_id in list_device_ids(&self.config.root_path)? {
            match self.sweep_device(&device_id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Sweep failed for device {}: {:#}", device_id, e),
            }
        }

        let index = self.rebuild_index()?;
        info!("Swept {} devices", reports.len());
        Ok((reports, index))
    }

    pub fn rebuild_index(&self) -> Result<PersistentIndex> {
        self.index_builder().rebuild()
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_builder().index_path()
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::layout::{list_device_ids, list_file_names, DeviceLayout, StreamKind};
use super::naming::{extract_session_id, ChunkName};

/// Everything known about one session of one device, derived from filenames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Finished color video file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Finished depth video file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<String>,
    /// Finished pose record file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<String>,
    /// `<kind>/<file>` entries from `processed_chunks/`
    #[serde(default)]
    pub processed_chunks: Vec<String>,
    /// `<kind>/<file>` entries from `unprocessed_chunks/`
    #[serde(default)]
    pub unprocessed_chunks: Vec<String>,
}

impl SessionRecord {
    pub fn finished(&self, kind: StreamKind) -> Option<&str> {
        match kind {
            StreamKind::Color => self.color.as_deref(),
            StreamKind::Depth => self.depth.as_deref(),
            StreamKind::Pose => self.pose.as_deref(),
        }
    }

    fn set_finished(&mut self, kind: StreamKind, file_name: String) {
        let slot = match kind {
            StreamKind::Color => &mut self.color,
            StreamKind::Depth => &mut self.depth,
            StreamKind::Pose => &mut self.pose,
        };
        // Sorted listing: keep the first name, later duplicates are ignored
        if slot.is_none() {
            *slot = Some(file_name);
        }
    }

    /// Number of processed chunks of one kind
    pub fn processed_count(&self, kind: StreamKind) -> usize {
        count_kind(&self.processed_chunks, kind)
    }

    /// Number of unprocessed chunks of one kind
    pub fn unprocessed_count(&self, kind: StreamKind) -> usize {
        count_kind(&self.unprocessed_chunks, kind)
    }
}

fn count_kind(entries: &[String], kind: StreamKind) -> usize {
    let prefix = format!("{}/", kind.as_str());
    entries.iter().filter(|e| e.starts_with(&prefix)).count()
}

/// `sessionId → record` for one device
pub type DeviceIndex = BTreeMap<String, SessionRecord>;

/// `device → sessionId → record`
///
/// Always derivable from disk. The JSON file written after a rebuild is a
/// cache for inspection and is never read back as a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentIndex {
    pub devices: BTreeMap<String, DeviceIndex>,
}

impl PersistentIndex {
    pub fn session(&self, device_id: &str, session_id: &str) -> Option<&SessionRecord> {
        self.devices.get(device_id)?.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.devices.values().map(|d| d.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize index")
    }
}

/// Rebuilds the persistent index by scanning the output root
pub struct FileIndexBuilder {
    root: PathBuf,
    index_file: String,
}

impl FileIndexBuilder {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(&self.index_file)
    }

    /// Scan every device directory without touching the cache file
    pub fn scan(&self) -> Result<PersistentIndex> {
        let mut index = PersistentIndex::default();
        for device_id in list_device_ids(&self.root)? {
            let layout = DeviceLayout::new(&self.root, &device_id);
            let sessions = scan_device(&layout)?;
            index.devices.insert(device_id, sessions);
        }
        Ok(index)
    }

    /// Scan the filesystem and refresh the cache file
    pub fn rebuild(&self) -> Result<PersistentIndex> {
        let index = self.scan()?;
        self.write_cache(&index)?;

        info!(
            "Index rebuilt: {} devices, {} sessions",
            index.devices.len(),
            index.session_count()
        );

        Ok(index)
    }

    fn write_cache(&self, index: &PersistentIndex) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create output root {:?}", self.root))?;

        // Each writer stages to its own file; the last rename wins
        let path = self.index_path();
        let mut staging = NamedTempFile::new_in(&self.root)
            .with_context(|| format!("Failed to stage index cache in {:?}", self.root))?;
        staging
            .write_all(index.to_json()?.as_bytes())
            .with_context(|| format!("Failed to write index cache {:?}", staging.path()))?;
        staging
            .persist(&path)
            .with_context(|| format!("Failed to move index cache into place {:?}", path))?;

        Ok(())
    }
}

/// Build the session records of one device purely from its directory tree
pub fn scan_device(layout: &DeviceLayout) -> Result<DeviceIndex> {
    let mut sessions = DeviceIndex::new();

    for kind in StreamKind::ALL {
        for file_name in list_file_names(&layout.session_dir(kind))? {
            let Some(session_id) = extract_session_id(&file_name) else {
                debug!("Ignoring unrecognised session file {}", file_name);
                continue;
            };
            let session_id = session_id.to_string();
            sessions
                .entry(session_id)
                .or_default()
                .set_finished(kind, file_name);
        }
    }

    for kind in StreamKind::VIDEO {
        collect_chunks(&layout.processed_dir(kind), kind, &mut sessions, |record| {
            &mut record.processed_chunks
        })?;
    }

    for kind in StreamKind::ALL {
        collect_chunks(&layout.unprocessed_dir(kind), kind, &mut sessions, |record| {
            &mut record.unprocessed_chunks
        })?;
    }

    for record in sessions.values_mut() {
        sort_chunk_entries(&mut record.processed_chunks);
        sort_chunk_entries(&mut record.unprocessed_chunks);
    }

    Ok(sessions)
}

fn collect_chunks(
    dir: &Path,
    kind: StreamKind,
    sessions: &mut DeviceIndex,
    list: impl Fn(&mut SessionRecord) -> &mut Vec<String>,
) -> Result<()> {
    for file_name in list_file_names(dir)? {
        let Some(session_id) = extract_session_id(&file_name) else {
            debug!("Ignoring unrecognised chunk file {}", file_name);
            continue;
        };
        let record = sessions.entry(session_id.to_string()).or_default();
        list(record).push(format!("{}/{}", kind.as_str(), file_name));
    }
    Ok(())
}

/// Order by stream kind, then numeric chunk index, then name
fn sort_chunk_entries(entries: &mut [String]) {
    entries.sort_by_key(|entry| {
        let (kind, file_name) = entry.split_once('/').unwrap_or(("", entry.as_str()));
        let kind_rank = StreamKind::parse(kind).map(|k| k as u8).unwrap_or(u8::MAX);
        let chunk_index = ChunkName::parse(file_name)
            .map(|c| c.chunk_index)
            .unwrap_or(u32::MAX);
        (kind_rank, chunk_index, entry.clone())
    });
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::layout::{list_file_names, DeviceLayout};
use super::naming::is_session_id;

/// Written to `tmp/` when a recording session ends
///
/// Records how many chunks the session produced so the concatenator can tell
/// a complete session from one whose chunks are still being post-processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub device_id: String,
    pub session_id: String,
    pub last_chunk_index: u32,
    /// True when the device dropped instead of being stopped by the user
    pub disconnected: bool,
    pub ended_at: DateTime<Utc>,
}

impl CompletionMarker {
    pub fn expected_chunks(&self) -> usize {
        self.last_chunk_index as usize + 1
    }

    pub fn path(layout: &DeviceLayout, session_id: &str) -> PathBuf {
        layout.tmp_dir().join(format!("complete_{}.json", session_id))
    }

    pub fn write(&self, layout: &DeviceLayout) -> Result<PathBuf> {
        std::fs::create_dir_all(layout.tmp_dir()).context("Failed to create tmp directory")?;

        let path = Self::path(layout, &self.session_id);
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write completion marker {:?}", path))?;
        Ok(path)
    }

    /// Read the marker for a session, `None` if the session has not ended
    pub fn read(layout: &DeviceLayout, session_id: &str) -> Result<Option<Self>> {
        let path = Self::path(layout, session_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };

        let marker = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed completion marker {:?}", path))?;
        Ok(Some(marker))
    }

    /// Session IDs of every marker present for a device
    pub fn list(layout: &DeviceLayout) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for name in list_file_names(&layout.tmp_dir())? {
            let id = name
                .strip_prefix("complete_")
                .and_then(|rest| rest.strip_suffix(".json"));
            if let Some(id) = id.filter(|id| is_session_id(id)) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_write_read_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = DeviceLayout::new(temp_dir.path(), "device7");

        assert_eq!(CompletionMarker::read(&layout, "ab12cd34")?, None);

        let marker = CompletionMarker {
            device_id: "device7".to_string(),
            session_id: "ab12cd34".to_string(),
            last_chunk_index: 2,
            disconnected: true,
            ended_at: Utc::now(),
        };
        marker.write(&layout)?;
        std::fs::write(layout.tmp_dir().join("concat_ab12cd34_color.txt"), b"")?;

        assert_eq!(CompletionMarker::read(&layout, "ab12cd34")?, Some(marker.clone()));
        assert_eq!(marker.expected_chunks(), 3);
        assert_eq!(CompletionMarker::list(&layout)?, vec!["ab12cd34".to_string()]);
        Ok(())
    }
}

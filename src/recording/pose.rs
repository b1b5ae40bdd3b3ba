use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::naming::ChunkName;
use crate::storage::{DeviceLayout, StreamKind};

/// One timestamped pose reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    /// Device-specific pose payload (e.g. a camera transform)
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// In-memory poses of the chunk being recorded
#[derive(Debug, Default)]
pub struct PoseBuffer {
    samples: Vec<PoseSample>,
}

impl PoseBuffer {
    pub fn push(&mut self, data: serde_json::Value, timestamp: i64) {
        self.samples.push(PoseSample { data, timestamp });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Hand over the buffered poses, leaving the buffer empty for the next chunk
    pub fn take(&mut self) -> Vec<PoseSample> {
        std::mem::take(&mut self.samples)
    }
}

/// Write one chunk's poses as a JSON array under `unprocessed_chunks/pose/`
pub fn write_pose_chunk(
    layout: &DeviceLayout,
    name: &ChunkName,
    samples: &[PoseSample],
) -> Result<PathBuf> {
    let dir = layout.unprocessed_dir(StreamKind::Pose);
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let path = dir.join(name.file_name());
    let json = serde_json::to_vec(samples).context("Failed to serialize pose chunk")?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write pose chunk {:?}", path))?;

    Ok(path)
}

/// Load a finished pose record
pub fn read_pose_samples(path: &std::path::Path) -> Result<Vec<PoseSample>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Malformed pose record {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_take_empties_buffer() {
        let mut buffer = PoseBuffer::default();
        buffer.push(json!([1, 0, 0]), 10);
        buffer.push(json!([0, 1, 0]), 20);

        let taken = buffer.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].timestamp, 20);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pose_chunk_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = DeviceLayout::new(temp_dir.path(), "device7");
        let name = ChunkName::new("ab12cd34", 0, 15_000, "json");

        let samples = vec![PoseSample {
            data: json!({"x": 1.5}),
            timestamp: 12,
        }];
        let path = write_pose_chunk(&layout, &name, &samples)?;

        assert!(path.ends_with("unprocessed_chunks/pose/chunk_ab12cd34_0_15000.json"));
        assert_eq!(read_pose_samples(&path)?, samples);
        Ok(())
    }
}

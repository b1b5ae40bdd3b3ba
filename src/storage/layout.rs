use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of stream captured from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Color,
    Depth,
    Pose,
}

impl StreamKind {
    /// Streams that go through an encoder process and the video pipeline
    pub const VIDEO: [StreamKind; 2] = [StreamKind::Color, StreamKind::Depth];

    pub const ALL: [StreamKind; 3] = [StreamKind::Color, StreamKind::Depth, StreamKind::Pose];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
            StreamKind::Pose => "pose",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "color" => Some(StreamKind::Color),
            "depth" => Some(StreamKind::Depth),
            "pose" => Some(StreamKind::Pose),
            _ => None,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk layout of one device's recordings
///
/// ```text
/// <root>/<device>/unprocessed_chunks/{color,depth,pose}/
/// <root>/<device>/processed_chunks/{color,depth}/
/// <root>/<device>/session_videos/{color,depth,pose}/
/// <root>/<device>/tmp/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    device_id: String,
    device_dir: PathBuf,
}

impl DeviceLayout {
    pub fn new(root: impl AsRef<Path>, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let device_dir = root.as_ref().join(&device_id);
        Self {
            device_id,
            device_dir,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    pub fn unprocessed_dir(&self, kind: StreamKind) -> PathBuf {
        self.device_dir.join("unprocessed_chunks").join(kind.as_str())
    }

    /// Processed chunks exist only for video streams; pose chunks are consumed raw
    pub fn processed_dir(&self, kind: StreamKind) -> PathBuf {
        self.device_dir.join("processed_chunks").join(kind.as_str())
    }

    pub fn session_dir(&self, kind: StreamKind) -> PathBuf {
        self.device_dir.join("session_videos").join(kind.as_str())
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.device_dir.join("tmp")
    }

    /// Create every directory of the layout
    pub fn ensure(&self) -> Result<()> {
        let mut dirs = vec![self.tmp_dir()];
        for kind in StreamKind::ALL {
            dirs.push(self.unprocessed_dir(kind));
            dirs.push(self.session_dir(kind));
        }
        for kind in StreamKind::VIDEO {
            dirs.push(self.processed_dir(kind));
        }

        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }

        Ok(())
    }
}

/// List the plain file names in `dir`, sorted
///
/// A missing directory yields an empty list; devices that never produced a
/// given stream simply have no directory for it.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {:?}", dir))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    names.sort();
    Ok(names)
}

/// List device directories directly under the output root, sorted
pub fn list_device_ids(root: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", root)),
    };

    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {:?}", root))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            devices.push(name.to_string());
        }
    }

    devices.sort();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = DeviceLayout::new("/data", "device7");
        assert_eq!(
            layout.unprocessed_dir(StreamKind::Color),
            PathBuf::from("/data/device7/unprocessed_chunks/color")
        );
        assert_eq!(
            layout.processed_dir(StreamKind::Depth),
            PathBuf::from("/data/device7/processed_chunks/depth")
        );
        assert_eq!(
            layout.session_dir(StreamKind::Pose),
            PathBuf::from("/data/device7/session_videos/pose")
        );
        assert_eq!(layout.tmp_dir(), PathBuf::from("/data/device7/tmp"));
    }

    #[test]
    fn test_listing_missing_dirs_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(list_file_names(&temp_dir.path().join("nope"))?.is_empty());
        assert!(list_device_ids(&temp_dir.path().join("nope"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_listing_skips_directories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = DeviceLayout::new(temp_dir.path(), "dev");
        layout.ensure()?;
        std::fs::write(temp_dir.path().join("index.json"), b"{}")?;

        assert_eq!(list_device_ids(temp_dir.path())?, vec!["dev".to_string()]);
        assert!(list_file_names(layout.device_dir())?.is_empty());
        Ok(())
    }
}

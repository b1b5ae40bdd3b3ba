use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::recording::{EncoderConfig, RecordingConfig};
use crate::storage::StorageConfig;
use crate::timeline::TimelineConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub recording: RecordingConfig,
    pub encoder: EncoderConfig,
    pub media: MediaConfig,
    pub timeline: TimelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "rgbd-recorder".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Post-processing and concatenation tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// ffmpeg-compatible program; empty copies and appends bytes instead
    pub program: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (extension optional, file optional) with `RGBD__` overrides,
    /// e.g. `RGBD__STORAGE__ROOT_PATH=/data/recordings`
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("RGBD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration {}", path))?;

        settings
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {}", path))
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.service.http.bind, self.service.http.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let cfg = Config::load(temp_dir.path().join("absent").to_str().unwrap_or_default())?;

        assert_eq!(cfg.recording.chunk_interval_ms, 15_000);
        assert_eq!(cfg.storage.index_file, "index.json");
        assert_eq!(cfg.storage.min_chunk_bytes, 1024);
        assert_eq!(cfg.timeline.max_zoom, 96.0);
        assert_eq!(cfg.timeline.max_speed, 64.0);
        assert_eq!(cfg.media.program, "ffmpeg");
        Ok(())
    }

    #[test]
    fn test_partial_file_overrides_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("recorder.toml");
        std::fs::write(
            &path,
            r#"
[service.http]
port = 9000

[storage]
root_path = "/data/recordings"

[recording]
chunk_interval_ms = 5000

[encoder]
program = ""
"#,
        )?;

        let cfg = Config::load(path.to_str().unwrap_or_default())?;

        assert_eq!(cfg.service.http.port, 9000);
        assert_eq!(cfg.service.http.bind, "127.0.0.1");
        assert_eq!(cfg.http_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.storage.root_path, std::path::PathBuf::from("/data/recordings"));
        assert_eq!(cfg.storage.index_file, "index.json");
        assert_eq!(cfg.recording.chunk_interval_ms, 5000);
        assert_eq!(cfg.recording.color_extension, "mp4");
        assert!(cfg.encoder.program.is_empty());
        assert!(!cfg.encoder.color_args.is_empty());
        Ok(())
    }
}

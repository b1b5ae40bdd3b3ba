//! Chunk storage, indexing and session assembly
//!
//! The directory tree under the output root is the only source of truth:
//! - `naming` / `layout`: filename grammar and per-device directories
//! - `index`: rebuilds the persistent index from filenames alone
//! - `process`: post-processes closed chunks
//! - `concat`: assembles complete sessions into finished files
//! - `pipeline`: runs all of the above for one or every device

pub mod concat;
pub mod index;
pub mod layout;
pub mod marker;
pub mod naming;
pub mod pipeline;
pub mod process;
pub mod tool;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use concat::{derive_time_bounds, ConcatOutcome, ConcatReport, DeferReason, SessionConcatenator};
pub use index::{FileIndexBuilder, PersistentIndex, SessionRecord};
pub use layout::{DeviceLayout, StreamKind};
pub use marker::CompletionMarker;
pub use pipeline::{StoragePipeline, SweepReport};
pub use process::ProcessReport;
pub use tool::{FfmpegTool, MediaTool, MediaToolFactory, PassthroughTool};

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output root holding one directory per device
    pub root_path: PathBuf,
    /// Name of the index cache file under the root
    pub index_file: String,
    /// Closed chunks smaller than this are treated as corrupt and left in place
    pub min_chunk_bytes: u64,
}

impl StorageConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("recordings"),
            index_file: "index.json".to_string(),
            min_chunk_bytes: 1024,
        }
    }
}

pub mod config;
pub mod http;
pub mod recording;
pub mod storage;
pub mod timeline;

pub use config::Config;
pub use http::{create_router, AppState};
pub use recording::{
    encoder_factory, DeviceRegistry, EncoderConfig, EncoderFactory, EncoderProcess, Frame,
    PoseSample, RecordingConfig, RecordingEvent, RecordingSession, SessionStats, StreamStatus,
};
pub use storage::{
    ConcatOutcome, ConcatReport, CompletionMarker, DeviceLayout, FileIndexBuilder, MediaTool,
    MediaToolFactory, PersistentIndex, SessionConcatenator, SessionRecord, StorageConfig,
    StoragePipeline, StreamKind,
};
pub use timeline::{
    load_tracks, PlaybackController, Segment, TimeRange, TimelineConfig, TimelineEvent,
    TimelineModel, TimelineWindow, Track,
};

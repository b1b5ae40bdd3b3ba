use crate::recording::DeviceRegistry;
use crate::storage::StoragePipeline;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Connected devices and their recording sessions
    pub registry: DeviceRegistry,

    /// Output root, post-processing and index
    pub pipeline: StoragePipeline,
}

impl AppState {
    pub fn new(registry: DeviceRegistry, pipeline: StoragePipeline) -> Self {
        Self { registry, pipeline }
    }
}

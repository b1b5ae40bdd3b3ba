//! HTTP API over the recording registry and the output root
//!
//! This module provides a thin REST adapter:
//! - GET /health - Health check
//! - GET /index - Rebuild and return the persistent index
//! - GET /devices - Status of every connected device
//! - GET /devices/:device/sessions/:session/pose - Finished pose record
//! - GET /devices/:device/sessions/:session/video/:kind - Finished color/depth video (range requests)
//! - POST /devices/:device/connect - Connect a device and start recording
//! - POST /devices/:device/start - Start a new session on a connected device
//! - POST /devices/:device/stop - Stop recording, keep the device connected
//! - POST /devices/:device/disconnect - Stop recording and forget the device

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;

use super::state::AppState;
use crate::recording::SessionStats;
use crate::storage::index::scan_device;
use crate::storage::{CompletionMarker, SessionRecord, StreamKind};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub device_id: String,
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub device_id: String,
    pub status: String,
    /// Marker of the session that was ended, if one was recording
    pub completion: Option<CompletionMarker>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Path parameters end up as directory names under the output root
fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

fn find_session(state: &AppState, device_id: &str, session_id: &str) -> Result<SessionRecord, Response> {
    if !is_safe_component(device_id) || !is_safe_component(session_id) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Invalid device or session ID".to_string(),
        ));
    }

    let sessions = scan_device(&state.pipeline.layout(device_id)).map_err(|e| {
        error!("Failed to scan device {}: {:#}", device_id, e);
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to scan device {}: {}", device_id, e),
        )
    })?;

    sessions.get(session_id).cloned().ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("Session {} of device {} not found", session_id, device_id),
        )
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /index
/// Rebuild the index from the directory tree and return it
pub async fn get_index(State(state): State<AppState>) -> Response {
    match state.pipeline.rebuild_index() {
        Ok(index) => (StatusCode::OK, Json(index)).into_response(),
        Err(e) => {
            error!("Failed to rebuild index: {:#}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to rebuild index: {}", e),
            )
        }
    }
}

/// GET /devices/:device_id/sessions/:session_id/pose
/// Finished pose record of a session
pub async fn get_session_pose(
    State(state): State<AppState>,
    Path((device_id, session_id)): Path<(String, String)>,
) -> Response {
    let record = match find_session(&state, &device_id, &session_id) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Some(file) = record.finished(StreamKind::Pose) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Session {} has no finished pose record", session_id),
        );
    };

    let path = state
        .pipeline
        .layout(&device_id)
        .session_dir(StreamKind::Pose)
        .join(file);
    match crate::recording::pose::read_pose_samples(&path) {
        Ok(samples) => (StatusCode::OK, Json(samples)).into_response(),
        Err(e) => {
            error!("Failed to read pose record {:?}: {:#}", path, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read pose record: {}", e),
            )
        }
    }
}

/// GET /devices/:device_id/sessions/:session_id/video/:kind
/// Finished color or depth video, with byte-range support for seeking
pub async fn get_session_video(
    State(state): State<AppState>,
    Path((device_id, session_id, kind)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    let kind = match StreamKind::parse(&kind) {
        Some(kind @ (StreamKind::Color | StreamKind::Depth)) => kind,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Unknown video kind {}", kind),
            )
        }
    };

    let record = match find_session(&state, &device_id, &session_id) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Some(file) = record.finished(kind) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Session {} has no finished {} video", session_id, kind),
        );
    };

    let path = state.pipeline.layout(&device_id).session_dir(kind).join(file);
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// GET /devices
/// Status of every connected device
pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<SessionStats>> {
    Json(state.registry.stats().await)
}

/// POST /devices/:device_id/connect
/// Connect a device and start its first session
pub async fn connect_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    if !is_safe_component(&device_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid device ID".to_string());
    }

    if state.registry.get(&device_id).await.is_some() {
        return error_response(
            StatusCode::CONFLICT,
            format!("Device {} is already connected", device_id),
        );
    }

    match state.registry.connect(&device_id).await {
        Ok(session_id) => {
            info!("Device {} recording session {}", device_id, session_id);
            (
                StatusCode::OK,
                Json(ConnectResponse {
                    device_id,
                    session_id,
                    status: "recording".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to connect device {}: {:#}", device_id, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to connect device: {}", e),
            )
        }
    }
}

/// POST /devices/:device_id/start
/// Start a new session on a connected device
pub async fn start_recording(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    if state.registry.get(&device_id).await.is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Device {} not connected", device_id),
        );
    }

    match state.registry.start_recording(&device_id).await {
        Ok(session_id) => (
            StatusCode::OK,
            Json(ConnectResponse {
                device_id,
                session_id,
                status: "recording".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start recording on {}: {:#}", device_id, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start recording: {}", e),
            )
        }
    }
}

/// POST /devices/:device_id/stop
/// Stop recording; the device stays connected
pub async fn stop_recording(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    if state.registry.get(&device_id).await.is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Device {} not connected", device_id),
        );
    }

    match state.registry.stop_recording(&device_id).await {
        Ok(completion) => (
            StatusCode::OK,
            Json(StopResponse {
                device_id,
                status: "stopped".to_string(),
                completion,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop recording on {}: {:#}", device_id, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stop recording: {}", e),
            )
        }
    }
}

/// POST /devices/:device_id/disconnect
/// Stop recording and forget the device
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    if state.registry.get(&device_id).await.is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Device {} not connected", device_id),
        );
    }

    match state.registry.disconnect(&device_id).await {
        Ok(completion) => (
            StatusCode::OK,
            Json(StopResponse {
                device_id,
                status: "disconnected".to_string(),
                completion,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to disconnect {}: {:#}", device_id, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to disconnect device: {}", e),
            )
        }
    }
}

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Discovery
        .route("/index", get(handlers::get_index))
        .route(
            "/devices/:device_id/sessions/:session_id/pose",
            get(handlers::get_session_pose),
        )
        .route(
            "/devices/:device_id/sessions/:session_id/video/:kind",
            get(handlers::get_session_video),
        )
        // Device control
        .route("/devices", get(handlers::list_devices))
        .route("/devices/:device_id/connect", post(handlers::connect_device))
        .route("/devices/:device_id/start", post(handlers::start_recording))
        .route("/devices/:device_id/stop", post(handlers::stop_recording))
        .route(
            "/devices/:device_id/disconnect",
            post(handlers::disconnect_device),
        )
        // Players load finished videos cross-origin
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

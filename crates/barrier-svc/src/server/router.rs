//! Axum router construction.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer};

use super::{handlers, middleware, state::AppState};

/// Build the admin [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/barrier/rotate/root", post(handlers::rotate_root))
        .route("/barrier/rotate/intermediate", post(handlers::rotate_intermediate))
        .route("/barrier/rotate/content", post(handlers::rotate_content))
        .route("/barrier/keys/status", get(handlers::keys_status))
        .route("/barrier/keys/content", get(handlers::content_keys))
        .route("/barrier/rotations", get(handlers::rotations))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .layer(middleware::trace_layer())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}

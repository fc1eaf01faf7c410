//! Axum middleware layers applied to the router.
//!
//! Request tracing and the per-request timeout. Compression is added in
//! [`super::router`].

use std::time::Duration;

use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Per-request timeout. Rotations wait on the key pool, whose own bound
/// is a few seconds.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response tracing at `info`, without headers (admin tokens may
/// travel in them).
pub fn trace_layer(
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse>
{
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO).include_headers(false))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
}

//! Axum admin server, routing, and middleware.
//!
//! # Responsibilities
//! - Define the Axum router with the rotation, status and health routes.
//! - Map barrier errors onto HTTP status codes and JSON error bodies.
//! - Inject shared application state (`AppState`) into handlers.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

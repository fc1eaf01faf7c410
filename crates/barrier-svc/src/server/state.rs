//! Shared application state injected into every Axum handler.

use barrier::{Barrier, RotationCoordinator};

/// Application state shared across all request handlers.
///
/// Both fields are `Arc`-backed handles, so Axum's per-request clone is cheap.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Data-path handle, used for readiness.
    pub barrier: Barrier,
    /// Rotation and status operations.
    pub rotation: RotationCoordinator,
}

impl AppState {
    pub fn new(barrier: Barrier) -> Self {
        Self {
            rotation: RotationCoordinator::new(barrier.clone()),
            barrier,
        }
    }
}

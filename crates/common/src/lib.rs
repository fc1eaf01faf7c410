//! Common types, protocol definitions, and errors shared across the barrier crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;

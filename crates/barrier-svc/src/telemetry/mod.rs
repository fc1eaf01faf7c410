//! Structured logging and OpenTelemetry export.
//!
//! Logs are always written as JSON to stdout. Spans and the key pool's
//! counters are exported over OTLP only when `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set.
//!
//! # Telemetry invariants
//!
//! - **No key material or plaintext** may appear in any span attribute,
//!   metric label or log field. Key ids are fine.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};

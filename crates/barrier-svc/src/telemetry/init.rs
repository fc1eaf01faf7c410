//! Tracing subscriber and optional OTLP export.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, runtime, Resource};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Providers that must be flushed before exit. Returned by
/// [`init_telemetry`] and consumed by [`shutdown_telemetry`].
#[derive(Debug, Default)]
#[must_use = "pass to shutdown_telemetry so buffered metrics are exported"]
pub struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
}

/// Initialise the global tracing subscriber and, when `otlp_endpoint` is set,
/// the OTEL trace and metrics pipelines.
///
/// Configures:
/// - A JSON-formatted [`tracing_subscriber`] layer for structured log output.
/// - A [`tracing_opentelemetry`] layer exporting spans over OTLP/gRPC.
/// - An OTLP meter provider installed globally, so the key pool counters
///   are exported.
///
/// # Errors
///
/// Returns an error if an OTLP pipeline cannot be built or a global
/// subscriber is already installed.
pub fn init_telemetry(otlp_endpoint: Option<&str>, log_level: &str) -> Result<TelemetryGuard> {
    let mut guard = TelemetryGuard::default();
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::Config::default().with_resource(service_resource()),
                )
                .install_batch(runtime::Tokio)
                .context("failed to install OTLP tracing pipeline")?;

            let meter_provider = opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_resource(service_resource())
                .build()
                .context("failed to install OTLP metrics pipeline")?;
            opentelemetry::global::set_meter_provider(meter_provider.clone());
            guard.meter_provider = Some(meter_provider);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(otel_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(guard)
}

/// Flush and stop the meter provider, then the global tracer provider.
pub fn shutdown_telemetry(guard: TelemetryGuard) {
    if let Some(provider) = guard.meter_provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "failed to flush OTLP metrics");
        }
    }
    opentelemetry::global::shutdown_tracer_provider();
}

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            "barrier-svc",
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}

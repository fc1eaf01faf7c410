//! `barrier-svc`: admin binary for the envelope-encryption barrier.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (JSON logs, optional OTLP).
//! 3. Derive the unseal key from the configured secret provider.
//! 4. Open the key store and start the key material pool.
//! 5. Open the barrier (load or create the key hierarchy).
//! 6. Build the Axum router and serve until SIGINT/SIGTERM.
//! 7. Close the barrier and flush telemetry.

mod config;
mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use barrier::{Barrier, KeyPool, KeyStore, MemoryKeyStore, SqliteKeyStore, UnsealKey};
use tokio::signal;
use tracing::{info, warn};

use config::{Config, IN_MEMORY_DATABASE};
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let telemetry_guard =
        telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        admin_port = cfg.admin_port,
        otlp = cfg.otel_exporter_otlp_endpoint.is_some(),
        "barrier-svc starting"
    );

    // -----------------------------------------------------------------------
    // 3. Unseal key
    // -----------------------------------------------------------------------
    let unseal = UnsealKey::from_provider(cfg.secret_provider().as_ref())
        .context("failed to derive unseal key")?;
    info!(unseal_key_id = %unseal.id(), "unseal key derived");

    // -----------------------------------------------------------------------
    // 4. Key store and pool
    // -----------------------------------------------------------------------
    let store: Arc<dyn KeyStore> = if cfg.database_path == IN_MEMORY_DATABASE {
        warn!("using in-memory key store; keys will not survive a restart");
        Arc::new(MemoryKeyStore::new())
    } else {
        Arc::new(
            SqliteKeyStore::open(&cfg.database_path)
                .with_context(|| format!("failed to open key store at {}", cfg.database_path))?,
        )
    };
    let pool = KeyPool::start(cfg.pool_config()?).context("failed to start key material pool")?;

    // -----------------------------------------------------------------------
    // 5. Barrier
    // -----------------------------------------------------------------------
    let barrier = Barrier::open(store, pool, unseal)
        .await
        .context("failed to open barrier")?;

    // -----------------------------------------------------------------------
    // 6. HTTP server
    // -----------------------------------------------------------------------
    let router = server::router::build(AppState::new(barrier.clone()));
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.admin_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    // -----------------------------------------------------------------------
    // 7. Shutdown
    // -----------------------------------------------------------------------
    barrier.shutdown().await;
    info!("barrier-svc stopped");
    telemetry::shutdown_telemetry(telemetry_guard);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

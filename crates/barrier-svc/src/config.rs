//! Configuration loading and validation for the barrier service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use barrier::{
    EnvSecretProvider, FileSecretProvider, KeyAlgorithm, PoolConfig, UnsealSecretProvider,
    BARRIER_KEY_ALGORITHM,
};
use serde::Deserialize;

/// Database path that selects an in-memory key store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Validated barrier service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name of the environment variable holding the base64 unseal secret.
    #[serde(default = "default_unseal_secret_env")]
    pub unseal_secret_env: String,

    /// File holding the raw unseal secret. Takes precedence over
    /// `UNSEAL_SECRET_ENV` when set.
    #[serde(default)]
    pub unseal_secret_file: Option<String>,

    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Port the admin API listens on.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Buffered items kept ready per pooled algorithm.
    #[serde(default = "default_pool_target_size")]
    pub pool_target_size: usize,

    /// Background generator tasks per pooled algorithm.
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,

    /// Longest a caller waits on an empty pool buffer.
    #[serde(default = "default_pool_get_timeout_ms")]
    pub pool_get_timeout_ms: u64,

    #[serde(default = "default_pool_retry_initial_ms")]
    pub pool_retry_initial_ms: u64,

    #[serde(default = "default_pool_retry_max_ms")]
    pub pool_retry_max_ms: u64,

    /// Comma-separated algorithm names, e.g. `aes256,ed25519`.
    #[serde(default = "default_pool_algorithms")]
    pub pool_algorithms: String,

    /// OTLP collector endpoint. Export is disabled when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_unseal_secret_env() -> String {
    "BARRIER_UNSEAL_SECRET".into()
}
fn default_database_path() -> String {
    "barrier.db".into()
}
fn default_admin_port() -> u16 {
    9090
}
fn default_pool_target_size() -> usize {
    4
}
fn default_pool_workers() -> usize {
    2
}
fn default_pool_get_timeout_ms() -> u64 {
    5000
}
fn default_pool_retry_initial_ms() -> u64 {
    100
}
fn default_pool_retry_max_ms() -> u64 {
    5000
}
fn default_pool_algorithms() -> String {
    "aes256,hmac256,ec-p256,ed25519".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unseal_secret_env: default_unseal_secret_env(),
            unseal_secret_file: None,
            database_path: default_database_path(),
            admin_port: default_admin_port(),
            pool_target_size: default_pool_target_size(),
            pool_workers: default_pool_workers(),
            pool_get_timeout_ms: default_pool_get_timeout_ms(),
            pool_retry_initial_ms: default_pool_retry_initial_ms(),
            pool_retry_max_ms: default_pool_retry_max_ms(),
            pool_algorithms: default_pool_algorithms(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.database_path, "DATABASE_PATH")?;
        if self.unseal_secret_file.is_none() {
            ensure_non_empty(&self.unseal_secret_env, "UNSEAL_SECRET_ENV")?;
        }
        if let Some(path) = &self.unseal_secret_file {
            ensure_non_empty(path, "UNSEAL_SECRET_FILE")?;
        }
        if self.admin_port == 0 {
            anyhow::bail!("ADMIN_PORT must be > 0");
        }
        // Remaining pool checks live with the pool itself.
        self.pool_config()?
            .validate()
            .context("invalid POOL_* configuration")?;
        Ok(())
    }

    /// Parsed `POOL_ALGORITHMS`, which must include the barrier's own key
    /// algorithm.
    pub fn algorithms(&self) -> Result<Vec<KeyAlgorithm>> {
        let mut algorithms = Vec::new();
        for name in self.pool_algorithms.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let alg: KeyAlgorithm = name
                .parse()
                .with_context(|| format!("POOL_ALGORITHMS contains {name:?}"))?;
            if !algorithms.contains(&alg) {
                algorithms.push(alg);
            }
        }
        if !algorithms.contains(&BARRIER_KEY_ALGORITHM) {
            anyhow::bail!("POOL_ALGORITHMS must include {BARRIER_KEY_ALGORITHM}");
        }
        Ok(algorithms)
    }

    /// Key material pool settings.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        Ok(PoolConfig {
            algorithms: self.algorithms()?,
            target_size: self.pool_target_size,
            workers_per_algorithm: self.pool_workers,
            get_timeout: Duration::from_millis(self.pool_get_timeout_ms),
            retry_initial: Duration::from_millis(self.pool_retry_initial_ms),
            retry_max: Duration::from_millis(self.pool_retry_max_ms),
            // The barrier mints keys for the life of the process.
            max_lifetime_values: None,
            max_lifetime_duration: None,
        })
    }

    /// Where the unseal secret comes from: the file if configured, otherwise
    /// the environment variable.
    pub fn secret_provider(&self) -> Box<dyn UnsealSecretProvider> {
        match &self.unseal_secret_file {
            Some(path) => Box::new(FileSecretProvider::new(path)),
            None => Box::new(EnvSecretProvider::new(&self.unseal_secret_env)),
        }
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

//! Key material pool: background-replenished buffers of fresh key material.
//!
//! # Design
//!
//! Each configured [`KeyAlgorithm`] owns a bounded `mpsc` buffer whose capacity
//! is the target size. A fixed set of worker tasks per algorithm keeps the
//! buffer full; callers of [`KeyPool::get`] only wait when the buffer is empty,
//! and then only up to the configured bound before failing with
//! [`PoolError::Exhausted`].
//!
//! Generation runs on the blocking thread pool; RSA-4096 can take seconds.
//!
//! # Lifetime limits
//!
//! A pool may be finite: with [`PoolConfig::max_lifetime_values`] or
//! [`PoolConfig::max_lifetime_duration`] set, a buffer's workers stop once
//! that many items have been claimed for generation or the duration has
//! elapsed since start. Already-buffered items are still handed out; after
//! that, [`KeyPool::get`] fails with [`PoolError::LifetimeReached`].
//!
//! # Shutdown
//!
//! [`KeyPool::shutdown`] raises a cancellation signal, joins every worker and
//! discards whatever is still buffered.

mod worker;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use opentelemetry::{global, metrics::Counter, KeyValue};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::material::{KeyAlgorithm, KeyMaterial, MaterialGenerator, SystemGenerator};
use worker::{Backoff, Limits};

/// Errors returned to pool consumers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No material became available within the configured wait bound.
    #[error("key material pool exhausted for {algorithm} after {waited_ms} ms")]
    Exhausted {
        algorithm: KeyAlgorithm,
        waited_ms: u64,
    },

    /// The pool was not configured to buffer this algorithm.
    #[error("key material pool does not serve {0}")]
    UnsupportedAlgorithm(KeyAlgorithm),

    /// The pool has been shut down.
    #[error("key material pool is shut down")]
    Closed,

    /// The buffer reached its value or time limit and has been drained.
    #[error("key material pool for {0} reached its lifetime limit")]
    LifetimeReached(KeyAlgorithm),

    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Sizing and timing parameters for a [`KeyPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Algorithms to keep buffered.
    pub algorithms: Vec<KeyAlgorithm>,
    /// Number of items each buffer is kept at.
    pub target_size: usize,
    /// Replenishment tasks per algorithm.
    pub workers_per_algorithm: usize,
    /// Upper bound on how long [`KeyPool::get`] waits on an empty buffer.
    pub get_timeout: Duration,
    /// First retry delay after a failed generation.
    pub retry_initial: Duration,
    /// Retry delay ceiling.
    pub retry_max: Duration,
    /// Stop generating for an algorithm after this many items. `None` is
    /// unlimited.
    pub max_lifetime_values: Option<u64>,
    /// Stop generating this long after start. `None` is unlimited.
    pub max_lifetime_duration: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![KeyAlgorithm::Aes256],
            target_size: 4,
            workers_per_algorithm: 2,
            get_timeout: Duration::from_secs(5),
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_secs(5),
            max_lifetime_values: None,
            max_lifetime_duration: None,
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.algorithms.is_empty() {
            return Err(PoolError::InvalidConfig(
                "at least one algorithm must be configured".into(),
            ));
        }
        if self.target_size == 0 {
            return Err(PoolError::InvalidConfig("target_size must be > 0".into()));
        }
        if self.workers_per_algorithm == 0 {
            return Err(PoolError::InvalidConfig(
                "workers_per_algorithm must be > 0".into(),
            ));
        }
        if self.workers_per_algorithm > self.target_size {
            return Err(PoolError::InvalidConfig(
                "workers_per_algorithm must be <= target_size".into(),
            ));
        }
        if let Some(max) = self.max_lifetime_values {
            if (self.target_size as u64) > max {
                return Err(PoolError::InvalidConfig(
                    "target_size must be <= max_lifetime_values".into(),
                ));
            }
        }
        if self.max_lifetime_duration.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::InvalidConfig(
                "max_lifetime_duration must be > 0".into(),
            ));
        }
        if self.get_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("get_timeout must be > 0".into()));
        }
        if self.retry_initial.is_zero() || self.retry_initial > self.retry_max {
            return Err(PoolError::InvalidConfig(
                "retry_initial must be > 0 and <= retry_max".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters for one algorithm buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub algorithm: KeyAlgorithm,
    pub buffered: usize,
    pub generated: u64,
    pub handed_out: u64,
    pub failures: u64,
}

/// Shared counters between a buffer and its workers.
pub(crate) struct BufferCounters {
    /// Generation slots claimed by workers, checked against the value limit.
    claimed: AtomicU64,
    buffered: AtomicUsize,
    generated: AtomicU64,
    handed_out: AtomicU64,
    failures: AtomicU64,
    generated_metric: Counter<u64>,
}

impl BufferCounters {
    fn record_generated(&self, algorithm: KeyAlgorithm) {
        self.generated_metric
            .add(1, &[KeyValue::new("algorithm", algorithm.as_str())]);
    }
}

struct Buffer {
    rx: AsyncMutex<mpsc::Receiver<KeyMaterial>>,
    counters: Arc<BufferCounters>,
}

struct PoolInner {
    buffers: HashMap<KeyAlgorithm, Buffer>,
    get_timeout: Duration,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole shutdown so a concurrent caller returns only once
    /// the workers are joined and the buffers drained.
    shutdown_lock: AsyncMutex<()>,
    handed_out_metric: Counter<u64>,
}

/// Handle to a running key material pool. Cheap to clone.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("algorithms", &self.algorithms())
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl KeyPool {
    /// Start a pool backed by the OS CSPRNG.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: PoolConfig) -> Result<Self, PoolError> {
        Self::start_with_generator(config, Arc::new(SystemGenerator))
    }

    /// Start a pool using a custom [`MaterialGenerator`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with_generator(
        config: PoolConfig,
        generator: Arc<dyn MaterialGenerator>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let meter = global::meter("barrier.pool");
        let generated_metric = meter
            .u64_counter("barrier.pool.generated")
            .with_description("Key material items generated by pool workers")
            .init();
        let handed_out_metric = meter
            .u64_counter("barrier.pool.handed_out")
            .with_description("Key material items handed to callers")
            .init();

        let cancel = CancellationToken::new();
        let backoff = Backoff {
            initial: config.retry_initial,
            max: config.retry_max,
        };
        let limits = Limits {
            max_values: config.max_lifetime_values,
            deadline: config
                .max_lifetime_duration
                .map(|d| tokio::time::Instant::now() + d),
        };

        let mut buffers = HashMap::new();
        let mut workers = Vec::new();
        for &algorithm in &config.algorithms {
            if buffers.contains_key(&algorithm) {
                continue;
            }
            let (tx, rx) = mpsc::channel(config.target_size);
            let counters = Arc::new(BufferCounters {
                claimed: AtomicU64::new(0),
                buffered: AtomicUsize::new(0),
                generated: AtomicU64::new(0),
                handed_out: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                generated_metric: generated_metric.clone(),
            });

            for n in 0..config.workers_per_algorithm {
                workers.push(tokio::spawn(worker::replenish(
                    n,
                    algorithm,
                    tx.clone(),
                    Arc::clone(&generator),
                    Arc::clone(&counters),
                    backoff,
                    limits,
                    cancel.clone(),
                )));
            }

            buffers.insert(
                algorithm,
                Buffer {
                    rx: AsyncMutex::new(rx),
                    counters,
                },
            );
        }

        info!(
            algorithms = ?config.algorithms,
            target_size = config.target_size,
            workers_per_algorithm = config.workers_per_algorithm,
            max_lifetime_values = ?config.max_lifetime_values,
            max_lifetime_ms = ?config.max_lifetime_duration.map(|d| d.as_millis() as u64),
            "key material pool started"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                buffers,
                get_timeout: config.get_timeout,
                cancel,
                workers: Mutex::new(workers),
                shutdown_lock: AsyncMutex::new(()),
                handed_out_metric,
            }),
        })
    }

    /// Algorithms this pool serves, in a stable order.
    pub fn algorithms(&self) -> Vec<KeyAlgorithm> {
        let mut algs: Vec<_> = self.inner.buffers.keys().copied().collect();
        algs.sort();
        algs
    }

    /// Take one item of key material, waiting up to the configured bound if
    /// the buffer is empty.
    ///
    /// # Errors
    ///
    /// - [`PoolError::UnsupportedAlgorithm`] if `algorithm` is not configured.
    /// - [`PoolError::Exhausted`] if nothing was generated within the bound.
    /// - [`PoolError::Closed`] after [`KeyPool::shutdown`].
    pub async fn get(&self, algorithm: KeyAlgorithm) -> Result<KeyMaterial, PoolError> {
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let buffer = self
            .inner
            .buffers
            .get(&algorithm)
            .ok_or(PoolError::UnsupportedAlgorithm(algorithm))?;

        let started = Instant::now();
        let received = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(PoolError::Closed),
            received = tokio::time::timeout(self.inner.get_timeout, async {
                let mut rx = buffer.rx.lock().await;
                rx.recv().await
            }) => received,
        };

        match received {
            Ok(Some(material)) => {
                buffer.counters.buffered.fetch_sub(1, Ordering::AcqRel);
                buffer.counters.handed_out.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .handed_out_metric
                    .add(1, &[KeyValue::new("algorithm", algorithm.as_str())]);
                Ok(material)
            }
            // Every sender is gone: either shut down or the workers hit a limit.
            Ok(None) if self.inner.cancel.is_cancelled() => Err(PoolError::Closed),
            Ok(None) => Err(PoolError::LifetimeReached(algorithm)),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(%algorithm, waited_ms, "key material pool exhausted");
                Err(PoolError::Exhausted {
                    algorithm,
                    waited_ms,
                })
            }
        }
    }

    /// Take `n` items of key material.
    ///
    /// Returns an empty vector for `n == 0`; otherwise either exactly `n`
    /// items or the first error encountered.
    pub async fn get_many(
        &self,
        algorithm: KeyAlgorithm,
        n: usize,
    ) -> Result<Vec<KeyMaterial>, PoolError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.get(algorithm).await?);
        }
        Ok(out)
    }

    /// Snapshot of every buffer's counters, ordered by algorithm.
    pub fn stats(&self) -> Vec<PoolStats> {
        let by_alg: BTreeMap<_, _> = self
            .inner
            .buffers
            .iter()
            .map(|(alg, buf)| {
                let c = &buf.counters;
                (
                    *alg,
                    PoolStats {
                        algorithm: *alg,
                        buffered: c.buffered.load(Ordering::Acquire),
                        generated: c.generated.load(Ordering::Relaxed),
                        handed_out: c.handed_out.load(Ordering::Relaxed),
                        failures: c.failures.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        by_alg.into_values().collect()
    }

    /// Whether [`KeyPool::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop all workers, wait for them to exit, and discard buffered material.
    ///
    /// Idempotent. A call made while another is in progress waits for it to
    /// finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let _shutting_down = self.inner.shutdown_lock.lock().await;

        let handles = {
            let mut guard = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "pool worker did not exit cleanly");
            }
        }

        for buffer in self.inner.buffers.values() {
            let mut rx = buffer.rx.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {}
            buffer.counters.buffered.store(0, Ordering::Release);
        }

        info!("key material pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{KeygenError, SecretBytes};
    use std::sync::atomic::AtomicUsize;

    fn fast_config(algorithms: Vec<KeyAlgorithm>) -> PoolConfig {
        PoolConfig {
            algorithms,
            target_size: 3,
            workers_per_algorithm: 2,
            get_timeout: Duration::from_secs(2),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            max_lifetime_values: None,
            max_lifetime_duration: None,
        }
    }

    /// Fails the first `failures` calls, then returns fixed-size zero keys.
    struct FlakyGenerator {
        failures: usize,
        calls: AtomicUsize,
    }

    impl MaterialGenerator for FlakyGenerator {
        fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyMaterial, KeygenError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(KeygenError::Failed {
                    algorithm,
                    reason: format!("injected failure {call}"),
                });
            }
            Ok(KeyMaterial::symmetric(
                algorithm,
                SecretBytes::new(vec![0u8; 32]),
            ))
        }
    }

    struct BrokenGenerator;

    impl MaterialGenerator for BrokenGenerator {
        fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyMaterial, KeygenError> {
            Err(KeygenError::Failed {
                algorithm,
                reason: "entropy source offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn get_returns_requested_algorithm() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes256, KeyAlgorithm::Ed25519]))
            .unwrap();
        let aes = pool.get(KeyAlgorithm::Aes256).await.unwrap();
        assert_eq!(aes.algorithm(), KeyAlgorithm::Aes256);
        assert_eq!(aes.secret().len(), 32);

        let ed = pool.get(KeyAlgorithm::Ed25519).await.unwrap();
        assert!(ed.public().is_some());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unconfigured_algorithm_is_unsupported() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes256])).unwrap();
        let err = pool.get(KeyAlgorithm::Rsa4096).await.unwrap_err();
        assert!(matches!(err, PoolError::UnsupportedAlgorithm(KeyAlgorithm::Rsa4096)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn get_many_returns_distinct_items() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes128])).unwrap();
        let keys = pool.get_many(KeyAlgorithm::Aes128, 5).await.unwrap();
        assert_eq!(keys.len(), 5);
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a.secret(), b.secret());
            }
        }
        assert!(pool.get_many(KeyAlgorithm::Aes128, 0).await.unwrap().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_generation_is_retried() {
        let generator = Arc::new(FlakyGenerator {
            failures: 3,
            calls: AtomicUsize::new(0),
        });
        let mut config = fast_config(vec![KeyAlgorithm::Aes256]);
        config.workers_per_algorithm = 1;
        let pool = KeyPool::start_with_generator(config, generator.clone()).unwrap();

        let material = pool.get(KeyAlgorithm::Aes256).await.unwrap();
        assert_eq!(material.secret().len(), 32);
        assert!(generator.calls.load(Ordering::SeqCst) >= 4);

        let stats = pool.stats();
        assert_eq!(stats[0].failures, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_failure_times_out_as_exhausted() {
        let mut config = fast_config(vec![KeyAlgorithm::Aes256]);
        config.get_timeout = Duration::from_millis(50);
        let pool = KeyPool::start_with_generator(config, Arc::new(BrokenGenerator)).unwrap();

        let err = pool.get(KeyAlgorithm::Aes256).await.unwrap_err();
        match err {
            PoolError::Exhausted {
                algorithm,
                waited_ms,
            } => {
                assert_eq!(algorithm, KeyAlgorithm::Aes256);
                assert!(waited_ms >= 50);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn buffer_refills_to_target() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes256])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = pool.stats();
            if stats[0].buffered == 3 {
                break;
            }
            assert!(Instant::now() < deadline, "buffer never reached target: {stats:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.get(KeyAlgorithm::Aes256).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats()[0].generated < 4 {
            assert!(Instant::now() < deadline, "replacement was never generated");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats()[0].handed_out, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes256])).unwrap();
        pool.shutdown().await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get(KeyAlgorithm::Aes256).await,
            Err(PoolError::Closed)
        ));
        assert_eq!(pool.stats()[0].buffered, 0);
        // Second shutdown is a no-op.
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_shutdown_waits_for_the_first() {
        let pool = KeyPool::start(fast_config(vec![KeyAlgorithm::Aes256])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats()[0].buffered < 3 {
            assert!(Instant::now() < deadline, "buffer never filled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.shutdown().await }
        });
        while !pool.is_closed() {
            tokio::task::yield_now().await;
        }
        pool.shutdown().await;
        assert_eq!(pool.stats()[0].buffered, 0);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn value_limit_stops_generation_after_buffer_drains() {
        let mut config = fast_config(vec![KeyAlgorithm::Aes256]);
        config.max_lifetime_values = Some(4);
        let pool = KeyPool::start(config).unwrap();

        let keys = pool.get_many(KeyAlgorithm::Aes256, 4).await.unwrap();
        assert_eq!(keys.len(), 4);
        let err = pool.get(KeyAlgorithm::Aes256).await.unwrap_err();
        assert!(matches!(err, PoolError::LifetimeReached(KeyAlgorithm::Aes256)), "{err:?}");
        assert_eq!(pool.stats()[0].generated, 4);
        assert!(!pool.is_closed());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn time_limit_stops_generation() {
        let mut config = fast_config(vec![KeyAlgorithm::Aes256]);
        config.max_lifetime_duration = Some(Duration::from_millis(100));
        let pool = KeyPool::start(config).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let generated = pool.stats()[0].generated;
        for _ in 0..generated {
            pool.get(KeyAlgorithm::Aes256).await.unwrap();
        }
        let err = pool.get(KeyAlgorithm::Aes256).await.unwrap_err();
        assert!(matches!(err, PoolError::LifetimeReached(KeyAlgorithm::Aes256)), "{err:?}");
        assert_eq!(pool.stats()[0].generated, generated);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        let mut config = fast_config(vec![]);
        assert!(matches!(
            KeyPool::start(config.clone()),
            Err(PoolError::InvalidConfig(_))
        ));
        config.algorithms = vec![KeyAlgorithm::Aes256];
        config.target_size = 0;
        assert!(KeyPool::start(config.clone()).is_err());
        config.target_size = 1;
        assert!(KeyPool::start(config.clone()).is_err(), "more workers than slots");
        config.target_size = 3;
        config.max_lifetime_values = Some(2);
        assert!(KeyPool::start(config.clone()).is_err(), "limit below target");
        config.max_lifetime_values = None;
        config.max_lifetime_duration = Some(Duration::ZERO);
        assert!(KeyPool::start(config.clone()).is_err());
        config.max_lifetime_duration = None;
        config.retry_initial = Duration::from_secs(10);
        assert!(KeyPool::start(config).is_err());
    }
}

//! Background replenishment task for one algorithm buffer.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BufferCounters;
use crate::material::{KeyAlgorithm, KeyMaterial, MaterialGenerator};

/// Exponential backoff bounds applied after a failed generation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Lifetime limits shared by every worker of one buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_values: Option<u64>,
    pub deadline: Option<Instant>,
}

impl Limits {
    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn time_reached(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Keep `tx` topped up until cancelled or a lifetime limit is reached.
///
/// A slot is reserved before generating, so a worker only spends CPU while the
/// buffer is below its target size and parks on `reserve` otherwise.
pub(crate) async fn replenish(
    worker: usize,
    algorithm: KeyAlgorithm,
    tx: mpsc::Sender<KeyMaterial>,
    generator: Arc<dyn MaterialGenerator>,
    counters: Arc<BufferCounters>,
    backoff: Backoff,
    limits: Limits,
    cancel: CancellationToken,
) {
    debug!(%algorithm, worker, "pool worker started");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = limits.expired() => {
                info!(%algorithm, worker, "pool time limit reached; worker done");
                break;
            }
            reserved = tx.reserve() => match reserved {
                Ok(permit) => permit,
                // Receiver dropped: the pool is gone.
                Err(_) => break,
            },
        };

        if limits.time_reached() {
            info!(%algorithm, worker, "pool time limit reached; worker done");
            break;
        }
        let claimed = counters.claimed.fetch_add(1, Ordering::AcqRel) + 1;
        if limits.max_values.is_some_and(|max| claimed > max) {
            info!(%algorithm, worker, "pool generate limit reached; worker done");
            break;
        }

        let mut delay = backoff.initial;
        let material = loop {
            let gen = Arc::clone(&generator);
            let job = tokio::task::spawn_blocking(move || gen.generate(algorithm));

            let joined = tokio::select! {
                // The blocking job keeps running to completion; its result is discarded.
                _ = cancel.cancelled() => {
                    debug!(%algorithm, worker, "pool worker cancelled during generation");
                    return;
                }
                joined = job => joined,
            };

            match joined {
                Ok(Ok(material)) => break material,
                Ok(Err(e)) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%algorithm, worker, error = %e, retry_in_ms = delay.as_millis() as u64, "key generation failed; retrying");
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%algorithm, worker, error = %e, retry_in_ms = delay.as_millis() as u64, "key generation task aborted; retrying");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = backoff.next(delay);
        };

        // Count before publishing so a consumer never decrements first.
        counters.buffered.fetch_add(1, Ordering::AcqRel);
        permit.send(material);
        counters.generated.fetch_add(1, Ordering::Relaxed);
        counters.record_generated(algorithm);
    }

    debug!(%algorithm, worker, "pool worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        let d1 = backoff.next(backoff.initial);
        let d2 = backoff.next(d1);
        let d3 = backoff.next(d2);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(350));
        assert_eq!(d3, Duration::from_millis(350));
    }
}

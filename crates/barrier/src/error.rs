//! Barrier error type and its mapping onto [`common::ServiceError`].

use common::ServiceError;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    codec::CodecError,
    material::KeyAlgorithm,
    pool::PoolError,
    store::{KeyTier, StoreError},
    unseal::UnsealError,
};

/// Errors returned by [`crate::Barrier`] and [`crate::RotationCoordinator`].
#[derive(Debug, Error)]
pub enum BarrierError {
    /// No key material became available within the pool's wait bound.
    #[error("key material pool exhausted for {algorithm} after {waited_ms} ms")]
    PoolExhausted {
        algorithm: KeyAlgorithm,
        waited_ms: u64,
    },

    /// The key material pool has shut down or reached its lifetime limit.
    #[error("key material pool is closed")]
    PoolClosed,

    /// The barrier has shut down.
    #[error("barrier is closed")]
    Closed,

    /// An envelope or the pool names an algorithm this build cannot serve.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// An envelope failed authentication.
    #[error("integrity check failed")]
    Integrity,

    /// A key id referenced by an envelope is not in the store.
    #[error("unknown {tier} key id {id}")]
    UnknownKeyId { tier: KeyTier, id: Uuid },

    /// The ciphertext is not a parsable envelope.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// The key store could not be reached; nothing was applied.
    #[error("key store unavailable: {0}")]
    StoreUnavailable(String),

    /// The unseal secret is invalid or unavailable.
    #[error(transparent)]
    Unseal(#[from] UnsealError),

    /// A rotation was requested without a reason.
    #[error("rotation reason must not be blank")]
    InvalidReason,

    /// Invariant violation inside the barrier (corrupt record, bad key length).
    #[error("internal barrier error: {0}")]
    Internal(String),
}

impl From<PoolError> for BarrierError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted {
                algorithm,
                waited_ms,
            } => BarrierError::PoolExhausted {
                algorithm,
                waited_ms,
            },
            PoolError::UnsupportedAlgorithm(alg) => BarrierError::UnsupportedAlgorithm(alg.to_string()),
            PoolError::Closed | PoolError::LifetimeReached(_) => BarrierError::PoolClosed,
            PoolError::InvalidConfig(msg) => BarrierError::Internal(msg),
        }
    }
}

impl From<CodecError> for BarrierError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Malformed(msg) => BarrierError::Malformed(msg),
            CodecError::UnsupportedAlgorithm(tag) => BarrierError::UnsupportedAlgorithm(tag),
            CodecError::Integrity => BarrierError::Integrity,
            other @ (CodecError::InvalidKeyLength { .. } | CodecError::AeadFailure) => {
                BarrierError::Internal(other.to_string())
            }
        }
    }
}

impl From<StoreError> for BarrierError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => BarrierError::StoreUnavailable(msg),
            StoreError::NotFound { tier, id } => BarrierError::UnknownKeyId { tier, id },
            other @ (StoreError::Duplicate { .. } | StoreError::Corrupt(_)) => {
                BarrierError::Internal(other.to_string())
            }
        }
    }
}

impl From<BarrierError> for ServiceError {
    fn from(e: BarrierError) -> Self {
        let msg = e.to_string();
        match e {
            BarrierError::PoolExhausted { .. }
            | BarrierError::PoolClosed
            | BarrierError::Closed
            | BarrierError::StoreUnavailable(_) => ServiceError::Unavailable(msg),
            BarrierError::Malformed(_) | BarrierError::InvalidReason => ServiceError::BadRequest(msg),
            BarrierError::Integrity
            | BarrierError::UnknownKeyId { .. }
            | BarrierError::UnsupportedAlgorithm(_) => ServiceError::EncryptionFailure(msg),
            BarrierError::Unseal(_) | BarrierError::Internal(_) => ServiceError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_status_codes() {
        let cases: Vec<(BarrierError, u16)> = vec![
            (
                BarrierError::PoolExhausted {
                    algorithm: KeyAlgorithm::Aes256,
                    waited_ms: 10,
                },
                503,
            ),
            (BarrierError::PoolClosed, 503),
            (BarrierError::Closed, 503),
            (BarrierError::StoreUnavailable("disk".into()), 503),
            (BarrierError::Malformed("x".into()), 400),
            (BarrierError::InvalidReason, 400),
            (BarrierError::Integrity, 500),
            (
                BarrierError::UnknownKeyId {
                    tier: KeyTier::Content,
                    id: Uuid::nil(),
                },
                500,
            ),
            (BarrierError::Unseal(UnsealError::InvalidLength(3)), 500),
        ];
        for (err, status) in cases {
            let label = err.to_string();
            assert_eq!(ServiceError::from(err).http_status(), status, "{label}");
        }
    }

    #[test]
    fn codec_and_store_errors_fold_in() {
        assert!(matches!(BarrierError::from(CodecError::Integrity), BarrierError::Integrity));
        assert!(matches!(
            BarrierError::from(StoreError::Unavailable("locked".into())),
            BarrierError::StoreUnavailable(_)
        ));
        assert!(matches!(BarrierError::from(PoolError::Closed), BarrierError::PoolClosed));
        assert!(matches!(
            BarrierError::from(PoolError::LifetimeReached(KeyAlgorithm::Aes256)),
            BarrierError::PoolClosed
        ));
    }
}

//! Hierarchical envelope-encryption barrier.
//!
//! Application data is sealed under content keys, content keys under the
//! active intermediate key, the intermediate under the root key, and the root
//! under a key derived from the operator's unseal secret. Each tier can be
//! rotated independently without losing access to anything written earlier.
//!
//! - [`pool`]: background-generated key material, ready before it is needed.
//! - [`codec`]: authenticated envelopes that name the key they are sealed under.
//! - [`store`]: durable key records for every tier.
//! - [`cache`]: the [`Barrier`] handle: active keys and the data path.
//! - [`rotation`]: the [`RotationCoordinator`].
//! - [`unseal`]: deriving the key that seals root records.

pub mod cache;
pub mod codec;
pub mod error;
pub mod material;
pub mod pool;
pub mod rotation;
pub mod store;
pub mod unseal;

pub use cache::{Barrier, BARRIER_KEY_ALGORITHM};
pub use error::BarrierError;
pub use material::{KeyAlgorithm, KeyMaterial, MaterialGenerator, SystemGenerator};
pub use pool::{KeyPool, PoolConfig, PoolError, PoolStats};
pub use rotation::{HierarchyStatus, KeySummary, RotationCoordinator, DEFAULT_HISTORY_LIMIT};
pub use store::{KeyStore, KeyTier, MemoryKeyStore, RotationEvent, SqliteKeyStore};
pub use unseal::{
    EnvSecretProvider, FileSecretProvider, StaticSecretProvider, UnsealKey, UnsealSecretProvider,
};

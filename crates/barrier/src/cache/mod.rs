//! Barrier cache: the active key hierarchy and the data-path operations
//! built on it.
//!
//! # Lifecycle
//!
//! 1. [`Barrier::open`] bootstraps eagerly; [`Barrier::new`] defers it to the
//!    first call that needs keys.
//! 2. Bootstrap loads the active root, intermediate and content records, or
//!    creates any that are missing from pooled material.
//! 3. [`Barrier::encrypt_data`] / [`Barrier::decrypt_data`] share a read lock
//!    on the active pointers; rotations take the write lock.
//! 4. [`Barrier::shutdown`] closes the barrier and its pool.
//!
//! # Security invariants
//!
//! - Unwrapped key material lives only in the resolved-key map and is zeroed
//!   when dropped.
//! - Key material is never logged; only key ids are.

pub(crate) mod resolver;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    codec::{self, Envelope},
    error::BarrierError,
    material::{KeyAlgorithm, SecretBytes},
    pool::KeyPool,
    store::{KeyRecord, KeyStore, KeyTier},
    unseal::UnsealKey,
};
use resolver::ResolvedKeys;

/// Pool algorithm every tier's key material is drawn from.
pub const BARRIER_KEY_ALGORITHM: KeyAlgorithm = KeyAlgorithm::Aes256;

/// Currently active records of each tier.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSet {
    pub(crate) root: KeyRecord,
    pub(crate) intermediate: KeyRecord,
    /// Oldest first; the last entry is preferred for new encryptions.
    pub(crate) content: Vec<KeyRecord>,
}

impl ActiveSet {
    pub(crate) fn preferred_content(&self) -> Result<&KeyRecord, BarrierError> {
        self.content
            .last()
            .ok_or_else(|| BarrierError::Internal("no active content key".into()))
    }
}

struct Inner {
    store: Arc<dyn KeyStore>,
    pool: KeyPool,
    unseal: UnsealKey,
    /// `None` until bootstrap has run.
    active: RwLock<Option<ActiveSet>>,
    resolved: ResolvedKeys,
    closed: AtomicBool,
}

/// Shared handle to the encryption barrier.
///
/// Cheap to clone; every clone sees the same hierarchy.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("unseal_key_id", &self.inner.unseal.id())
            .field("resolved_keys", &self.inner.resolved.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Barrier {
    /// Create a barrier that bootstraps on first use.
    pub fn new(store: Arc<dyn KeyStore>, pool: KeyPool, unseal: UnsealKey) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                unseal,
                active: RwLock::new(None),
                resolved: ResolvedKeys::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a barrier and bootstrap it immediately.
    ///
    /// # Errors
    ///
    /// Any bootstrap failure: an unreadable store, a root sealed under a
    /// different unseal key, or an exhausted pool.
    pub async fn open(
        store: Arc<dyn KeyStore>,
        pool: KeyPool,
        unseal: UnsealKey,
    ) -> Result<Self, BarrierError> {
        let barrier = Self::new(store, pool, unseal);
        barrier.bootstrap().await?;
        Ok(barrier)
    }

    /// Encrypt `plaintext` under the preferred active content key.
    ///
    /// The result is a compact envelope naming the content key.
    pub async fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let active = self.read_active().await?;
        let content = active.preferred_content()?;
        let material = self.resolve(KeyTier::Content, content.id)?;
        let envelope = codec::seal(content.id, material.as_bytes(), plaintext)?;
        Ok(envelope.to_compact().into_bytes())
    }

    /// Decrypt a ciphertext produced by [`Barrier::encrypt_data`] under any
    /// content key, active or retired.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Malformed`] if `ciphertext` is not an envelope.
    /// - [`BarrierError::UnknownKeyId`] if its content key is not in the store.
    /// - [`BarrierError::Integrity`] if the envelope or any ancestor fails
    ///   authentication.
    pub async fn decrypt_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let envelope = Envelope::parse_bytes(ciphertext)?;
        // Held so a concurrent rotation cannot interleave with the walk.
        let _active = self.read_active().await?;
        let material = self.resolve(KeyTier::Content, envelope.kid())?;
        Ok(codec::open(material.as_bytes(), &envelope)?)
    }

    /// Whether bootstrap has completed and the barrier is open.
    pub async fn is_ready(&self) -> bool {
        !self.is_closed() && self.inner.active.read().await.is_some()
    }

    /// Number of concurrently active content keys; zero before bootstrap.
    pub async fn active_content_count(&self) -> usize {
        self.inner
            .active
            .read()
            .await
            .as_ref()
            .map_or(0, |a| a.content.len())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the barrier and shut down its key material pool.
    ///
    /// Subsequent operations fail with [`BarrierError::Closed`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.pool.shutdown().await;
        info!("barrier closed");
    }

    /// Load or create the active hierarchy. Safe to call concurrently and
    /// repeatedly; only the first caller does any work.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<(), BarrierError> {
        self.check_open()?;
        let mut guard = self.inner.active.write().await;
        // Another caller may have finished while we waited for the lock.
        if guard.is_some() {
            return Ok(());
        }

        let root = self.load_or_create(KeyTier::Root, None).await?;
        let intermediate = self
            .load_or_create(KeyTier::Intermediate, Some(root.id))
            .await?;

        let mut content = self.inner.store.active(KeyTier::Content)?;
        if content.is_empty() {
            content.push(
                self.load_or_create(KeyTier::Content, Some(intermediate.id))
                    .await?,
            );
        }

        info!(
            root_key_id = %root.id,
            intermediate_key_id = %intermediate.id,
            active_content_keys = content.len(),
            "barrier bootstrapped"
        );
        *guard = Some(ActiveSet {
            root,
            intermediate,
            content,
        });
        Ok(())
    }

    /// Active record of `tier` (newest if several), unwrapped to prove the
    /// unseal key opens it; a fresh one sealed under `parent` otherwise.
    async fn load_or_create(
        &self,
        tier: KeyTier,
        parent: Option<Uuid>,
    ) -> Result<KeyRecord, BarrierError> {
        if let Some(existing) = self.inner.store.active(tier)?.pop() {
            self.inner
                .resolved
                .unwrap_record(self.inner.store.as_ref(), &self.inner.unseal, &existing)?;
            return Ok(existing);
        }

        let (record, material) = self.mint(tier, parent, Utc::now()).await?;
        self.inner.store.insert(record.clone())?;
        self.inner.resolved.insert(tier, record.id, material);
        info!(tier = %tier, key_id = %record.id, "created initial key");
        Ok(record)
    }

    /// Draw fresh material from the pool and seal it under `parent` (or the
    /// unseal key for root). Nothing is persisted or cached.
    pub(crate) async fn mint(
        &self,
        tier: KeyTier,
        parent: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(KeyRecord, Arc<SecretBytes>), BarrierError> {
        let material = self.inner.pool.get(BARRIER_KEY_ALGORITHM).await?;
        let secret = Arc::new(material.into_secret());
        let wrapped = self.seal_under(tier, parent, secret.as_bytes())?;
        let record = KeyRecord::active(tier, Uuid::now_v7(), wrapped, now);
        Ok((record, secret))
    }

    /// Seal `child` for storage in `tier`, under `parent` or the unseal key.
    pub(crate) fn seal_under(
        &self,
        tier: KeyTier,
        parent: Option<Uuid>,
        child: &[u8],
    ) -> Result<String, BarrierError> {
        let envelope = match (tier.parent(), parent) {
            (None, _) => codec::seal(self.inner.unseal.id(), self.inner.unseal.material(), child)?,
            (Some(parent_tier), Some(parent_id)) => {
                let key = self.resolve(parent_tier, parent_id)?;
                codec::seal(parent_id, key.as_bytes(), child)?
            }
            (Some(parent_tier), None) => {
                return Err(BarrierError::Internal(format!(
                    "{tier} key requires a {parent_tier} parent"
                )))
            }
        };
        Ok(envelope.to_compact())
    }

    pub(crate) fn resolve(&self, tier: KeyTier, id: Uuid) -> Result<Arc<SecretBytes>, BarrierError> {
        self.inner
            .resolved
            .resolve(self.inner.store.as_ref(), &self.inner.unseal, tier, id)
    }

    pub(crate) fn cache_material(&self, tier: KeyTier, id: Uuid, material: Arc<SecretBytes>) {
        self.inner.resolved.insert(tier, id, material);
    }

    pub(crate) fn store(&self) -> &dyn KeyStore {
        self.inner.store.as_ref()
    }

    fn check_open(&self) -> Result<(), BarrierError> {
        if self.is_closed() {
            return Err(BarrierError::Closed);
        }
        Ok(())
    }

    /// Read access to the active set, bootstrapping first if needed.
    pub(crate) async fn read_active(&self) -> Result<RwLockReadGuard<'_, ActiveSet>, BarrierError> {
        self.check_open()?;
        if let Ok(active) =
            RwLockReadGuard::try_map(self.inner.active.read().await, |a| a.as_ref())
        {
            return Ok(active);
        }
        self.bootstrap().await?;
        RwLockReadGuard::try_map(self.inner.active.read().await, |a| a.as_ref())
            .map_err(|_| BarrierError::Internal("barrier not bootstrapped".into()))
    }

    /// Exclusive access to the active set, bootstrapping first if needed.
    pub(crate) async fn write_active(
        &self,
    ) -> Result<tokio::sync::RwLockMappedWriteGuard<'_, ActiveSet>, BarrierError> {
        self.check_open()?;
        self.bootstrap().await?;
        RwLockWriteGuard::try_map(self.inner.active.write().await, |a| a.as_mut())
            .map_err(|_| BarrierError::Internal("barrier not bootstrapped".into()))
    }
}

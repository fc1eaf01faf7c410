//! Hierarchy resolver: walks content → intermediate → root → unseal key and
//! caches every level it unwraps.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tracing::debug;
use uuid::Uuid;

use crate::{
    codec::{self, Envelope},
    error::BarrierError,
    material::SecretBytes,
    store::{KeyRecord, KeyStore, KeyTier},
    unseal::UnsealKey,
};

/// Unwrapped key material for every key seen so far, any tier, active or
/// retired. Entries are never evicted.
///
/// Entries are keyed by tier as well as id: a lookup for a content key never
/// returns an intermediate or root, even when the id matches.
///
/// Reads are lock-free; inserts copy the map and swap it in.
#[derive(Debug, Default)]
pub(crate) struct ResolvedKeys {
    inner: ArcSwap<HashMap<(KeyTier, Uuid), Arc<SecretBytes>>>,
}

impl ResolvedKeys {
    pub(crate) fn get(&self, tier: KeyTier, id: Uuid) -> Option<Arc<SecretBytes>> {
        self.inner.load().get(&(tier, id)).cloned()
    }

    pub(crate) fn insert(&self, tier: KeyTier, id: Uuid, material: Arc<SecretBytes>) {
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert((tier, id), Arc::clone(&material));
            next
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Material for `id` of `tier`, loading and unwrapping ancestors as needed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::UnknownKeyId`] if a record on the chain is missing
    ///   from its tier, or a root names a different unseal key.
    /// - [`BarrierError::Integrity`] if any unwrap fails authentication.
    pub(crate) fn resolve(
        &self,
        store: &dyn KeyStore,
        unseal: &UnsealKey,
        tier: KeyTier,
        id: Uuid,
    ) -> Result<Arc<SecretBytes>, BarrierError> {
        if let Some(hit) = self.get(tier, id) {
            return Ok(hit);
        }
        let record = store
            .get(tier, id)?
            .ok_or(BarrierError::UnknownKeyId { tier, id })?;
        self.unwrap_record(store, unseal, &record)
    }

    /// Unwrap `record` under its parent and cache the result.
    pub(crate) fn unwrap_record(
        &self,
        store: &dyn KeyStore,
        unseal: &UnsealKey,
        record: &KeyRecord,
    ) -> Result<Arc<SecretBytes>, BarrierError> {
        let envelope = Envelope::parse(&record.wrapped_material).map_err(|e| {
            BarrierError::Internal(format!("{} key {} has a corrupt wrapping: {e}", record.tier, record.id))
        })?;

        let material = match record.tier.parent() {
            None => {
                if envelope.kid() != unseal.id() {
                    return Err(BarrierError::UnknownKeyId {
                        tier: KeyTier::Root,
                        id: envelope.kid(),
                    });
                }
                codec::open(unseal.material(), &envelope)?
            }
            Some(parent_tier) => {
                let parent = self.resolve(store, unseal, parent_tier, envelope.kid())?;
                codec::open(parent.as_bytes(), &envelope)?
            }
        };

        let material = Arc::new(SecretBytes::new(material));
        self.insert(record.tier, record.id, Arc::clone(&material));
        debug!(tier = %record.tier, key_id = %record.id, "resolved key");
        Ok(material)
    }
}

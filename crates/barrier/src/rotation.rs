//! Rotation coordinator: replaces keys at each tier without losing the
//! ability to decrypt anything written before.
//!
//! Every rotation holds the barrier's write lock from material generation to
//! pointer swap, so at most one rotation is in flight and no reader sees a
//! half-updated hierarchy. The store commit is the last `.await`-free step
//! that can fail; if it fails the in-memory pointers are left untouched.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    cache::Barrier,
    error::BarrierError,
    store::{KeyRecord, KeyTier, Reseal, RotationEvent, TierChange},
};

/// Number of events [`RotationCoordinator::rotation_history`] returns when
/// the caller does not ask for a specific count.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Identity and timestamps of one key, without its material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&KeyRecord> for KeySummary {
    fn from(r: &KeyRecord) -> Self {
        Self {
            id: r.id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Active root and intermediate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyStatus {
    pub root: KeySummary,
    pub intermediate: KeySummary,
}

/// Administrative entry point for key rotation.
#[derive(Debug, Clone)]
pub struct RotationCoordinator {
    barrier: Barrier,
}

fn validate_reason(reason: &str) -> Result<String, BarrierError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(BarrierError::InvalidReason);
    }
    Ok(trimmed.to_owned())
}

impl RotationCoordinator {
    pub fn new(barrier: Barrier) -> Self {
        Self { barrier }
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Replace the root key and re-seal the active intermediate under it.
    ///
    /// The previous root is retired but kept, so intermediates retired
    /// earlier (still sealed under it) remain resolvable.
    #[instrument(skip(self), fields(tier = "root"))]
    pub async fn rotate_root(&self, reason: &str) -> Result<RotationEvent, BarrierError> {
        let reason = validate_reason(reason)?;
        let mut active = self.barrier.write_active().await?;

        let now = Utc::now();
        let (new_root, root_material) = self.barrier.mint(KeyTier::Root, None, now).await?;

        let intermediate = self
            .barrier
            .resolve(KeyTier::Intermediate, active.intermediate.id)?;
        let resealed = crate::codec::seal(new_root.id, root_material.as_bytes(), intermediate.as_bytes())?
            .to_compact();

        let event = RotationEvent {
            tier: KeyTier::Root,
            old_key_uuid: Some(active.root.id),
            new_key_uuid: new_root.id,
            reason,
            rotated_at: now,
        };
        self.commit(TierChange {
            insert: new_root.clone(),
            retire: Some(active.root.id),
            reseal: Some(Reseal {
                tier: KeyTier::Intermediate,
                id: active.intermediate.id,
                wrapped_material: resealed.clone(),
                updated_at: now,
            }),
            event: Some(event.clone()),
        })?;

        self.barrier.cache_material(KeyTier::Root, new_root.id, root_material);
        active.root = new_root;
        active.intermediate.wrapped_material = resealed;
        active.intermediate.updated_at = now;

        info!(
            old_key_id = ?event.old_key_uuid,
            new_key_id = %event.new_key_uuid,
            intermediate_key_id = %active.intermediate.id,
            reason = %event.reason,
            "rotated root key"
        );
        Ok(event)
    }

    /// Replace the intermediate key. Active content keys keep their wrapping
    /// under the retired intermediate.
    #[instrument(skip(self), fields(tier = "intermediate"))]
    pub async fn rotate_intermediate(&self, reason: &str) -> Result<RotationEvent, BarrierError> {
        let reason = validate_reason(reason)?;
        let mut active = self.barrier.write_active().await?;

        let now = Utc::now();
        let (new_intermediate, material) = self
            .barrier
            .mint(KeyTier::Intermediate, Some(active.root.id), now)
            .await?;

        let event = RotationEvent {
            tier: KeyTier::Intermediate,
            old_key_uuid: Some(active.intermediate.id),
            new_key_uuid: new_intermediate.id,
            reason,
            rotated_at: now,
        };
        self.commit(TierChange {
            insert: new_intermediate.clone(),
            retire: Some(active.intermediate.id),
            reseal: None,
            event: Some(event.clone()),
        })?;

        self.barrier.cache_material(KeyTier::Intermediate, new_intermediate.id, material);
        active.intermediate = new_intermediate;

        info!(
            old_key_id = ?event.old_key_uuid,
            new_key_id = %event.new_key_uuid,
            reason = %event.reason,
            "rotated intermediate key"
        );
        Ok(event)
    }

    /// Add a content key to the active set and make it preferred. Nothing is
    /// retired; the returned event has no `old_key_uuid`.
    #[instrument(skip(self), fields(tier = "content"))]
    pub async fn rotate_content(&self, reason: &str) -> Result<RotationEvent, BarrierError> {
        let reason = validate_reason(reason)?;
        let mut active = self.barrier.write_active().await?;

        let now = Utc::now();
        let (new_content, material) = self
            .barrier
            .mint(KeyTier::Content, Some(active.intermediate.id), now)
            .await?;

        let event = RotationEvent {
            tier: KeyTier::Content,
            old_key_uuid: None,
            new_key_uuid: new_content.id,
            reason,
            rotated_at: now,
        };
        self.commit(TierChange {
            insert: new_content.clone(),
            retire: None,
            reseal: None,
            event: Some(event.clone()),
        })?;

        self.barrier.cache_material(KeyTier::Content, new_content.id, material);
        active.content.push(new_content);

        info!(
            new_key_id = %event.new_key_uuid,
            active_content_keys = active.content.len(),
            reason = %event.reason,
            "rotated content key"
        );
        Ok(event)
    }

    /// Active root and intermediate keys.
    pub async fn status(&self) -> Result<HierarchyStatus, BarrierError> {
        let active = self.barrier.read_active().await?;
        Ok(HierarchyStatus {
            root: KeySummary::from(&active.root),
            intermediate: KeySummary::from(&active.intermediate),
        })
    }

    /// Active content keys, preferred first.
    pub async fn content_status(&self) -> Result<Vec<KeySummary>, BarrierError> {
        let active = self.barrier.read_active().await?;
        Ok(active.content.iter().rev().map(KeySummary::from).collect())
    }

    /// Most recent rotations, newest first.
    pub async fn rotation_history(&self, limit: usize) -> Result<Vec<RotationEvent>, BarrierError> {
        if self.barrier.is_closed() {
            return Err(BarrierError::Closed);
        }
        Ok(self.barrier.store().rotations(limit)?)
    }

    fn commit(&self, change: TierChange) -> Result<(), BarrierError> {
        let tier = change.insert.tier;
        self.barrier.store().commit(change).map_err(|e| {
            warn!(tier = %tier, error = %e, "rotation not persisted; active keys unchanged");
            BarrierError::from(e)
        })
    }
}

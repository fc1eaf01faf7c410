//! Key hierarchy store: persistence for root, intermediate and content key records.
//!
//! Records are never deleted. The only mutations after insert are the
//! `active → retired` status transition and the re-seal of the active
//! intermediate key during a root rotation, both applied through
//! [`KeyStore::commit`] so that a rotation lands completely or not at all.

pub mod memory;
pub mod sqlite;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

/// Level of a key in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyTier {
    Root,
    Intermediate,
    Content,
}

impl KeyTier {
    pub const ALL: [KeyTier; 3] = [KeyTier::Root, KeyTier::Intermediate, KeyTier::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTier::Root => "root",
            KeyTier::Intermediate => "intermediate",
            KeyTier::Content => "content",
        }
    }

    /// The tier whose keys seal this tier's records; `None` for root.
    pub fn parent(&self) -> Option<KeyTier> {
        match self {
            KeyTier::Root => None,
            KeyTier::Intermediate => Some(KeyTier::Root),
            KeyTier::Content => Some(KeyTier::Intermediate),
        }
    }
}

impl fmt::Display for KeyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyTier {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(KeyTier::Root),
            "intermediate" => Ok(KeyTier::Intermediate),
            "content" => Ok(KeyTier::Content),
            other => Err(StoreError::Corrupt(format!("unknown tier {other:?}"))),
        }
    }
}

/// Lifecycle state of a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Active,
    Retired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Retired => "retired",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RecordStatus::Active),
            "retired" => Ok(RecordStatus::Retired),
            other => Err(StoreError::Corrupt(format!("unknown status {other:?}"))),
        }
    }
}

/// One persisted key of any tier.
///
/// `wrapped_material` is a compact envelope whose header names the parent
/// key (or the unseal key, for root records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: Uuid,
    pub tier: KeyTier,
    pub wrapped_material: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RecordStatus,
}

impl KeyRecord {
    /// A new active record created at `now`.
    pub fn active(tier: KeyTier, id: Uuid, wrapped_material: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tier,
            wrapped_material,
            created_at: now,
            updated_at: now,
            status: RecordStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}

/// Replacement wrapping for an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reseal {
    pub tier: KeyTier,
    pub id: Uuid,
    pub wrapped_material: String,
    pub updated_at: DateTime<Utc>,
}

/// Audit entry written with every rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    pub tier: KeyTier,
    /// Retired key; `None` for elastic content rotations.
    pub old_key_uuid: Option<Uuid>,
    pub new_key_uuid: Uuid,
    pub reason: String,
    pub rotated_at: DateTime<Utc>,
}

/// Everything one rotation writes, applied atomically by [`KeyStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierChange {
    /// New active record.
    pub insert: KeyRecord,
    /// Active record of the same tier to retire.
    pub retire: Option<Uuid>,
    /// Record whose wrapping is replaced.
    pub reseal: Option<Reseal>,
    pub event: Option<RotationEvent>,
}

/// Errors produced by key store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or the I/O failed.
    #[error("key store unavailable: {0}")]
    Unavailable(String),

    /// A commit referenced a record that does not exist (or is not active).
    #[error("{tier} key {id} not found")]
    NotFound { tier: KeyTier, id: Uuid },

    /// An insert collided with an existing identifier.
    #[error("{tier} key {id} already exists")]
    Duplicate { tier: KeyTier, id: Uuid },

    /// A persisted row could not be decoded.
    #[error("corrupt key record: {0}")]
    Corrupt(String),
}

/// Persistence backend for the key hierarchy.
///
/// Implementations are synchronous; every method is short and the barrier
/// calls them from inside its lock's critical section, on the calling Tokio
/// worker thread. That holds for the in-memory map and a local SQLite file.
/// A backend that waits on the network must not implement this trait
/// directly; its calls belong on `spawn_blocking` first.
#[cfg_attr(test, mockall::automock)]
pub trait KeyStore: Send + Sync {
    /// Fetch one record of `tier`, active or retired.
    fn get(&self, tier: KeyTier, id: Uuid) -> Result<Option<KeyRecord>, StoreError>;

    /// All active records of `tier`, oldest first (ties broken by id).
    fn active(&self, tier: KeyTier) -> Result<Vec<KeyRecord>, StoreError>;

    /// Insert a single record (bootstrap path).
    fn insert(&self, record: KeyRecord) -> Result<(), StoreError>;

    /// Apply a rotation atomically: all parts or none.
    fn commit(&self, change: TierChange) -> Result<(), StoreError>;

    /// Most recent rotation events, newest first.
    fn rotations(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError>;
}

/// Sort records oldest first, ties broken by id.
pub(crate) fn sort_oldest_first(records: &mut [KeyRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parents_form_a_chain() {
        assert_eq!(KeyTier::Content.parent(), Some(KeyTier::Intermediate));
        assert_eq!(KeyTier::Intermediate.parent(), Some(KeyTier::Root));
        assert_eq!(KeyTier::Root.parent(), None);
    }

    #[test]
    fn tier_and_status_names_parse_back() {
        for tier in KeyTier::ALL {
            assert_eq!(tier.as_str().parse::<KeyTier>().unwrap(), tier);
        }
        assert_eq!("retired".parse::<RecordStatus>().unwrap(), RecordStatus::Retired);
        assert!(matches!("deleted".parse::<RecordStatus>(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn sort_breaks_timestamp_ties_by_id() {
        let now = Utc::now();
        let a = KeyRecord::active(KeyTier::Content, Uuid::from_u128(2), "a".into(), now);
        let b = KeyRecord::active(KeyTier::Content, Uuid::from_u128(1), "b".into(), now);
        let mut records = vec![a.clone(), b.clone()];
        sort_oldest_first(&mut records);
        assert_eq!(records, vec![b, a]);
    }
}

//! In-process [`KeyStore`] for tests and ephemeral deployments.

use std::{collections::HashMap, sync::Mutex};

use uuid::Uuid;

use super::{
    sort_oldest_first, KeyRecord, KeyStore, KeyTier, RecordStatus, RotationEvent, StoreError,
    TierChange,
};

#[derive(Debug, Default)]
struct State {
    records: HashMap<(KeyTier, Uuid), KeyRecord>,
    rotations: Vec<RotationEvent>,
}

/// Key store held entirely in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: Mutex<State>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Number of records of `tier`, any status.
    pub fn count(&self, tier: KeyTier) -> usize {
        self.lock()
            .map(|s| s.records.keys().filter(|(t, _)| *t == tier).count())
            .unwrap_or(0)
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, tier: KeyTier, id: Uuid) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.lock()?.records.get(&(tier, id)).cloned())
    }

    fn active(&self, tier: KeyTier) -> Result<Vec<KeyRecord>, StoreError> {
        let mut out: Vec<_> = self
            .lock()?
            .records
            .values()
            .filter(|r| r.tier == tier && r.is_active())
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    fn insert(&self, record: KeyRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let key = (record.tier, record.id);
        if state.records.contains_key(&key) {
            return Err(StoreError::Duplicate {
                tier: record.tier,
                id: record.id,
            });
        }
        state.records.insert(key, record);
        Ok(())
    }

    fn commit(&self, change: TierChange) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let tier = change.insert.tier;

        // Validate everything before touching state.
        if state.records.contains_key(&(tier, change.insert.id)) {
            return Err(StoreError::Duplicate {
                tier,
                id: change.insert.id,
            });
        }
        if let Some(id) = change.retire {
            match state.records.get(&(tier, id)) {
                Some(r) if r.is_active() => {}
                _ => return Err(StoreError::NotFound { tier, id }),
            }
        }
        if let Some(reseal) = &change.reseal {
            if !state.records.contains_key(&(reseal.tier, reseal.id)) {
                return Err(StoreError::NotFound {
                    tier: reseal.tier,
                    id: reseal.id,
                });
            }
        }

        let now = change.insert.created_at;
        if let Some(id) = change.retire {
            if let Some(r) = state.records.get_mut(&(tier, id)) {
                r.status = RecordStatus::Retired;
                r.updated_at = now;
            }
        }
        if let Some(reseal) = change.reseal {
            if let Some(r) = state.records.get_mut(&(reseal.tier, reseal.id)) {
                r.wrapped_material = reseal.wrapped_material;
                r.updated_at = reseal.updated_at;
            }
        }
        state.records.insert((tier, change.insert.id), change.insert);
        if let Some(event) = change.event {
            state.rotations.push(event);
        }
        Ok(())
    }

    fn rotations(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError> {
        Ok(self
            .lock()?
            .rotations
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reseal;
    use chrono::{Duration, Utc};

    fn record(tier: KeyTier, offset_ms: i64) -> KeyRecord {
        KeyRecord::active(
            tier,
            Uuid::now_v7(),
            format!("wrapped-{offset_ms}"),
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn insert_get_and_active_ordering() {
        let store = MemoryKeyStore::new();
        let older = record(KeyTier::Content, 0);
        let newer = record(KeyTier::Content, 10);
        store.insert(newer.clone()).unwrap();
        store.insert(older.clone()).unwrap();

        assert_eq!(store.get(KeyTier::Content, older.id).unwrap(), Some(older.clone()));
        assert_eq!(store.get(KeyTier::Root, older.id).unwrap(), None);
        assert_eq!(store.active(KeyTier::Content).unwrap(), vec![older, newer]);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let store = MemoryKeyStore::new();
        let r = record(KeyTier::Root, 0);
        store.insert(r.clone()).unwrap();
        assert!(matches!(store.insert(r), Err(StoreError::Duplicate { .. })));
    }

    #[test]
    fn commit_retires_reseals_and_records_event() {
        let store = MemoryKeyStore::new();
        let old_root = record(KeyTier::Root, 0);
        let inter = record(KeyTier::Intermediate, 0);
        store.insert(old_root.clone()).unwrap();
        store.insert(inter.clone()).unwrap();

        let new_root = record(KeyTier::Root, 5);
        let event = RotationEvent {
            tier: KeyTier::Root,
            old_key_uuid: Some(old_root.id),
            new_key_uuid: new_root.id,
            reason: "annual".into(),
            rotated_at: new_root.created_at,
        };
        store
            .commit(TierChange {
                insert: new_root.clone(),
                retire: Some(old_root.id),
                reseal: Some(Reseal {
                    tier: KeyTier::Intermediate,
                    id: inter.id,
                    wrapped_material: "resealed".into(),
                    updated_at: new_root.created_at,
                }),
                event: Some(event.clone()),
            })
            .unwrap();

        let retired = store.get(KeyTier::Root, old_root.id).unwrap().unwrap();
        assert_eq!(retired.status, RecordStatus::Retired);
        assert_eq!(store.active(KeyTier::Root).unwrap(), vec![new_root]);
        let resealed = store.get(KeyTier::Intermediate, inter.id).unwrap().unwrap();
        assert_eq!(resealed.wrapped_material, "resealed");
        assert_eq!(resealed.created_at, inter.created_at);
        assert_eq!(store.rotations(10).unwrap(), vec![event]);
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let store = MemoryKeyStore::new();
        let old = record(KeyTier::Intermediate, 0);
        store.insert(old.clone()).unwrap();

        let err = store
            .commit(TierChange {
                insert: record(KeyTier::Intermediate, 1),
                retire: Some(old.id),
                reseal: Some(Reseal {
                    tier: KeyTier::Content,
                    id: Uuid::now_v7(),
                    wrapped_material: "x".into(),
                    updated_at: Utc::now(),
                }),
                event: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { tier: KeyTier::Content, .. }));
        assert_eq!(store.active(KeyTier::Intermediate).unwrap(), vec![old]);
        assert_eq!(store.count(KeyTier::Intermediate), 1);
    }

    #[test]
    fn rotations_newest_first_with_limit() {
        let store = MemoryKeyStore::new();
        for i in 0..3 {
            let r = record(KeyTier::Content, i);
            store
                .commit(TierChange {
                    insert: r.clone(),
                    retire: None,
                    reseal: None,
                    event: Some(RotationEvent {
                        tier: KeyTier::Content,
                        old_key_uuid: None,
                        new_key_uuid: r.id,
                        reason: format!("r{i}"),
                        rotated_at: r.created_at,
                    }),
                })
                .unwrap();
        }
        let events = store.rotations(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "r2");
        assert_eq!(events[1].reason, "r1");
    }
}

//! SQLite-backed [`KeyStore`].
//!
//! One table per tier plus an append-only rotation log. Timestamps are
//! stored as unix milliseconds.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::{
    sort_oldest_first, KeyRecord, KeyStore, KeyTier, RecordStatus, RotationEvent, StoreError,
    TierChange,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS barrier_root_keys (
        id TEXT PRIMARY KEY NOT NULL,
        wrapped_material TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'retired'))
    );
    CREATE TABLE IF NOT EXISTS barrier_intermediate_keys (
        id TEXT PRIMARY KEY NOT NULL,
        wrapped_material TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'retired'))
    );
    CREATE TABLE IF NOT EXISTS barrier_content_keys (
        id TEXT PRIMARY KEY NOT NULL,
        wrapped_material TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'retired'))
    );
    CREATE INDEX IF NOT EXISTS idx_barrier_content_keys_status
        ON barrier_content_keys(status);
    CREATE TABLE IF NOT EXISTS barrier_rotations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        tier TEXT NOT NULL,
        old_key_uuid TEXT,
        new_key_uuid TEXT NOT NULL,
        reason TEXT NOT NULL,
        rotated_at INTEGER NOT NULL
    );
";

fn table(tier: KeyTier) -> &'static str {
    match tier {
        KeyTier::Root => "barrier_root_keys",
        KeyTier::Intermediate => "barrier_intermediate_keys",
        KeyTier::Content => "barrier_content_keys",
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("id {s:?}: {e}")))
}

/// Raw column values, decoded outside the rusqlite row closure.
struct RecordRow {
    id: String,
    wrapped_material: String,
    created_at: i64,
    updated_at: i64,
    status: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            wrapped_material: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            status: row.get(4)?,
        })
    }

    fn into_record(self, tier: KeyTier) -> Result<KeyRecord, StoreError> {
        Ok(KeyRecord {
            id: parse_uuid(&self.id)?,
            tier,
            wrapped_material: self.wrapped_material,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            status: self.status.parse::<RecordStatus>()?,
        })
    }
}

struct EventRow {
    tier: String,
    old_key_uuid: Option<String>,
    new_key_uuid: String,
    reason: String,
    rotated_at: i64,
}

impl EventRow {
    fn into_event(self) -> Result<RotationEvent, StoreError> {
        Ok(RotationEvent {
            tier: self.tier.parse()?,
            old_key_uuid: self.old_key_uuid.as_deref().map(parse_uuid).transpose()?,
            new_key_uuid: parse_uuid(&self.new_key_uuid)?,
            reason: self.reason,
            rotated_at: from_millis(self.rotated_at)?,
        })
    }
}

/// Durable key store backed by a single SQLite file.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        debug!(path = %path.as_ref().display(), "opened key store");
        Self::with_connection(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    fn insert_row(conn: &Connection, record: &KeyRecord) -> Result<(), StoreError> {
        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", table(record.tier)),
                params![record.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate {
                tier: record.tier,
                id: record.id,
            });
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (id, wrapped_material, created_at, updated_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table(record.tier)
            ),
            params![
                record.id.to_string(),
                record.wrapped_material,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }
}

impl KeyStore for SqliteKeyStore {
    fn get(&self, tier: KeyTier, id: Uuid) -> Result<Option<KeyRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, wrapped_material, created_at, updated_at, status
                     FROM {} WHERE id = ?1",
                    table(tier)
                ),
                params![id.to_string()],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_record(tier)).transpose()
    }

    fn active(&self, tier: KeyTier) -> Result<Vec<KeyRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, wrapped_material, created_at, updated_at, status
             FROM {} WHERE status = 'active'",
            table(tier)
        ))?;
        let rows = stmt
            .query_map([], RecordRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut records = rows
            .into_iter()
            .map(|r| r.into_record(tier))
            .collect::<Result<Vec<_>, _>>()?;
        // Text ids do not sort like Uuid; order in Rust.
        sort_oldest_first(&mut records);
        Ok(records)
    }

    fn insert(&self, record: KeyRecord) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::insert_row(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    fn commit(&self, change: TierChange) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        // Dropping the transaction without commit rolls everything back.
        let tx = conn.transaction()?;
        let tier = change.insert.tier;
        let now = change.insert.created_at.timestamp_millis();

        if let Some(id) = change.retire {
            let n = tx.execute(
                &format!(
                    "UPDATE {} SET status = 'retired', updated_at = ?1
                     WHERE id = ?2 AND status = 'active'",
                    table(tier)
                ),
                params![now, id.to_string()],
            )?;
            if n != 1 {
                return Err(StoreError::NotFound { tier, id });
            }
        }

        if let Some(reseal) = &change.reseal {
            let n = tx.execute(
                &format!(
                    "UPDATE {} SET wrapped_material = ?1, updated_at = ?2 WHERE id = ?3",
                    table(reseal.tier)
                ),
                params![
                    reseal.wrapped_material,
                    reseal.updated_at.timestamp_millis(),
                    reseal.id.to_string(),
                ],
            )?;
            if n != 1 {
                return Err(StoreError::NotFound {
                    tier: reseal.tier,
                    id: reseal.id,
                });
            }
        }

        Self::insert_row(&tx, &change.insert)?;

        if let Some(event) = &change.event {
            tx.execute(
                "INSERT INTO barrier_rotations
                     (tier, old_key_uuid, new_key_uuid, reason, rotated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.tier.as_str(),
                    event.old_key_uuid.map(|id| id.to_string()),
                    event.new_key_uuid.to_string(),
                    event.reason,
                    event.rotated_at.timestamp_millis(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn rotations(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tier, old_key_uuid, new_key_uuid, reason, rotated_at
             FROM barrier_rotations ORDER BY seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(EventRow {
                    tier: row.get(0)?,
                    old_key_uuid: row.get(1)?,
                    new_key_uuid: row.get(2)?,
                    reason: row.get(3)?,
                    rotated_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reseal;

    fn record(tier: KeyTier, offset_ms: i64) -> KeyRecord {
        // Millisecond precision is what survives a round trip.
        let now = from_millis(Utc::now().timestamp_millis() + offset_ms).unwrap();
        KeyRecord::active(tier, Uuid::now_v7(), format!("wrapped-{offset_ms}"), now)
    }

    #[test]
    fn insert_and_read_back() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let r = record(KeyTier::Root, 0);
        store.insert(r.clone()).unwrap();
        assert_eq!(store.get(KeyTier::Root, r.id).unwrap(), Some(r.clone()));
        assert_eq!(store.get(KeyTier::Intermediate, r.id).unwrap(), None);
        assert!(matches!(store.insert(r), Err(StoreError::Duplicate { .. })));
    }

    #[test]
    fn active_is_oldest_first() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let a = record(KeyTier::Content, 0);
        let b = record(KeyTier::Content, 20);
        let c = record(KeyTier::Content, 40);
        for r in [&c, &a, &b] {
            store.insert(r.clone()).unwrap();
        }
        assert_eq!(store.active(KeyTier::Content).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn root_rotation_commit_is_atomic() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let root = record(KeyTier::Root, 0);
        let inter = record(KeyTier::Intermediate, 0);
        store.insert(root.clone()).unwrap();
        store.insert(inter.clone()).unwrap();

        let new_root = record(KeyTier::Root, 10);
        let event = RotationEvent {
            tier: KeyTier::Root,
            old_key_uuid: Some(root.id),
            new_key_uuid: new_root.id,
            reason: "compromise drill".into(),
            rotated_at: new_root.created_at,
        };
        store
            .commit(TierChange {
                insert: new_root.clone(),
                retire: Some(root.id),
                reseal: Some(Reseal {
                    tier: KeyTier::Intermediate,
                    id: inter.id,
                    wrapped_material: "resealed".into(),
                    updated_at: new_root.created_at,
                }),
                event: Some(event.clone()),
            })
            .unwrap();

        let old = store.get(KeyTier::Root, root.id).unwrap().unwrap();
        assert_eq!(old.status, RecordStatus::Retired);
        assert_eq!(old.wrapped_material, root.wrapped_material);
        assert_eq!(store.active(KeyTier::Root).unwrap(), vec![new_root]);
        assert_eq!(
            store.get(KeyTier::Intermediate, inter.id).unwrap().unwrap().wrapped_material,
            "resealed"
        );
        assert_eq!(store.rotations(5).unwrap(), vec![event]);
    }

    #[test]
    fn failed_commit_rolls_back() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let root = record(KeyTier::Root, 0);
        store.insert(root.clone()).unwrap();

        // The retire succeeds inside the transaction; the missing reseal
        // target must undo it.
        let err = store
            .commit(TierChange {
                insert: record(KeyTier::Root, 5),
                retire: Some(root.id),
                reseal: Some(Reseal {
                    tier: KeyTier::Intermediate,
                    id: Uuid::now_v7(),
                    wrapped_material: "x".into(),
                    updated_at: Utc::now(),
                }),
                event: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { tier: KeyTier::Intermediate, .. }));
        assert_eq!(store.active(KeyTier::Root).unwrap(), vec![root]);
        assert!(store.rotations(5).unwrap().is_empty());
    }

    #[test]
    fn retiring_a_retired_key_is_not_found() {
        let store = SqliteKeyStore::open_in_memory().unwrap();
        let a = record(KeyTier::Intermediate, 0);
        store.insert(a.clone()).unwrap();
        let b = record(KeyTier::Intermediate, 1);
        store
            .commit(TierChange {
                insert: b,
                retire: Some(a.id),
                reseal: None,
                event: None,
            })
            .unwrap();
        let err = store
            .commit(TierChange {
                insert: record(KeyTier::Intermediate, 2),
                retire: Some(a.id),
                reseal: None,
                event: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barrier.db");
        let r = record(KeyTier::Content, 0);
        {
            let store = SqliteKeyStore::open(&path).unwrap();
            store
                .commit(TierChange {
                    insert: r.clone(),
                    retire: None,
                    reseal: None,
                    event: Some(RotationEvent {
                        tier: KeyTier::Content,
                        old_key_uuid: None,
                        new_key_uuid: r.id,
                        reason: "scale out".into(),
                        rotated_at: r.created_at,
                    }),
                })
                .unwrap();
        }
        let store = SqliteKeyStore::open(&path).unwrap();
        assert_eq!(store.active(KeyTier::Content).unwrap(), vec![r.clone()]);
        let events = store.rotations(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_key_uuid, None);
        assert_eq!(events[0].new_key_uuid, r.id);
    }
}

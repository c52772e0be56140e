//! Per-session sync status in SQLite
//!
//! Source of the `last_synced_version` baseline used by classification.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::sync::SyncDirection;
use crate::types::Version;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        session_id TEXT PRIMARY KEY,
        last_synced_version TEXT,
        last_direction TEXT,
        last_sync TEXT,
        last_error TEXT,
        sync_count INTEGER NOT NULL DEFAULT 0
    );
"#;

/// Sync status of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub session_id: String,
    pub last_synced_version: Option<Version>,
    pub last_direction: Option<SyncDirection>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sync_count: i64,
}

/// SQLite-backed store of per-session sync baselines
#[derive(Clone)]
pub struct SyncStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStateStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// In-memory database for testing
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record a successful sync; `version` becomes the new baseline
    pub fn record_sync(
        &self,
        session_id: &str,
        version: &Version,
        direction: Option<SyncDirection>,
    ) -> Result<()> {
        let version_json = serde_json::to_string(version)?;
        let direction = direction.map(|d| d.as_str());
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_state (session_id, last_synced_version, last_direction, last_sync, last_error, sync_count)
             VALUES (?1, ?2, ?3, ?4, NULL, 1)
             ON CONFLICT(session_id) DO UPDATE SET
                last_synced_version = excluded.last_synced_version,
                last_direction = excluded.last_direction,
                last_sync = excluded.last_sync,
                last_error = NULL,
                sync_count = sync_count + 1",
            params![session_id, version_json, direction, now],
        )?;

        tracing::debug!(session_id, version = version.number, "Recorded sync baseline");
        Ok(())
    }

    /// Record a failed sync attempt without touching the baseline
    pub fn record_error(&self, session_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_state (session_id, last_error) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET last_error = excluded.last_error",
            params![session_id, error],
        )?;
        Ok(())
    }

    /// Baseline for classification, None on first sync
    pub fn last_synced_version(&self, session_id: &str) -> Result<Option<Version>> {
        Ok(self
            .status(session_id)?
            .and_then(|status| status.last_synced_version))
    }

    pub fn status(&self, session_id: &str) -> Result<Option<SyncStatus>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT session_id, last_synced_version, last_direction, last_sync, last_error, sync_count
                 FROM sync_state WHERE session_id = ?1",
                params![session_id],
                |row| {
                    let version: Option<String> = row.get(1)?;
                    let direction: Option<String> = row.get(2)?;
                    let last_sync: Option<String> = row.get(3)?;

                    Ok(SyncStatus {
                        session_id: row.get(0)?,
                        last_synced_version: version
                            .and_then(|s| serde_json::from_str(&s).ok()),
                        last_direction: direction.and_then(|s| s.parse().ok()),
                        last_sync: last_sync.and_then(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .map(|dt| dt.with_timezone(&Utc))
                                .ok()
                        }),
                        last_error: row.get(4)?,
                        sync_count: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All tracked sessions, most recently synced first
    pub fn list(&self) -> Result<Vec<SyncStatus>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT session_id FROM sync_state ORDER BY last_sync DESC")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.status(&id)? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn version(number: u64) -> Version {
        Version::new(number, Utc.timestamp_opt(1_700_000_000, 0).unwrap(), "dev")
    }

    #[test]
    fn test_first_sync_has_no_baseline() {
        let store = SyncStateStore::open_in_memory().unwrap();
        assert!(store.last_synced_version("s1").unwrap().is_none());
        assert!(store.status("s1").unwrap().is_none());
    }

    #[test]
    fn test_record_sync_updates_baseline() {
        let store = SyncStateStore::open_in_memory().unwrap();
        store
            .record_sync("s1", &version(2), Some(SyncDirection::Push))
            .unwrap();
        store
            .record_sync("s1", &version(3), Some(SyncDirection::Pull))
            .unwrap();

        let status = store.status("s1").unwrap().unwrap();
        assert_eq!(status.last_synced_version, Some(version(3)));
        assert_eq!(status.last_direction, Some(SyncDirection::Pull));
        assert_eq!(status.sync_count, 2);
        assert!(status.last_sync.is_some());
    }

    #[test]
    fn test_error_keeps_baseline() {
        let store = SyncStateStore::open_in_memory().unwrap();
        store.record_sync("s1", &version(2), None).unwrap();
        store.record_error("s1", "cloud unreachable").unwrap();

        let status = store.status("s1").unwrap().unwrap();
        assert_eq!(status.last_error.as_deref(), Some("cloud unreachable"));
        assert_eq!(status.last_synced_version, Some(version(2)));

        store.record_sync("s1", &version(3), None).unwrap();
        assert!(store.status("s1").unwrap().unwrap().last_error.is_none());
    }

    #[test]
    fn test_persists_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("sync-state.db");
        {
            let store = SyncStateStore::open(&path).unwrap();
            store.record_sync("s1", &version(5), None).unwrap();
        }
        let reopened = SyncStateStore::open(&path).unwrap();
        assert_eq!(reopened.last_synced_version("s1").unwrap(), Some(version(5)));
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}

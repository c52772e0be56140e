//! Backups of superseded snapshots
//!
//! Every resolution backs up the snapshot it replaces before reporting
//! success. Backups expire after a retention window and are removed by
//! [`BackupStore::purge_expired`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use super::history::HISTORY_FILE_NAME;
use crate::error::{Result, SyncError};
use crate::sync::version::format_duration;
use crate::types::{SessionSnapshot, SyncConfig};

/// Millisecond slots tried before giving up on a free backup id
const MAX_ID_ATTEMPTS: i64 = 64;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Which replica a backup was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Local,
    Cloud,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Local => "local",
            BackupType::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic id for a backup: `backup-` + 12 hex chars of SHA-256
pub fn backup_id(session_id: &str, timestamp_ms: i64, backup_type: BackupType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}-{}", session_id, timestamp_ms, backup_type).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("backup-{}", &digest[..12])
}

/// A persisted copy of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub backup_id: String,
    pub session_id: String,
    pub backup_type: BackupType,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub backed_up_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub session: SessionSnapshot,
    pub reason: String,
}

impl BackupEntry {
    pub fn new(
        session: SessionSnapshot,
        backup_type: BackupType,
        reason: impl Into<String>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let session_id = session.meta.session_id.clone();
        let timestamp = now.timestamp_millis();
        Self {
            backup_id: backup_id(&session_id, timestamp, backup_type),
            session_id,
            backup_type,
            timestamp,
            backed_up_at: now,
            expires_at: now + retention,
            session,
            reason: reason.into(),
        }
    }

    /// Move the entry to `now`, recomputing id and expiry
    fn restamp(&mut self, now: DateTime<Utc>, retention: Duration) {
        self.timestamp = now.timestamp_millis();
        self.backup_id = backup_id(&self.session_id, self.timestamp, self.backup_type);
        self.backed_up_at = now;
        self.expires_at = now + retention;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.backed_up_at
    }

    /// `{session}-{type}-{timestamp}.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.json",
            self.session_id, self.backup_type, self.timestamp
        )
    }
}

/// Filter for listing backups
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub session_id: Option<String>,
    pub include_expired: bool,
}

impl BackupFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            include_expired: false,
        }
    }
}

/// A backup that could not be removed during a purge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeFailure {
    pub backup_id: String,
    pub error: String,
}

/// Outcome of [`BackupStore::purge_expired`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    pub errors: Vec<PurgeFailure>,
}

/// Storage for [`BackupEntry`] values.
///
/// Implementors provide the raw persistence primitives; listing, restoring
/// and purging are built on top of them.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist `entry` unless its id is already taken; never replaces an
    /// existing backup. Returns false on a taken id.
    async fn write(&self, entry: &BackupEntry) -> Result<bool>;

    /// Every readable backup, expired or not, in no particular order
    async fn load_all(&self) -> Result<Vec<BackupEntry>>;

    async fn remove(&self, entry: &BackupEntry) -> Result<()>;

    fn retention(&self) -> Duration;

    /// Persist a copy of `session`.
    ///
    /// Ids are per millisecond; when one is taken the next millisecond is tried.
    async fn create_backup(
        &self,
        session: &SessionSnapshot,
        backup_type: BackupType,
        reason: &str,
    ) -> Result<BackupEntry> {
        validate_session_id(&session.meta.session_id)?;
        let now = Utc::now();
        let retention = self.retention();
        let mut entry = BackupEntry::new(session.clone(), backup_type, reason, retention, now);

        for attempt in 0..MAX_ID_ATTEMPTS {
            if attempt > 0 {
                entry.restamp(now + Duration::milliseconds(attempt), retention);
            }
            if self.write(&entry).await? {
                info!(
                    backup_id = %entry.backup_id,
                    session_id = %entry.session_id,
                    backup_type = %entry.backup_type,
                    "Backup created"
                );
                return Ok(entry);
            }
        }

        Err(SyncError::BackupWriteFailed(format!(
            "no free backup id for session {} after {} attempts",
            entry.session_id, MAX_ID_ATTEMPTS
        )))
    }

    /// Matching backups, newest first
    async fn list(&self, filter: &BackupFilter) -> Result<Vec<BackupEntry>> {
        let now = Utc::now();
        let mut entries: Vec<BackupEntry> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|e| {
                filter
                    .session_id
                    .as_ref()
                    .map_or(true, |id| &e.session_id == id)
            })
            .filter(|e| filter.include_expired || !e.is_expired(now))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Look up a backup by id, expired ones included
    async fn restore(&self, backup_id: &str) -> Result<BackupEntry> {
        self.load_all()
            .await?
            .into_iter()
            .find(|e| e.backup_id == backup_id)
            .ok_or_else(|| SyncError::BackupNotFound(backup_id.to_string()))
    }

    /// Returns false when no backup has that id
    async fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        let Some(entry) = self
            .load_all()
            .await?
            .into_iter()
            .find(|e| e.backup_id == backup_id)
        else {
            return Ok(false);
        };
        self.remove(&entry).await?;
        Ok(true)
    }

    /// Remove every expired backup, collecting per-entry failures
    async fn purge_expired(&self) -> Result<PurgeReport> {
        let now = Utc::now();
        let mut report = PurgeReport::default();
        for entry in self.load_all().await? {
            if !entry.is_expired(now) {
                continue;
            }
            match self.remove(&entry).await {
                Ok(()) => report.deleted.push(entry.backup_id),
                Err(e) => report.errors.push(PurgeFailure {
                    backup_id: entry.backup_id,
                    error: e.to_string(),
                }),
            }
        }
        if !report.deleted.is_empty() {
            info!(deleted = report.deleted.len(), "Purged expired backups");
        }
        Ok(report)
    }

    /// Plain-text listing for terminals
    async fn render_report(&self, session_id: Option<&str>) -> Result<String> {
        let filter = BackupFilter {
            session_id: session_id.map(str::to_string),
            include_expired: false,
        };
        let backups = self.list(&filter).await?;
        let now = Utc::now();

        let mut lines = vec![
            "=== Conflict Backup Report ===".to_string(),
            String::new(),
            match session_id {
                Some(id) => format!("Session: {}", id),
                None => "Sessions: All".to_string(),
            },
            format!("Total backups: {}", backups.len()),
            String::new(),
        ];

        if backups.is_empty() {
            lines.push("No backups found.".to_string());
        } else {
            lines.push("Backups:".to_string());
            for (i, backup) in backups.iter().enumerate() {
                let age = format_duration(backup.age(now).num_milliseconds().max(0) as u64);
                let expired = if backup.is_expired(now) { " [EXPIRED]" } else { "" };
                lines.push(format!(
                    "{}. {} ({}) {} ago{}",
                    i + 1,
                    backup.backup_id,
                    backup.backup_type,
                    age,
                    expired
                ));
                lines.push(format!("   Created: {}", backup.backed_up_at.to_rfc3339()));
                lines.push(format!("   Messages: {}", backup.session.messages.len()));
                lines.push(String::new());
            }
        }

        lines.push("=== End of Report ===".to_string());
        Ok(lines.join("\n"))
    }
}

/// Session ids end up in file names
fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.contains(['/', '\\'])
    {
        return Err(SyncError::InvalidInput(format!(
            "session id not usable as a backup key: {:?}",
            session_id
        )));
    }
    Ok(())
}

/// One JSON file per backup in a directory
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    dir: PathBuf,
    retention: Duration,
}

impl FileBackupStore {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backup_dir.clone(), config.retention())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    /// Written to a temp file, then hard-linked into place so an existing
    /// backup file is never replaced.
    async fn write(&self, entry: &BackupEntry) -> Result<bool> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = entry.file_name();
        let path = self.dir.join(&file_name);
        let tmp = self.dir.join(format!(
            ".{}.{}-{}.tmp",
            file_name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let json = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&tmp, json).await?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temp backup file");
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<BackupEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let is_history = path
                .file_name()
                .is_some_and(|name| name == HISTORY_FILE_NAME);
            if !is_json || is_history {
                continue;
            }

            let parsed = tokio::fs::read(&path)
                .await
                .map_err(SyncError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<BackupEntry>(&bytes)?));
            match parsed {
                Ok(mut entry) => {
                    entry.backup_id =
                        backup_id(&entry.session_id, entry.timestamp, entry.backup_type);
                    entries.push(entry);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable backup file");
                }
            }
        }
        Ok(entries)
    }

    async fn remove(&self, entry: &BackupEntry) -> Result<()> {
        tokio::fs::remove_file(self.dir.join(entry.file_name())).await?;
        Ok(())
    }

    fn retention(&self) -> Duration {
        self.retention
    }
}

/// In-process backup store
#[derive(Debug)]
pub struct MemoryBackupStore {
    entries: RwLock<HashMap<String, BackupEntry>>,
    retention: Duration,
}

impl MemoryBackupStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryBackupStore {
    fn default() -> Self {
        Self::new(Duration::days(30))
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn write(&self, entry: &BackupEntry) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.backup_id) {
            return Ok(false);
        }
        entries.insert(entry.backup_id.clone(), entry.clone());
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<BackupEntry>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    async fn remove(&self, entry: &BackupEntry) -> Result<()> {
        self.entries.write().remove(&entry.backup_id);
        Ok(())
    }

    fn retention(&self) -> Duration {
        self.retention
    }
}

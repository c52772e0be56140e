//! Append-only resolution history
//!
//! One entry per resolution attempt, newest kept, oldest dropped once the
//! history reaches its cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SyncError};
use crate::sync::conflict::{ConflictReason, ConflictReport, ConflictType, Severity};
use crate::types::SyncConfig;

/// File name of the history inside the backup directory
pub const HISTORY_FILE_NAME: &str = "resolution-history.json";

/// Default number of entries kept
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Audit row for one resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub resolved_at: DateTime<Utc>,
    pub conflict_type: ConflictType,
    pub conflict_severity: Severity,
    pub resolution_strategy: String,
    pub success: bool,
    #[serde(default)]
    pub auto_merged: bool,
    pub conflict_reason: ConflictReason,
    pub backup_created: bool,
    /// First backup taken, kept for readers of the single-backup format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_ids: Vec<String>,
}

impl HistoryEntry {
    pub fn new(
        session_id: impl Into<String>,
        report: &ConflictReport,
        strategy: impl Into<String>,
        success: bool,
        auto_merged: bool,
        backup_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            timestamp: now.timestamp_millis(),
            resolved_at: now,
            conflict_type: report.conflict_type,
            conflict_severity: report.severity,
            resolution_strategy: strategy.into(),
            success,
            auto_merged,
            conflict_reason: report.reason,
            backup_created: !backup_ids.is_empty(),
            backup_id: backup_ids.first().cloned(),
            backup_ids,
        }
    }
}

/// Filter for querying history
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub session_id: Option<String>,
    /// Most recent N matching entries
    pub limit: Option<usize>,
}

/// Apply a filter to entries stored oldest first; result is newest first
pub fn apply_filter(entries: &[HistoryEntry], filter: &HistoryFilter) -> Vec<HistoryEntry> {
    let mut matching: Vec<HistoryEntry> = entries
        .iter()
        .filter(|e| {
            filter
                .session_id
                .as_ref()
                .map_or(true, |id| &e.session_id == id)
        })
        .cloned()
        .collect();

    if let Some(limit) = filter.limit {
        let skip = matching.len().saturating_sub(limit);
        matching.drain(..skip);
    }

    matching.reverse();
    matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matching
}

fn push_capped(entries: &mut Vec<HistoryEntry>, entry: HistoryEntry, cap: usize) {
    entries.push(entry);
    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(..excess);
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<()>;

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>>;
}

/// History kept as a JSON array in a single file, rewritten atomically
#[derive(Debug)]
pub struct FileHistoryStore {
    path: PathBuf,
    cap: usize,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            path: path.into(),
            cap,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `resolution-history.json` inside the configured backup directory
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backup_dir.join(HISTORY_FILE_NAME), config.history_limit)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty history; any other failure is an error
    async fn read_entries(&self) -> Result<Vec<HistoryEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Move an unparseable history out of the way so the next write
    /// does not replace it
    async fn quarantine(&self) -> Result<PathBuf> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().timestamp_millis()));
        let aside = PathBuf::from(name);
        tokio::fs::rename(&self.path, &aside).await?;
        Ok(aside)
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = match self.read_entries().await {
            Ok(entries) => entries,
            Err(SyncError::Serialization(e)) => {
                let aside = self.quarantine().await?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "History file unparseable, moved aside"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        push_capped(&mut entries, entry, self.cap);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        let entries = self.read_entries().await?;
        Ok(apply_filter(&entries, filter))
    }
}

/// In-process history
#[derive(Debug)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
    cap: usize,
}

impl MemoryHistoryStore {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<()> {
        push_capped(&mut self.entries.write(), entry, self.cap);
        Ok(())
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        Ok(apply_filter(&self.entries.read(), filter))
    }
}

//! Core types for session-sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::conflict::MergeStrategy;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A single message in a session. Identity is `id`; messages are never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within a session
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Override the creation timestamp
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Key used to detect the same message recorded under different ids
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.role,
            self.content,
            self.created_at.to_rfc3339()
        )
    }

    /// Truncated content for summaries
    pub fn preview(&self, max_chars: usize) -> String {
        self.content.chars().take(max_chars).collect()
    }
}

/// A file referenced by the session context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl FileRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_hash: None,
            size_bytes: None,
        }
    }
}

/// Working context attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Audit record attached to versions produced by a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResolution {
    pub strategy: String,
    pub local_number: u64,
    pub cloud_number: u64,
}

/// Version stamp of a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    /// Monotonic counter, starts at 1
    pub number: u64,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<VersionResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Version {
    /// Bare version stamp, mostly useful for baselines and fixtures
    pub fn new(number: u64, timestamp: DateTime<Utc>, device_id: impl Into<String>) -> Self {
        Self {
            number,
            timestamp,
            device_id: device_id.into(),
            author: "system".to_string(),
            previous_number: None,
            previous_timestamp: None,
            resolution: None,
            synced_at: None,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.number, self.timestamp.to_rfc3339())
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub version: Version,
    pub message_count: usize,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Integrity hash of messages + context, see [`snapshot_hash`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Baseline carried by the local replica when the caller supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appended_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicates_removed: Option<usize>,
    #[serde(default)]
    pub conflict_resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<String>,
    #[serde(default)]
    pub auto_merged: bool,
}

/// Immutable view of one replica at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub meta: SessionMeta,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub context: SessionContext,
}

impl SessionSnapshot {
    /// Create an empty snapshot
    pub fn new(session_id: impl Into<String>, version: Version) -> Self {
        let device = version.device_id.clone();
        let updated_at = version.timestamp;
        Self {
            meta: SessionMeta {
                session_id: session_id.into(),
                version,
                message_count: 0,
                device,
                project_path: None,
                updated_at,
                hash: None,
                last_synced_version: None,
                restored_from: None,
                restored_at: None,
                merge_strategy: None,
                appended_count: None,
                duplicates_removed: None,
                conflict_resolved: false,
                resolution_strategy: None,
                auto_merged: false,
            },
            messages: Vec::new(),
            context: SessionContext::default(),
        }
    }

    /// Replace the message list, keeping `messageCount` in step
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.meta.message_count = messages.len();
        self.messages = messages;
        self
    }

    /// Replace the context; the project path is mirrored into the metadata
    pub fn with_context(mut self, context: SessionContext) -> Self {
        if context.project_path.is_some() {
            self.meta.project_path = context.project_path.clone();
        }
        self.context = context;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.meta.session_id
    }

    pub fn version(&self) -> &Version {
        &self.meta.version
    }

    pub fn message_ids(&self) -> HashSet<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }

    /// Stamp `meta.hash` with the current content hash
    pub fn with_hash(mut self) -> Self {
        self.meta.hash = Some(snapshot_hash(&self));
        self
    }

    /// True when `meta.hash` is present and matches the content
    pub fn verify_hash(&self) -> bool {
        self.meta
            .hash
            .as_deref()
            .map(|h| h == snapshot_hash(self))
            .unwrap_or(false)
    }
}

/// SHA-256 over the serialized messages and context.
///
/// Metadata is excluded so that re-stamping versions does not change the hash.
pub fn snapshot_hash(snapshot: &SessionSnapshot) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(
        serde_json::to_string(&snapshot.messages)
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(
        serde_json::to_string(&snapshot.context)
            .unwrap_or_default()
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding backup files and the resolution history
    pub backup_dir: PathBuf,
    /// Backup retention window in days
    pub retention_days: i64,
    /// Maximum number of history entries kept
    pub history_limit: usize,
    /// Timeout applied to every store / provider call
    pub io_timeout_ms: u64,
    /// Retries for retryable snapshot fetch failures
    pub max_io_retries: u32,
    /// Treat a missing baseline with diverging versions as a conflict
    pub require_baseline: bool,
    /// SQLite file for the sync-status store (None = in-memory)
    pub state_db_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            backup_dir: data_dir.join("backups"),
            retention_days: 30,
            history_limit: 100,
            io_timeout_ms: 10_000,
            max_io_retries: 3,
            require_baseline: false,
            state_db_path: Some(data_dir.join("sync-state.db")),
        }
    }
}

impl SyncConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

/// Base directory for persisted state (`~/.local/share/session-sync` on Linux)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-sync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_role_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(role, parsed);
        }
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = SessionSnapshot::new("s1", Version::new(1, ts(0), "dev"))
            .with_messages(vec![Message::new("m1", Role::User, "hi").at(ts(1))]);
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["meta"]["sessionId"], "s1");
        assert_eq!(json["meta"]["messageCount"], 1);
        assert_eq!(json["meta"]["version"]["deviceId"], "dev");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["messages"][0]["createdAt"].is_string());
    }

    #[test]
    fn test_hash_ignores_metadata() {
        let snapshot = SessionSnapshot::new("s1", Version::new(1, ts(0), "dev"))
            .with_messages(vec![Message::new("m1", Role::User, "hi").at(ts(1))])
            .with_hash();
        assert!(snapshot.verify_hash());

        let mut restamped = snapshot.clone();
        restamped.meta.version.number = 7;
        assert!(restamped.verify_hash());

        let mut tampered = snapshot;
        tampered.messages[0].content = "bye".to_string();
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn test_missing_hash_does_not_verify() {
        let snapshot = SessionSnapshot::new("s1", Version::new(1, ts(0), "dev"));
        assert!(!snapshot.verify_hash());
    }

    #[test]
    fn test_dedup_key() {
        let m = Message::new("m1", Role::Assistant, "hello").at(ts(5));
        assert!(m.dedup_key().starts_with("assistant|hello|"));
    }
}

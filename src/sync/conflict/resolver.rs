//! Conflict resolution
//!
//! The coordinator turns a [`ConflictReport`] and an explicitly chosen
//! [`ResolutionStrategy`] into a resolved snapshot. Every superseded replica
//! is backed up before success is reported, and every attempt is recorded in
//! the resolution history. At most one resolution runs per session at a time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{
    AutoMergeAssessment, AutoMergeAssessor, ConflictReason, ConflictReport, ConflictType,
    ContextPolicy, DiffResult, MergeEngine, MetadataConflict, RecommendedAction, Severity,
};
use crate::error::{Result, SyncError};
use crate::storage::{BackupStore, BackupType, HistoryEntry, HistoryStore};
use crate::sync::version::{validate_version, VersionClock};
use crate::types::{Role, SessionSnapshot, Version};

const BACKUP_REASON: &str = "conflict_resolution";

/// Strategy names as offered to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// No conflict, push or pull
    Sync,
    KeepLocal,
    KeepCloud,
    ManualMerge,
    MergeMetadata,
    AutoMerge,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sync => "sync",
            StrategyKind::KeepLocal => "keep_local",
            StrategyKind::KeepCloud => "keep_cloud",
            StrategyKind::ManualMerge => "manual_merge",
            StrategyKind::MergeMetadata => "merge_metadata",
            StrategyKind::AutoMerge => "auto_merge",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sync" => Ok(StrategyKind::Sync),
            "keep_local" => Ok(StrategyKind::KeepLocal),
            "keep_cloud" => Ok(StrategyKind::KeepCloud),
            "manual_merge" => Ok(StrategyKind::ManualMerge),
            "merge_metadata" => Ok(StrategyKind::MergeMetadata),
            "auto_merge" => Ok(StrategyKind::AutoMerge),
            other => Err(SyncError::UnknownResolutionStrategy(other.to_string())),
        }
    }
}

/// A resolution chosen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepCloud,
    /// With `None` the coordinator only returns a preview
    ManualMerge { merged: Option<SessionSnapshot> },
    /// Field-wise context merge plus message union; metadata conflicts only
    MergeMetadata,
    AutoMerge,
}

impl ResolutionStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ResolutionStrategy::KeepLocal => StrategyKind::KeepLocal,
            ResolutionStrategy::KeepCloud => StrategyKind::KeepCloud,
            ResolutionStrategy::ManualMerge { .. } => StrategyKind::ManualMerge,
            ResolutionStrategy::MergeMetadata => StrategyKind::MergeMetadata,
            ResolutionStrategy::AutoMerge => StrategyKind::AutoMerge,
        }
    }

    /// Build from a strategy name; `merged` only applies to manual merges
    pub fn from_kind(kind: StrategyKind, merged: Option<SessionSnapshot>) -> Result<Self> {
        match kind {
            StrategyKind::KeepLocal => Ok(ResolutionStrategy::KeepLocal),
            StrategyKind::KeepCloud => Ok(ResolutionStrategy::KeepCloud),
            StrategyKind::ManualMerge => Ok(ResolutionStrategy::ManualMerge { merged }),
            StrategyKind::MergeMetadata => Ok(ResolutionStrategy::MergeMetadata),
            StrategyKind::AutoMerge => Ok(ResolutionStrategy::AutoMerge),
            StrategyKind::Sync => Err(SyncError::UnknownResolutionStrategy(
                kind.as_str().to_string(),
            )),
        }
    }
}

/// Short description of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    /// Version number only
    pub version: u64,
    pub message_count: usize,
    pub last_updated: DateTime<Utc>,
    pub device: String,
    pub project_path: Option<String>,
    /// Start of the last message
    pub preview: String,
}

pub fn summarize_session(session: &SessionSnapshot) -> SessionSummary {
    SessionSummary {
        session_id: session.meta.session_id.clone(),
        version: session.meta.version.number,
        message_count: session.messages.len(),
        last_updated: session.meta.updated_at,
        device: session.meta.device.clone(),
        project_path: session
            .meta
            .project_path
            .clone()
            .or_else(|| session.context.project_path.clone()),
        preview: session
            .messages
            .last()
            .map(|m| m.preview(200))
            .unwrap_or_else(|| "No messages".to_string()),
    }
}

/// One side-only message in [`ConflictDetails`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub preview: String,
}

/// One edited message in [`ConflictDetails`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlapPreview {
    pub id: String,
    /// Creation time on the local side
    pub created_at: Option<DateTime<Utc>>,
    pub local_preview: String,
    pub cloud_preview: String,
}

/// Human-oriented view of a conflict, used for manual merges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub reason: ConflictReason,
    pub local_version: Option<Version>,
    pub cloud_version: Option<Version>,
    /// Baseline the report was classified against, if known
    pub last_synced_version: Option<Version>,
    pub only_local: Vec<MessagePreview>,
    pub only_cloud: Vec<MessagePreview>,
    pub modified_overlap: Vec<OverlapPreview>,
    pub metadata: Option<MetadataConflict>,
    pub local_summary: Option<SessionSummary>,
    pub cloud_summary: Option<SessionSummary>,
}

fn content_preview(content: &str) -> String {
    content.chars().take(100).collect()
}

impl ConflictDetails {
    pub fn from_report(report: &ConflictReport) -> Self {
        let to_preview = |m: &crate::types::Message| MessagePreview {
            id: m.id.clone(),
            role: m.role,
            created_at: m.created_at,
            preview: m.preview(100),
        };
        let empty = DiffResult::default();
        let diff = report.data_conflict.as_ref().unwrap_or(&empty);
        let local_created = |id: &str| {
            report
                .local_session
                .as_ref()
                .and_then(|s| s.messages.iter().find(|m| m.id == id))
                .map(|m| m.created_at)
        };

        Self {
            conflict_type: report.conflict_type,
            severity: report.severity,
            reason: report.reason,
            local_version: report.local_session.as_ref().map(|s| s.meta.version.clone()),
            cloud_version: report.cloud_session.as_ref().map(|s| s.meta.version.clone()),
            last_synced_version: report
                .version_conflict
                .as_ref()
                .and_then(|v| v.last_synced.clone()),
            only_local: diff.only_local.iter().map(to_preview).collect(),
            only_cloud: diff.only_cloud.iter().map(to_preview).collect(),
            modified_overlap: diff
                .modified_overlap
                .iter()
                .map(|m| OverlapPreview {
                    id: m.id.clone(),
                    created_at: local_created(&m.id),
                    local_preview: content_preview(&m.local_content),
                    cloud_preview: content_preview(&m.cloud_content),
                })
                .collect(),
            metadata: report.metadata_conflict.clone(),
            local_summary: report.local_session.as_ref().map(summarize_session),
            cloud_summary: report.cloud_session.as_ref().map(summarize_session),
        }
    }

    /// Plain-text rendering with session summaries and edited messages
    pub fn render(&self) -> String {
        let mut lines = vec![
            "=== Conflict Details ===".to_string(),
            String::new(),
            format!("Type: {}", self.conflict_type),
            format!("Severity: {}", self.severity),
            format!("Reason: {}", self.reason),
            String::new(),
        ];

        for (label, summary) in [("Local", &self.local_summary), ("Cloud", &self.cloud_summary)] {
            let Some(s) = summary else { continue };
            lines.push(format!("{} Session:", label));
            lines.push(format!("  ID: {}", s.session_id));
            lines.push(format!("  Version: v{}", s.version));
            lines.push(format!("  Messages: {}", s.message_count));
            lines.push(format!("  Device: {}", s.device));
            lines.push(format!(
                "  Path: {}",
                s.project_path.as_deref().unwrap_or("N/A")
            ));
            lines.push(format!(
                "  Preview: {}",
                s.preview.chars().take(50).collect::<String>()
            ));
            lines.push(String::new());
        }

        if !self.modified_overlap.is_empty() {
            lines.push("Modified Overlaps:".to_string());
            for (i, m) in self.modified_overlap.iter().enumerate() {
                lines.push(format!("  {}. Message {}", i + 1, m.id));
                lines.push(format!("     Local: {}", m.local_preview));
                lines.push(format!("     Cloud: {}", m.cloud_preview));
            }
            lines.push(String::new());
        }

        lines.push("=== End of Details ===".to_string());
        lines.join("\n")
    }
}

/// Returned instead of a resolution when a manual merge has no merged snapshot yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualMergePreview {
    pub details: ConflictDetails,
    /// Version the merged snapshot will receive
    pub proposed_version: Version,
}

/// Outcome of [`ResolutionCoordinator::resolve`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    /// False only for a manual merge still waiting on the user
    pub success: bool,
    /// Strategy name as recorded in history, e.g. `keep_local` or
    /// `auto_merge_append_cloud`
    pub strategy: String,
    /// Snapshot to write to both replicas, with a new version and hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_session: Option<SessionSnapshot>,
    /// Replica that lost, as it was before resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwritten_session: Option<SessionSnapshot>,
    /// Backups taken before the result was returned, in creation order
    #[serde(default)]
    pub backup_ids: Vec<String>,
    #[serde(default)]
    pub auto_merged: bool,
    /// Set together with `merge_preview`
    #[serde(default)]
    pub requires_user_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_preview: Option<ManualMergePreview>,
    /// Version numbers of the local and cloud replicas that were resolved
    #[serde(default)]
    pub parent_versions: Vec<u64>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionResult {
    /// First backup taken, if any
    pub fn backup_id(&self) -> Option<&str> {
        self.backup_ids.first().map(String::as_str)
    }
}

/// Errors make a result invalid, warnings do not
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

fn validate_session(session: &SessionSnapshot, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    for problem in validate_version(&session.meta.version) {
        errors.push(format!("meta.version: {}", problem));
    }
    if session.meta.session_id.is_empty() {
        errors.push("meta.sessionId: missing".to_string());
    }
    if session.messages.is_empty() {
        warnings.push("session has no messages".to_string());
    }
}

/// Check a resolution outcome before it is handed to a caller
pub fn validate_resolution_result(result: &ResolutionResult) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !result.success {
        errors.push("resolution was not successful".to_string());
    }
    match &result.resolved_session {
        Some(session) => validate_session(session, &mut errors, &mut warnings),
        None => errors.push("resolvedSession: missing".to_string()),
    }

    ValidationReport::from_parts(errors, warnings)
}

/// Like [`validate_resolution_result`], plus auto-merge specific warnings
pub fn validate_merge_result(result: &ResolutionResult) -> ValidationReport {
    let mut report = validate_resolution_result(result);
    if result.success && !result.auto_merged {
        report.warnings.push("session was not auto-merged".to_string());
    }
    report
}

/// Result of [`ResolutionCoordinator::smart_merge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SmartMergeOutcome {
    Merged {
        result: ResolutionResult,
    },
    #[serde(rename_all = "camelCase")]
    ManualInterventionRequired {
        assessment: AutoMergeAssessment,
        recommended_actions: Vec<RecommendedAction>,
        recommended_strategies: Vec<StrategyKind>,
    },
}

/// What a strategy produced before anything is persisted
struct Plan {
    resolved: SessionSnapshot,
    overwritten: Option<SessionSnapshot>,
    backups: Vec<(SessionSnapshot, BackupType)>,
    strategy: String,
    auto_merged: bool,
}

/// Executes resolutions with backups, history and per-session exclusion
pub struct ResolutionCoordinator {
    clock: VersionClock,
    assessor: AutoMergeAssessor,
    merger: MergeEngine,
    backups: Arc<dyn BackupStore>,
    history: Arc<dyn HistoryStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    io_timeout: Duration,
}

impl ResolutionCoordinator {
    pub fn new(
        clock: VersionClock,
        backups: Arc<dyn BackupStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            clock,
            assessor: AutoMergeAssessor::new(),
            merger: MergeEngine::new(),
            backups,
            history,
            locks: DashMap::new(),
            io_timeout: Duration::from_secs(10),
        }
    }

    /// Timeout applied to each backup and history write
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn backups(&self) -> &Arc<dyn BackupStore> {
        &self.backups
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn assessor(&self) -> &AutoMergeAssessor {
        &self.assessor
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the session's lock once no other resolution holds or awaits it
    fn release_lock(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn with_timeout<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| SyncError::Timeout(what.to_string()))?
    }

    /// Resolve a conflict with an explicitly chosen strategy.
    ///
    /// Fails with [`SyncError::NoConflictToResolve`] on a clean report. A
    /// manual merge without a merged snapshot returns a preview with
    /// `requires_user_input` set and persists nothing.
    pub async fn resolve(
        &self,
        report: &ConflictReport,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionResult> {
        if !report.has_conflict {
            return Err(SyncError::NoConflictToResolve);
        }
        let (Some(local), Some(cloud)) = (&report.local_session, &report.cloud_session) else {
            return Err(SyncError::InvalidInput(
                "conflict report is missing a session".to_string(),
            ));
        };
        let session_id = local.meta.session_id.clone();
        let parent_versions = vec![local.meta.version.number, cloud.meta.version.number];

        let lock = self.session_lock(&session_id);
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(report, strategy, local, cloud, &session_id, parent_versions)
                .await
        };
        drop(lock);
        self.release_lock(&session_id);
        result
    }

    async fn resolve_locked(
        &self,
        report: &ConflictReport,
        strategy: ResolutionStrategy,
        local: &SessionSnapshot,
        cloud: &SessionSnapshot,
        session_id: &str,
        parent_versions: Vec<u64>,
    ) -> Result<ResolutionResult> {
        let plan = match strategy {
            ResolutionStrategy::KeepLocal => self.keep_side(local, cloud, StrategyKind::KeepLocal),
            ResolutionStrategy::KeepCloud => self.keep_side(cloud, local, StrategyKind::KeepCloud),
            ResolutionStrategy::ManualMerge { merged: Some(merged) } => {
                if merged.meta.session_id != session_id {
                    return Err(SyncError::ValidationFailed("meta.sessionId".to_string()));
                }
                self.merged_plan(local, cloud, merged, StrategyKind::ManualMerge.as_str(), false)
            }
            ResolutionStrategy::ManualMerge { merged: None } => {
                return Ok(ResolutionResult {
                    success: false,
                    strategy: StrategyKind::ManualMerge.as_str().to_string(),
                    resolved_session: None,
                    overwritten_session: None,
                    backup_ids: Vec::new(),
                    auto_merged: false,
                    requires_user_input: true,
                    merge_preview: Some(ManualMergePreview {
                        details: ConflictDetails::from_report(report),
                        proposed_version: self.clock.merge_version(
                            &local.meta.version,
                            &cloud.meta.version,
                            StrategyKind::ManualMerge.as_str(),
                        ),
                    }),
                    parent_versions,
                    resolved_at: Utc::now(),
                });
            }
            ResolutionStrategy::MergeMetadata => {
                if report.conflict_type != ConflictType::MetadataConflict {
                    return Err(SyncError::InvalidInput(format!(
                        "merge_metadata does not apply to {}",
                        report.conflict_type
                    )));
                }
                let merged = self
                    .merger
                    .clone()
                    .with_context_policy(ContextPolicy::Latest)
                    .merge(cloud, local);
                self.merged_plan(local, cloud, merged, StrategyKind::MergeMetadata.as_str(), false)
            }
            ResolutionStrategy::AutoMerge => {
                let auto = self.assessor.assess(report).into_strategy()?;
                let merged = self.assessor.merged_snapshot(report, auto)?;
                let name = format!("auto_merge_{}", auto);
                self.merged_plan(local, cloud, merged, &name, true)
            }
        };

        let mut errors = Vec::new();
        validate_session(&plan.resolved, &mut errors, &mut Vec::new());
        if let Some(first) = errors.first() {
            let field = first.split(':').next().unwrap_or("resolvedSession");
            return Err(SyncError::ValidationFailed(field.to_string()));
        }

        let mut backup_ids = Vec::with_capacity(plan.backups.len());
        for (snapshot, backup_type) in &plan.backups {
            let created = self
                .with_timeout(
                    "backup write",
                    self.backups.create_backup(snapshot, *backup_type, BACKUP_REASON),
                )
                .await;
            match created {
                Ok(entry) => backup_ids.push(entry.backup_id),
                Err(e) => {
                    let failed = HistoryEntry::new(
                        session_id,
                        report,
                        &plan.strategy,
                        false,
                        plan.auto_merged,
                        backup_ids,
                    );
                    if let Err(history_err) = self
                        .with_timeout("history append", self.history.append(failed))
                        .await
                    {
                        warn!(session_id = %session_id, error = %history_err, "Failed to record failed resolution");
                    }
                    return Err(SyncError::BackupWriteFailed(e.to_string()));
                }
            }
        }

        let entry = HistoryEntry::new(
            session_id,
            report,
            &plan.strategy,
            true,
            plan.auto_merged,
            backup_ids.clone(),
        );
        self.with_timeout("history append", self.history.append(entry))
            .await?;

        info!(
            session_id = %session_id,
            strategy = %plan.strategy,
            version = plan.resolved.meta.version.number,
            backups = backup_ids.len(),
            "Conflict resolved"
        );

        Ok(ResolutionResult {
            success: true,
            strategy: plan.strategy,
            resolved_session: Some(plan.resolved),
            overwritten_session: plan.overwritten,
            backup_ids,
            auto_merged: plan.auto_merged,
            requires_user_input: false,
            merge_preview: None,
            parent_versions,
            resolved_at: Utc::now(),
        })
    }

    /// Auto-merge when the report allows it, otherwise describe the options
    pub async fn smart_merge(&self, report: &ConflictReport) -> Result<SmartMergeOutcome> {
        if !report.has_conflict {
            return Err(SyncError::NoConflictToResolve);
        }

        let assessment = self.assessor.assess(report);
        if !assessment.can_auto_merge {
            return Ok(SmartMergeOutcome::ManualInterventionRequired {
                recommended_actions: AutoMergeAssessor::recommended_actions(&assessment, report),
                recommended_strategies: AutoMergeAssessor::recommended_strategies(report),
                assessment,
            });
        }

        let result = self.resolve(report, ResolutionStrategy::AutoMerge).await?;
        Ok(SmartMergeOutcome::Merged { result })
    }

    /// Keep `chosen`, back up `other`. The new number is one past the higher
    /// of the two replicas so it dominates both.
    fn keep_side(
        &self,
        chosen: &SessionSnapshot,
        other: &SessionSnapshot,
        kind: StrategyKind,
    ) -> Plan {
        let base = match VersionClock::compare(&chosen.meta.version, &other.meta.version) {
            std::cmp::Ordering::Less => &other.meta.version,
            _ => &chosen.meta.version,
        };
        let author = format!("{}_resolution", kind);
        let version = self.clock.increment(base, &author);

        let backup_type = if kind == StrategyKind::KeepLocal {
            BackupType::Cloud
        } else {
            BackupType::Local
        };

        Plan {
            resolved: stamp(chosen.clone(), version, kind.as_str(), false),
            overwritten: Some(other.clone()),
            backups: vec![(other.clone(), backup_type)],
            strategy: kind.as_str().to_string(),
            auto_merged: false,
        }
    }

    /// Merged snapshot stamped with `max(local, cloud) + 1`; both sides are backed up
    fn merged_plan(
        &self,
        local: &SessionSnapshot,
        cloud: &SessionSnapshot,
        merged: SessionSnapshot,
        strategy: &str,
        auto_merged: bool,
    ) -> Plan {
        let version = self
            .clock
            .merge_version(&local.meta.version, &cloud.meta.version, strategy);
        Plan {
            resolved: stamp(merged, version, strategy, auto_merged),
            overwritten: None,
            backups: vec![
                (local.clone(), BackupType::Local),
                (cloud.clone(), BackupType::Cloud),
            ],
            strategy: strategy.to_string(),
            auto_merged,
        }
    }
}

fn stamp(
    mut snapshot: SessionSnapshot,
    version: Version,
    strategy: &str,
    auto_merged: bool,
) -> SessionSnapshot {
    snapshot.meta.updated_at = version.timestamp;
    snapshot.meta.version = version;
    snapshot.meta.message_count = snapshot.messages.len();
    snapshot.meta.conflict_resolved = true;
    snapshot.meta.resolution_strategy = Some(strategy.to_string());
    snapshot.meta.auto_merged = auto_merged;
    snapshot.with_hash()
}

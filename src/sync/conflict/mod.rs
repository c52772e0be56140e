//! Conflict detection, auto-merge assessment and resolution
//!
//! Provides:
//! - Message-level diffing between the local and cloud replicas
//! - Conflict classification with type and severity
//! - Auto-merge eligibility for lossless cases
//! - Merge strategies and the resolution coordinator

mod auto_merge;
mod detector;
mod diff;
mod merge;
mod resolver;

pub use auto_merge::{
    ActionPriority, AssessmentDetails, AssessmentReason, AutoMergeAssessment, AutoMergeAssessor,
    AutoMergePreview, AutoMergeStrategy, RecommendedAction,
};
pub use detector::{ClassifyOptions, ConflictClassifier};
pub use diff::{DataDiffer, DiffResult, ModifiedMessage};
pub use merge::{
    ContextPolicy, MergeEngine, MergePreview, MergeRecommendation, MergeStrategy,
    SessionComparison, SessionState,
};
pub use resolver::{
    summarize_session, validate_merge_result, validate_resolution_result, ConflictDetails,
    ManualMergePreview, MessagePreview, OverlapPreview, ResolutionCoordinator, ResolutionResult,
    ResolutionStrategy, SessionSummary, SmartMergeOutcome, StrategyKind, ValidationReport,
};

use serde::{Deserialize, Serialize};

use super::version::VersionCheck;
use super::SyncDirection;
use crate::types::SessionSnapshot;

/// Kind of divergence between the two replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    None,
    VersionMismatch,
    ConcurrentModification,
    DataConflict,
    MetadataConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::None => "none",
            ConflictType::VersionMismatch => "version_mismatch",
            ConflictType::ConcurrentModification => "concurrent_modification",
            ConflictType::DataConflict => "data_conflict",
            ConflictType::MetadataConflict => "metadata_conflict",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse risk level of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Can be resolved automatically
    Low,
    /// Needs confirmation
    Medium,
    /// Needs manual resolution
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

/// Why a report or version check came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    MissingSessionData,
    BothSidesModified,
    DataDivergence,
    MetadataDivergence,
    ConcurrentModification,
    MissingBaseline,
    FirstSync,
    SameVersion,
    CloudNewer,
    LocalNewer,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::MissingSessionData => "missing_session_data",
            ConflictReason::BothSidesModified => "both_sides_modified",
            ConflictReason::DataDivergence => "data_divergence",
            ConflictReason::MetadataDivergence => "metadata_divergence",
            ConflictReason::ConcurrentModification => "concurrent_modification",
            ConflictReason::MissingBaseline => "missing_baseline",
            ConflictReason::FirstSync => "first_sync",
            ConflictReason::SameVersion => "same_version",
            ConflictReason::CloudNewer => "cloud_newer",
            ConflictReason::LocalNewer => "local_newer",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata field compared between replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataField {
    ProjectPath,
    Device,
    MessageCount,
}

impl std::fmt::Display for MetadataField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MetadataField::ProjectPath => "projectPath",
            MetadataField::Device => "device",
            MetadataField::MessageCount => "messageCount",
        })
    }
}

/// One differing metadata field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFieldConflict {
    pub field: MetadataField,
    /// Local value rendered as text
    pub local: String,
    pub cloud: String,
}

/// All differing metadata fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConflict {
    pub conflicts: Vec<MetadataFieldConflict>,
}

impl MetadataConflict {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of classifying a (local, cloud) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// True when a resolution is required before the replicas can sync
    pub has_conflict: bool,
    pub conflict_type: ConflictType,
    /// Always `Low` when there is no conflict
    pub severity: Severity,
    /// Why the classifier stopped where it did
    pub reason: ConflictReason,
    /// Replicas as classified; resolution reads them from here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_session: Option<SessionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_session: Option<SessionSnapshot>,
    /// Version comparison; absent for data and metadata conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_conflict: Option<VersionCheck>,
    /// Message diff, set for data conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_conflict: Option<DiffResult>,
    /// Differing fields, set for metadata conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_conflict: Option<MetadataConflict>,
    /// Versions differ but one side can simply be copied over the other
    #[serde(default)]
    pub needs_sync: bool,
    /// Which way to copy when `needs_sync` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_direction: Option<SyncDirection>,
}

impl ConflictReport {
    /// Report with no conflict and nothing attached
    pub fn none(reason: ConflictReason) -> Self {
        Self {
            has_conflict: false,
            conflict_type: ConflictType::None,
            severity: Severity::Low,
            reason,
            local_session: None,
            cloud_session: None,
            version_conflict: None,
            data_conflict: None,
            metadata_conflict: None,
            needs_sync: false,
            sync_direction: None,
        }
    }

    /// Session id of whichever replica is present
    pub fn session_id(&self) -> Option<&str> {
        self.local_session
            .as_ref()
            .or(self.cloud_session.as_ref())
            .map(|s| s.session_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_type_serde_names() {
        let json = serde_json::to_string(&ConflictType::ConcurrentModification).unwrap();
        assert_eq!(json, "\"concurrent_modification\"");
        assert_eq!(ConflictType::DataConflict.to_string(), "data_conflict");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_none_report() {
        let report = ConflictReport::none(ConflictReason::MissingSessionData);
        assert!(!report.has_conflict);
        assert_eq!(report.conflict_type, ConflictType::None);
        assert_eq!(report.severity, Severity::Low);
        assert!(report.session_id().is_none());
    }
}

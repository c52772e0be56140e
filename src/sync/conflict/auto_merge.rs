//! Auto-merge eligibility and strategy recommendations

use serde::{Deserialize, Serialize};

use super::{ConflictReport, ConflictType, MergeEngine, StrategyKind};
use crate::error::{Result, SyncError};
use crate::types::SessionSnapshot;

/// Lossless merge direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMergeStrategy {
    /// Local messages are added to the cloud replica
    AppendLocal,
    /// Cloud messages are added to the local replica
    AppendCloud,
}

impl AutoMergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoMergeStrategy::AppendLocal => "append_local",
            AutoMergeStrategy::AppendCloud => "append_cloud",
        }
    }
}

impl std::fmt::Display for AutoMergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AutoMergeStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "append_local" => Ok(AutoMergeStrategy::AppendLocal),
            "append_cloud" => Ok(AutoMergeStrategy::AppendCloud),
            other => Err(SyncError::UnknownMergeStrategy(other.to_string())),
        }
    }
}

/// Why an assessment came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentReason {
    NoConflict,
    NoDataConflict,
    HasModifiedOverlaps,
    BothSidesHaveNewMessages,
    OnlyLocalHasNewMessages,
    OnlyCloudHasNewMessages,
    UnknownConflictPattern,
}

impl AssessmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentReason::NoConflict => "no_conflict",
            AssessmentReason::NoDataConflict => "no_data_conflict",
            AssessmentReason::HasModifiedOverlaps => "has_modified_overlaps",
            AssessmentReason::BothSidesHaveNewMessages => "both_sides_have_new_messages",
            AssessmentReason::OnlyLocalHasNewMessages => "only_local_has_new_messages",
            AssessmentReason::OnlyCloudHasNewMessages => "only_cloud_has_new_messages",
            AssessmentReason::UnknownConflictPattern => "unknown_conflict_pattern",
        }
    }
}

impl std::fmt::Display for AssessmentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts backing an assessment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_overlap_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_local_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_cloud_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_message_count: Option<usize>,
}

/// Whether a report can be merged without losing anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMergeAssessment {
    pub can_auto_merge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<AutoMergeStrategy>,
    pub reason: AssessmentReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<AssessmentDetails>,
}

impl AutoMergeAssessment {
    fn rejected(reason: AssessmentReason, details: Option<AssessmentDetails>) -> Self {
        Self {
            can_auto_merge: false,
            strategy: None,
            reason,
            details,
        }
    }

    /// The strategy, or the rejection as an error
    pub fn into_strategy(self) -> Result<AutoMergeStrategy> {
        match (self.can_auto_merge, self.strategy) {
            (true, Some(strategy)) => Ok(strategy),
            _ => Err(SyncError::CannotAutoMerge(self.reason)),
        }
    }
}

/// Action priority, highest first when sorted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    High,
    Medium,
    Low,
}

/// A suggested next step for a conflict that needs a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedAction {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub description: String,
    pub priority: ActionPriority,
}

impl RecommendedAction {
    fn new(kind: StrategyKind, description: &str, priority: ActionPriority) -> Self {
        Self {
            kind,
            description: description.to_string(),
            priority,
        }
    }
}

/// What an auto-merge would produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMergePreview {
    pub strategy: AutoMergeStrategy,
    pub preview_session: SessionSnapshot,
    pub local_message_count: usize,
    pub cloud_message_count: usize,
    pub merged_message_count: usize,
    /// Messages gained over the larger of the two sides
    pub added_count: i64,
}

/// Decides when a conflict can be merged without a human
#[derive(Debug, Clone, Default)]
pub struct AutoMergeAssessor {
    merger: MergeEngine,
}

impl AutoMergeAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merger(merger: MergeEngine) -> Self {
        Self { merger }
    }

    /// Only data conflicts where exactly one side gained messages and no
    /// shared message was edited are eligible.
    pub fn assess(&self, report: &ConflictReport) -> AutoMergeAssessment {
        if !report.has_conflict {
            return AutoMergeAssessment::rejected(AssessmentReason::NoConflict, None);
        }

        let Some(dc) = &report.data_conflict else {
            return AutoMergeAssessment::rejected(AssessmentReason::NoDataConflict, None);
        };

        let only_local = dc.only_local_count();
        let only_cloud = dc.only_cloud_count();

        if dc.modified_overlap_count() > 0 {
            return AutoMergeAssessment::rejected(
                AssessmentReason::HasModifiedOverlaps,
                Some(AssessmentDetails {
                    modified_overlap_count: Some(dc.modified_overlap_count()),
                    ..Default::default()
                }),
            );
        }

        match (only_local > 0, only_cloud > 0) {
            (true, true) => AutoMergeAssessment::rejected(
                AssessmentReason::BothSidesHaveNewMessages,
                Some(AssessmentDetails {
                    only_local_count: Some(only_local),
                    only_cloud_count: Some(only_cloud),
                    ..Default::default()
                }),
            ),
            (true, false) => AutoMergeAssessment {
                can_auto_merge: true,
                strategy: Some(AutoMergeStrategy::AppendLocal),
                reason: AssessmentReason::OnlyLocalHasNewMessages,
                details: Some(AssessmentDetails {
                    new_message_count: Some(only_local),
                    ..Default::default()
                }),
            },
            (false, true) => AutoMergeAssessment {
                can_auto_merge: true,
                strategy: Some(AutoMergeStrategy::AppendCloud),
                reason: AssessmentReason::OnlyCloudHasNewMessages,
                details: Some(AssessmentDetails {
                    new_message_count: Some(only_cloud),
                    ..Default::default()
                }),
            },
            (false, false) => {
                AutoMergeAssessment::rejected(AssessmentReason::UnknownConflictPattern, None)
            }
        }
    }

    /// Ranked strategies a caller may offer to the user
    pub fn recommended_strategies(report: &ConflictReport) -> Vec<StrategyKind> {
        if !report.has_conflict {
            return vec![StrategyKind::Sync];
        }

        match report.conflict_type {
            ConflictType::ConcurrentModification => vec![
                StrategyKind::KeepLocal,
                StrategyKind::KeepCloud,
                StrategyKind::ManualMerge,
            ],
            ConflictType::DataConflict => {
                let Some(dc) = &report.data_conflict else {
                    return vec![StrategyKind::KeepLocal, StrategyKind::KeepCloud];
                };
                if dc.modified_overlap_count() > 0 {
                    return vec![
                        StrategyKind::KeepLocal,
                        StrategyKind::KeepCloud,
                        StrategyKind::ManualMerge,
                    ];
                }
                let local = dc.only_local_count() > 0;
                let cloud = dc.only_cloud_count() > 0;
                match (local, cloud) {
                    (true, true) => vec![StrategyKind::ManualMerge],
                    (true, false) => vec![StrategyKind::KeepLocal, StrategyKind::ManualMerge],
                    (false, true) => vec![StrategyKind::KeepCloud, StrategyKind::ManualMerge],
                    (false, false) => vec![StrategyKind::KeepLocal, StrategyKind::KeepCloud],
                }
            }
            ConflictType::MetadataConflict => vec![
                StrategyKind::KeepLocal,
                StrategyKind::KeepCloud,
                StrategyKind::MergeMetadata,
            ],
            _ => vec![StrategyKind::KeepLocal, StrategyKind::KeepCloud],
        }
    }

    /// Priority-ordered actions for a conflict that cannot be merged automatically
    pub fn recommended_actions(
        assessment: &AutoMergeAssessment,
        report: &ConflictReport,
    ) -> Vec<RecommendedAction> {
        let mut actions = Vec::new();

        match assessment.reason {
            AssessmentReason::HasModifiedOverlaps => actions.push(RecommendedAction::new(
                StrategyKind::ManualMerge,
                "Review and manually resolve modified messages",
                ActionPriority::High,
            )),
            AssessmentReason::BothSidesHaveNewMessages => {
                actions.push(RecommendedAction::new(
                    StrategyKind::ManualMerge,
                    "Manually merge messages from both sides",
                    ActionPriority::High,
                ));
                actions.push(RecommendedAction::new(
                    StrategyKind::KeepLocal,
                    "Keep local version (discard cloud changes)",
                    ActionPriority::Medium,
                ));
                actions.push(RecommendedAction::new(
                    StrategyKind::KeepCloud,
                    "Keep cloud version (discard local changes)",
                    ActionPriority::Medium,
                ));
            }
            _ => {}
        }

        match report.conflict_type {
            ConflictType::MetadataConflict => actions.push(RecommendedAction::new(
                StrategyKind::MergeMetadata,
                "Resolve metadata conflicts",
                ActionPriority::Low,
            )),
            ConflictType::ConcurrentModification => actions.push(RecommendedAction::new(
                StrategyKind::ManualMerge,
                "Both replicas changed since the last sync; review before choosing a side",
                ActionPriority::High,
            )),
            _ => {}
        }

        actions.sort_by_key(|a| a.priority);
        actions
    }

    /// `(source, target)` for an auto-merge direction
    pub fn merge_sides(
        report: &ConflictReport,
        strategy: AutoMergeStrategy,
    ) -> Result<(&SessionSnapshot, &SessionSnapshot)> {
        let (Some(local), Some(cloud)) = (&report.local_session, &report.cloud_session) else {
            return Err(SyncError::InvalidInput(
                "conflict report is missing a session".to_string(),
            ));
        };
        Ok(match strategy {
            AutoMergeStrategy::AppendLocal => (local, cloud),
            AutoMergeStrategy::AppendCloud => (cloud, local),
        })
    }

    /// Target messages plus the source's exclusive ones, without version stamping.
    ///
    /// Every message id of both sides is kept.
    pub fn merged_snapshot(
        &self,
        report: &ConflictReport,
        strategy: AutoMergeStrategy,
    ) -> Result<SessionSnapshot> {
        let (source, target) = Self::merge_sides(report, strategy)?;
        Ok(self.merger.append(source, target))
    }

    /// Dry-run an auto-merge and summarize the counts
    pub fn preview(
        &self,
        report: &ConflictReport,
        strategy: AutoMergeStrategy,
    ) -> Result<AutoMergePreview> {
        let (source, target) = Self::merge_sides(report, strategy)?;
        let preview_session = self.merged_snapshot(report, strategy)?;

        let (local, cloud) = match strategy {
            AutoMergeStrategy::AppendLocal => (source, target),
            AutoMergeStrategy::AppendCloud => (target, source),
        };
        let local_count = local.messages.len();
        let cloud_count = cloud.messages.len();
        let merged_count = preview_session.messages.len();

        Ok(AutoMergePreview {
            strategy,
            local_message_count: local_count,
            cloud_message_count: cloud_count,
            merged_message_count: merged_count,
            added_count: merged_count as i64 - local_count.max(cloud_count) as i64,
            preview_session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::conflict::{ConflictReason, DataDiffer, Severity};
    use crate::types::{Message, Role, Version};
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, content: &str, secs: i64) -> Message {
        Message::new(id, Role::User, content).at(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn create_data_report(local: Vec<Message>, cloud: Vec<Message>) -> ConflictReport {
        let version = Version::new(1, Utc.timestamp_opt(1_700_000_000, 0).unwrap(), "dev");
        let local = SessionSnapshot::new("s1", version.clone()).with_messages(local);
        let cloud = SessionSnapshot::new("s1", version).with_messages(cloud);
        let diff = DataDiffer::new().diff(&local.messages, &cloud.messages);

        let mut report = ConflictReport::none(ConflictReason::DataDivergence);
        report.has_conflict = true;
        report.conflict_type = ConflictType::DataConflict;
        report.severity = diff.severity();
        report.data_conflict = Some(diff);
        report.local_session = Some(local);
        report.cloud_session = Some(cloud);
        report
    }

    #[test]
    fn test_only_local_is_mergeable() {
        let report = create_data_report(
            vec![msg("m1", "a", 0), msg("m2", "b", 1), msg("m3", "c", 2)],
            vec![msg("m1", "a", 0), msg("m2", "b", 1)],
        );
        let assessment = AutoMergeAssessor::new().assess(&report);
        assert!(assessment.can_auto_merge);
        assert_eq!(assessment.strategy, Some(AutoMergeStrategy::AppendLocal));
        assert_eq!(assessment.reason, AssessmentReason::OnlyLocalHasNewMessages);
        assert_eq!(assessment.details.unwrap().new_message_count, Some(1));
    }

    #[test]
    fn test_only_cloud_is_mergeable() {
        let report = create_data_report(vec![msg("m1", "a", 0)], vec![msg("m1", "a", 0), msg("m2", "b", 1)]);
        let assessment = AutoMergeAssessor::new().assess(&report);
        assert_eq!(assessment.strategy, Some(AutoMergeStrategy::AppendCloud));
    }

    #[test]
    fn test_modified_overlap_blocks_merge() {
        let report = create_data_report(
            vec![msg("m1", "Original", 0), msg("m2", "new", 1)],
            vec![msg("m1", "Modified", 0)],
        );
        let assessment = AutoMergeAssessor::new().assess(&report);
        assert!(!assessment.can_auto_merge);
        assert_eq!(assessment.reason, AssessmentReason::HasModifiedOverlaps);

        let err = assessment.into_strategy().unwrap_err();
        assert_eq!(err.code(), "cannot_auto_merge:has_modified_overlaps");
    }

    #[test]
    fn test_both_sides_blocks_merge() {
        let report = create_data_report(vec![msg("l1", "x", 0)], vec![msg("c1", "y", 0)]);
        let assessment = AutoMergeAssessor::new().assess(&report);
        assert_eq!(assessment.reason, AssessmentReason::BothSidesHaveNewMessages);
        assert_eq!(report.severity, Severity::Medium);
    }

    #[test]
    fn test_non_data_conflicts() {
        let clean = ConflictReport::none(ConflictReason::SameVersion);
        assert_eq!(
            AutoMergeAssessor::new().assess(&clean).reason,
            AssessmentReason::NoConflict
        );

        let mut concurrent = ConflictReport::none(ConflictReason::BothSidesModified);
        concurrent.has_conflict = true;
        concurrent.conflict_type = ConflictType::ConcurrentModification;
        assert_eq!(
            AutoMergeAssessor::new().assess(&concurrent).reason,
            AssessmentReason::NoDataConflict
        );
    }

    #[test]
    fn test_recommended_strategies() {
        let clean = ConflictReport::none(ConflictReason::SameVersion);
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&clean),
            vec![StrategyKind::Sync]
        );

        let both = create_data_report(vec![msg("l1", "x", 0)], vec![msg("c1", "y", 0)]);
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&both),
            vec![StrategyKind::ManualMerge]
        );

        let local = create_data_report(vec![msg("l1", "x", 0)], vec![]);
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&local),
            vec![StrategyKind::KeepLocal, StrategyKind::ManualMerge]
        );

        let mut metadata = ConflictReport::none(ConflictReason::MetadataDivergence);
        metadata.has_conflict = true;
        metadata.conflict_type = ConflictType::MetadataConflict;
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&metadata),
            vec![
                StrategyKind::KeepLocal,
                StrategyKind::KeepCloud,
                StrategyKind::MergeMetadata
            ]
        );
    }

    #[test]
    fn test_edited_overlap_offers_manual_merge() {
        let edited = create_data_report(vec![msg("m1", "Original", 0)], vec![msg("m1", "Modified", 0)]);
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&edited),
            vec![
                StrategyKind::KeepLocal,
                StrategyKind::KeepCloud,
                StrategyKind::ManualMerge
            ]
        );

        // Edits win over exclusive messages when ranking
        let edited_and_new = create_data_report(
            vec![msg("m1", "Original", 0), msg("m2", "new", 1)],
            vec![msg("m1", "Modified", 0)],
        );
        assert_eq!(
            AutoMergeAssessor::recommended_strategies(&edited_and_new),
            vec![
                StrategyKind::KeepLocal,
                StrategyKind::KeepCloud,
                StrategyKind::ManualMerge
            ]
        );
    }

    #[test]
    fn test_merged_snapshot_keeps_identical_messages() {
        // m2 has the same role, content and time as m1 but its own id
        let report = create_data_report(
            vec![msg("m1", "ok", 0), msg("m2", "ok", 0)],
            vec![msg("m1", "ok", 0)],
        );
        let assessor = AutoMergeAssessor::new();
        let strategy = assessor.assess(&report).into_strategy().unwrap();
        assert_eq!(strategy, AutoMergeStrategy::AppendLocal);

        let merged = assessor.merged_snapshot(&report, strategy).unwrap();
        let ids: Vec<&str> = merged.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(merged.meta.appended_count, Some(1));
    }

    #[test]
    fn test_recommended_actions_sorted() {
        let both = create_data_report(vec![msg("l1", "x", 0)], vec![msg("c1", "y", 0)]);
        let assessment = AutoMergeAssessor::new().assess(&both);
        let actions = AutoMergeAssessor::recommended_actions(&assessment, &both);

        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].kind, StrategyKind::ManualMerge);
        assert_eq!(actions[0].priority, ActionPriority::High);
        assert!(actions.windows(2).all(|w| w[0].priority <= w[1].priority));
    }

    #[test]
    fn test_preview_counts() {
        let report = create_data_report(
            vec![msg("m1", "a", 0), msg("m2", "b", 1), msg("m3", "c", 2)],
            vec![msg("m1", "a", 0), msg("m2", "b", 1)],
        );
        let preview = AutoMergeAssessor::new()
            .preview(&report, AutoMergeStrategy::AppendLocal)
            .unwrap();
        assert_eq!(preview.local_message_count, 3);
        assert_eq!(preview.cloud_message_count, 2);
        assert_eq!(preview.merged_message_count, 3);
        assert_eq!(preview.added_count, 0);
    }
}

//! Conflict classification logic

use super::{
    ConflictReason, ConflictReport, ConflictType, DataDiffer, MetadataConflict, MetadataField,
    MetadataFieldConflict, Severity,
};
use crate::sync::version::VersionClock;
use crate::types::{SessionMeta, SessionSnapshot, Version};

/// Caller-supplied classification inputs
#[derive(Debug, Clone, Default)]
pub struct ClassifyOptions {
    /// Last version both replicas agreed on; falls back to the local snapshot's own record
    pub last_synced_version: Option<Version>,
}

impl ClassifyOptions {
    pub fn with_baseline(version: Version) -> Self {
        Self {
            last_synced_version: Some(version),
        }
    }
}

/// Combines version, data and metadata comparison into a [`ConflictReport`]
#[derive(Debug, Clone)]
pub struct ConflictClassifier {
    clock: VersionClock,
    differ: DataDiffer,
}

impl ConflictClassifier {
    pub fn new(clock: VersionClock) -> Self {
        Self {
            clock,
            differ: DataDiffer::new(),
        }
    }

    /// Classify the divergence between the two replicas.
    ///
    /// Never fails: degenerate input yields a report with `has_conflict = false`.
    /// Checks run in order and the first match wins: missing data, concurrent
    /// modification, message divergence, metadata divergence.
    pub fn classify(
        &self,
        local: Option<&SessionSnapshot>,
        cloud: Option<&SessionSnapshot>,
        options: &ClassifyOptions,
    ) -> ConflictReport {
        let (Some(local), Some(cloud)) = (local, cloud) else {
            return ConflictReport::none(ConflictReason::MissingSessionData);
        };

        let baseline = options
            .last_synced_version
            .as_ref()
            .or(local.meta.last_synced_version.as_ref());

        let mut report = ConflictReport::none(ConflictReason::SameVersion);
        report.local_session = Some(local.clone());
        report.cloud_session = Some(cloud.clone());

        let version_check =
            self.clock
                .detect_conflict(&local.meta.version, &cloud.meta.version, baseline);

        if version_check.has_conflict {
            report.has_conflict = true;
            report.conflict_type = ConflictType::ConcurrentModification;
            report.severity = Severity::High;
            report.reason = match version_check.reason {
                ConflictReason::MissingBaseline => ConflictReason::MissingBaseline,
                _ => ConflictReason::BothSidesModified,
            };
            report.version_conflict = Some(version_check);
            tracing::debug!(
                session_id = %local.meta.session_id,
                reason = %report.reason,
                "Concurrent modification detected"
            );
            return report;
        }

        let diff = self.differ.diff(&local.messages, &cloud.messages);
        if !diff.is_empty() {
            report.has_conflict = true;
            report.conflict_type = ConflictType::DataConflict;
            report.severity = diff.severity();
            report.reason = ConflictReason::DataDivergence;
            tracing::debug!(
                session_id = %local.meta.session_id,
                only_local = diff.only_local_count(),
                only_cloud = diff.only_cloud_count(),
                modified = diff.modified_overlap_count(),
                "Data conflict detected"
            );
            report.data_conflict = Some(diff);
            return report;
        }

        let metadata = Self::detect_metadata_conflict(&local.meta, &cloud.meta);
        if !metadata.is_empty() {
            report.has_conflict = true;
            report.conflict_type = ConflictType::MetadataConflict;
            report.severity = Severity::Low;
            report.reason = ConflictReason::MetadataDivergence;
            report.metadata_conflict = Some(metadata);
            return report;
        }

        report.reason = version_check.reason;
        report.needs_sync = version_check.needs_sync;
        report.sync_direction = version_check.direction;
        report.version_conflict = Some(version_check);
        report
    }

    /// Compare `projectPath`, `device` and `messageCount`.
    ///
    /// Path and device only count when both sides carry a value.
    pub fn detect_metadata_conflict(local: &SessionMeta, cloud: &SessionMeta) -> MetadataConflict {
        let mut conflicts = Vec::new();

        if let (Some(l), Some(c)) = (&local.project_path, &cloud.project_path) {
            if l != c {
                conflicts.push(MetadataFieldConflict {
                    field: MetadataField::ProjectPath,
                    local: l.clone(),
                    cloud: c.clone(),
                });
            }
        }

        if !local.device.is_empty() && !cloud.device.is_empty() && local.device != cloud.device {
            conflicts.push(MetadataFieldConflict {
                field: MetadataField::Device,
                local: local.device.clone(),
                cloud: cloud.device.clone(),
            });
        }

        if local.message_count != cloud.message_count {
            conflicts.push(MetadataFieldConflict {
                field: MetadataField::MessageCount,
                local: local.message_count.to_string(),
                cloud: cloud.message_count.to_string(),
            });
        }

        MetadataConflict { conflicts }
    }

    /// Plain-text report for logs and terminals
    pub fn render_report(report: &ConflictReport) -> String {
        if !report.has_conflict {
            return "No conflict detected.".to_string();
        }

        let mut lines = vec![
            "=== Conflict Report ===".to_string(),
            String::new(),
            format!("Type: {}", report.conflict_type),
            format!("Severity: {}", report.severity),
            format!("Reason: {}", report.reason),
            String::new(),
        ];

        if let Some(vc) = &report.version_conflict {
            lines.push("Versions:".to_string());
            lines.push(format!("  Local: v{}", vc.local.number));
            lines.push(format!("  Cloud: v{}", vc.cloud.number));
            if let Some(base) = &vc.last_synced {
                lines.push(format!("  Last synced: v{}", base.number));
            }
            lines.push(String::new());
        }

        if let Some(dc) = &report.data_conflict {
            lines.push("Data Conflicts:".to_string());
            lines.push(format!("  Only in local: {} messages", dc.only_local_count()));
            lines.push(format!("  Only in cloud: {} messages", dc.only_cloud_count()));
            lines.push(format!(
                "  Modified overlaps: {} messages",
                dc.modified_overlap_count()
            ));
            lines.push(String::new());
        }

        if let Some(mc) = &report.metadata_conflict {
            lines.push("Metadata Conflicts:".to_string());
            for c in &mc.conflicts {
                lines.push(format!("  {}:", c.field));
                lines.push(format!("    Local: {}", c.local));
                lines.push(format!("    Cloud: {}", c.cloud));
            }
            lines.push(String::new());
        }

        lines.push("=== End of Report ===".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::sync::SyncDirection;
    use crate::types::{Message, Role};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, content: &str, secs: i64) -> Message {
        Message::new(id, Role::User, content).at(ts(secs))
    }

    fn create_snapshot(number: u64, secs: i64, messages: Vec<Message>) -> SessionSnapshot {
        SessionSnapshot::new("session-1", Version::new(number, ts(secs), "device-a"))
            .with_messages(messages)
    }

    fn classifier() -> ConflictClassifier {
        ConflictClassifier::new(VersionClock::new(Arc::new(StaticIdentity::new("test"))))
    }

    #[test]
    fn test_missing_snapshot() {
        let snapshot = create_snapshot(1, 0, vec![]);
        let report = classifier().classify(Some(&snapshot), None, &ClassifyOptions::default());
        assert!(!report.has_conflict);
        assert_eq!(report.conflict_type, ConflictType::None);
        assert_eq!(report.reason, ConflictReason::MissingSessionData);
    }

    #[test]
    fn test_concurrent_modification_wins_over_data() {
        let local = create_snapshot(3, 10, vec![msg("m1", "a", 0)]);
        let cloud = create_snapshot(3, 20, vec![msg("m1", "b", 0)]);
        let options = ClassifyOptions::with_baseline(Version::new(2, ts(0), "device-a"));

        let report = classifier().classify(Some(&local), Some(&cloud), &options);
        assert!(report.has_conflict);
        assert_eq!(report.conflict_type, ConflictType::ConcurrentModification);
        assert_eq!(report.severity, Severity::High);
        assert!(report.data_conflict.is_none());
    }

    #[test]
    fn test_data_conflict_only_local() {
        let local = create_snapshot(
            3,
            0,
            vec![msg("m1", "a", 0), msg("m2", "b", 1), msg("m3", "c", 2)],
        );
        let cloud = create_snapshot(3, 0, vec![msg("m1", "a", 0), msg("m2", "b", 1)]);

        let report = classifier().classify(Some(&local), Some(&cloud), &ClassifyOptions::default());
        assert_eq!(report.conflict_type, ConflictType::DataConflict);
        assert_eq!(report.severity, Severity::Low);
    }

    #[test]
    fn test_data_conflict_modified_is_high() {
        let local = create_snapshot(1, 0, vec![msg("m1", "Original", 0)]);
        let cloud = create_snapshot(1, 0, vec![msg("m1", "Modified", 0)]);
        let report = classifier().classify(Some(&local), Some(&cloud), &ClassifyOptions::default());
        assert_eq!(report.severity, Severity::High);
        assert_eq!(
            report.data_conflict.as_ref().unwrap().modified_overlap_count(),
            1
        );
    }

    #[test]
    fn test_metadata_conflict() {
        let local = create_snapshot(2, 0, vec![msg("m1", "a", 0)]);
        let mut cloud = local.clone();
        cloud.meta.device = "device-b".to_string();

        let report = classifier().classify(Some(&local), Some(&cloud), &ClassifyOptions::default());
        assert_eq!(report.conflict_type, ConflictType::MetadataConflict);
        assert_eq!(report.severity, Severity::Low);
        let conflicts = &report.metadata_conflict.unwrap().conflicts;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, MetadataField::Device);
    }

    #[test]
    fn test_project_path_needs_both_sides() {
        let mut local = create_snapshot(1, 0, vec![]);
        local.meta.project_path = Some("/work/app".to_string());
        let cloud = create_snapshot(1, 0, vec![]);

        let conflict = ConflictClassifier::detect_metadata_conflict(&local.meta, &cloud.meta);
        assert!(conflict.is_empty());
    }

    #[test]
    fn test_no_conflict_carries_direction() {
        let local = create_snapshot(4, 10, vec![msg("m1", "a", 0)]);
        let cloud = create_snapshot(2, 0, vec![msg("m1", "a", 0)]);
        let options = ClassifyOptions::with_baseline(Version::new(2, ts(0), "device-a"));

        let report = classifier().classify(Some(&local), Some(&cloud), &options);
        assert!(!report.has_conflict);
        assert!(report.needs_sync);
        assert_eq!(report.sync_direction, Some(SyncDirection::Push));
        assert_eq!(report.reason, ConflictReason::LocalNewer);
    }

    #[test]
    fn test_baseline_falls_back_to_local_meta() {
        let mut local = create_snapshot(3, 10, vec![]);
        local.meta.last_synced_version = Some(Version::new(2, ts(0), "device-a"));
        let cloud = create_snapshot(3, 20, vec![]);

        let report = classifier().classify(Some(&local), Some(&cloud), &ClassifyOptions::default());
        assert_eq!(report.conflict_type, ConflictType::ConcurrentModification);
    }

    #[test]
    fn test_render_report() {
        let local = create_snapshot(1, 0, vec![msg("m1", "Original", 0)]);
        let cloud = create_snapshot(1, 0, vec![msg("m1", "Modified", 0)]);
        let report = classifier().classify(Some(&local), Some(&cloud), &ClassifyOptions::default());

        let text = ConflictClassifier::render_report(&report);
        assert!(text.contains("Type: data_conflict"));
        assert!(text.contains("Modified overlaps: 1 messages"));

        let clean = ConflictReport::none(ConflictReason::SameVersion);
        assert_eq!(ConflictClassifier::render_report(&clean), "No conflict detected.");
    }
}

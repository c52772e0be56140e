//! Message-level diff between two replicas

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::Severity;
use crate::types::Message;

/// A message present on both sides whose text diverged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedMessage {
    pub id: String,
    pub local_content: String,
    pub cloud_content: String,
}

/// Partition of two message lists by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub only_local: Vec<Message>,
    pub only_cloud: Vec<Message>,
    pub modified_overlap: Vec<ModifiedMessage>,
}

impl DiffResult {
    pub fn only_local_count(&self) -> usize {
        self.only_local.len()
    }

    pub fn only_cloud_count(&self) -> usize {
        self.only_cloud.len()
    }

    pub fn modified_overlap_count(&self) -> usize {
        self.modified_overlap.len()
    }

    /// No difference at all
    pub fn is_empty(&self) -> bool {
        self.only_local.is_empty() && self.only_cloud.is_empty() && self.modified_overlap.is_empty()
    }

    /// High on edited overlaps, medium when both sides grew, low otherwise
    pub fn severity(&self) -> Severity {
        if !self.modified_overlap.is_empty() {
            Severity::High
        } else if !self.only_local.is_empty() && !self.only_cloud.is_empty() {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Computes [`DiffResult`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDiffer;

impl DataDiffer {
    pub fn new() -> Self {
        Self
    }

    /// Split messages into local-only, cloud-only and edited overlaps.
    ///
    /// Only `content` is compared for overlapping ids. Output keeps input order.
    pub fn diff(&self, local: &[Message], cloud: &[Message]) -> DiffResult {
        let cloud_by_id: HashMap<&str, &Message> =
            cloud.iter().map(|m| (m.id.as_str(), m)).collect();
        let local_ids: HashSet<&str> = local.iter().map(|m| m.id.as_str()).collect();

        let mut result = DiffResult::default();
        for msg in local {
            match cloud_by_id.get(msg.id.as_str()) {
                None => result.only_local.push(msg.clone()),
                Some(cloud_msg) if cloud_msg.content != msg.content => {
                    result.modified_overlap.push(ModifiedMessage {
                        id: msg.id.clone(),
                        local_content: msg.content.clone(),
                        cloud_content: cloud_msg.content.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        result.only_cloud = cloud
            .iter()
            .filter(|m| !local_ids.contains(m.id.as_str()))
            .cloned()
            .collect();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, content: &str) -> Message {
        Message::new(id, Role::User, content).at(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn test_identical_lists() {
        let messages = vec![msg("m1", "a"), msg("m2", "b")];
        let diff = DataDiffer::new().diff(&messages, &messages);
        assert!(diff.is_empty());
        assert_eq!(diff.severity(), Severity::Low);
    }

    #[test]
    fn test_only_local() {
        let local = vec![msg("m1", "a"), msg("m2", "b"), msg("m3", "c")];
        let cloud = vec![msg("m1", "a"), msg("m2", "b")];
        let diff = DataDiffer::new().diff(&local, &cloud);

        assert_eq!(diff.only_local_count(), 1);
        assert_eq!(diff.only_local[0].id, "m3");
        assert_eq!(diff.only_cloud_count(), 0);
        assert_eq!(diff.severity(), Severity::Low);
    }

    #[test]
    fn test_both_sides_grew() {
        let local = vec![msg("m1", "a"), msg("l1", "local")];
        let cloud = vec![msg("m1", "a"), msg("c1", "cloud")];
        let diff = DataDiffer::new().diff(&local, &cloud);

        assert_eq!(diff.only_local_count(), 1);
        assert_eq!(diff.only_cloud_count(), 1);
        assert_eq!(diff.severity(), Severity::Medium);
    }

    #[test]
    fn test_modified_overlap() {
        let local = vec![msg("m1", "Original")];
        let cloud = vec![msg("m1", "Modified")];
        let diff = DataDiffer::new().diff(&local, &cloud);

        assert_eq!(diff.modified_overlap_count(), 1);
        assert_eq!(diff.modified_overlap[0].local_content, "Original");
        assert_eq!(diff.modified_overlap[0].cloud_content, "Modified");
        assert_eq!(diff.severity(), Severity::High);
    }

    #[test]
    fn test_role_and_timestamp_not_compared() {
        let local = vec![msg("m1", "same")];
        let mut other = msg("m1", "same");
        other.role = Role::Assistant;
        other.created_at = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let diff = DataDiffer::new().diff(&local, &[other]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_output_follows_input_order() {
        let local = vec![msg("z", "1"), msg("a", "2"), msg("m", "3")];
        let diff = DataDiffer::new().diff(&local, &[]);
        let ids: Vec<_> = diff.only_local.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
    }
}

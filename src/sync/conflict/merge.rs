//! Session merge strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::SyncError;
use crate::types::{FileRef, Message, SessionContext, SessionSnapshot};

/// How two snapshots are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Discard the target, take the source
    Replace,
    /// Add source messages missing from the target
    Append,
    /// Deduplicated union sorted by creation time
    Merge,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Replace => "replace",
            MergeStrategy::Append => "append",
            MergeStrategy::Merge => "merge",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(MergeStrategy::Replace),
            "append" => Ok(MergeStrategy::Append),
            "merge" => Ok(MergeStrategy::Merge),
            other => Err(SyncError::UnknownMergeStrategy(other.to_string())),
        }
    }
}

/// Context merge policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// Source fields override target fields
    Source,
    /// Target fields override source fields
    Target,
    /// Field-wise: most specific path, union of files and notes
    #[default]
    Latest,
}

/// Whether a session has any messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Empty,
    Active,
}

/// Side-by-side counts used to pick a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionComparison {
    pub source_count: usize,
    pub target_count: usize,
    pub source_last_updated: DateTime<Utc>,
    pub target_last_updated: DateTime<Utc>,
    pub has_overlap: bool,
}

/// Suggested strategy with the options still open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecommendation {
    pub strategy: MergeStrategy,
    pub reason: String,
    pub can_replace: bool,
    pub can_append: bool,
    pub can_merge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// What applying a strategy would produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub strategy: MergeStrategy,
    pub recommended: MergeStrategy,
    pub matches_recommendation: bool,
    pub source_session_id: String,
    pub source_message_count: usize,
    pub target_message_count: usize,
    pub result_message_count: usize,
    pub change: i64,
    pub duplicates_removed: usize,
    pub appended_count: usize,
}

/// Applies merge strategies to pairs of snapshots.
///
/// All operations return a new snapshot and leave their inputs untouched.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    context_policy: ContextPolicy,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context policy used by [`MergeStrategy::Merge`]
    pub fn with_context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    /// Dispatch on the strategy
    pub fn apply(
        &self,
        strategy: MergeStrategy,
        source: &SessionSnapshot,
        target: &SessionSnapshot,
    ) -> SessionSnapshot {
        match strategy {
            MergeStrategy::Replace => self.replace(source),
            MergeStrategy::Append => self.append(source, target),
            MergeStrategy::Merge => self.merge(source, target),
        }
    }

    /// The source verbatim, stamped as restored from itself
    pub fn replace(&self, source: &SessionSnapshot) -> SessionSnapshot {
        let mut result = source.clone();
        result.meta.restored_from = Some(source.meta.session_id.clone());
        result.meta.restored_at = Some(Utc::now());
        result.meta.merge_strategy = Some(MergeStrategy::Replace);
        result
    }

    /// Target messages followed by source messages whose id the target lacks
    pub fn append(&self, source: &SessionSnapshot, target: &SessionSnapshot) -> SessionSnapshot {
        let target_ids = target.message_ids();
        let new_messages: Vec<Message> = source
            .messages
            .iter()
            .filter(|m| !target_ids.contains(m.id.as_str()))
            .cloned()
            .collect();
        let appended = new_messages.len();

        let now = Utc::now();
        let mut result = target.clone();
        result.messages.extend(new_messages);
        result.context = Self::merge_contexts(&source.context, &target.context, ContextPolicy::Source);
        result.meta.message_count = result.messages.len();
        result.meta.updated_at = now;
        result.meta.restored_from = Some(source.meta.session_id.clone());
        result.meta.restored_at = Some(now);
        result.meta.merge_strategy = Some(MergeStrategy::Append);
        result.meta.appended_count = Some(appended);
        result
    }

    /// Union of both sides without duplicates, ordered by creation time.
    ///
    /// Two messages are duplicates when role, content and timestamp match; the
    /// one with the lexicographically larger id is kept.
    pub fn merge(&self, source: &SessionSnapshot, target: &SessionSnapshot) -> SessionSnapshot {
        let mut all: Vec<&Message> = source.messages.iter().chain(&target.messages).collect();
        all.sort_by_key(|m| m.created_at);

        let mut merged: Vec<Message> = Vec::with_capacity(all.len());
        let mut index_by_key: HashMap<String, usize> = HashMap::new();
        for msg in &all {
            let key = msg.dedup_key();
            match index_by_key.get(&key) {
                Some(&idx) => {
                    if merged[idx].id < msg.id {
                        merged[idx] = (*msg).clone();
                    }
                }
                None => {
                    index_by_key.insert(key, merged.len());
                    merged.push((*msg).clone());
                }
            }
        }
        let duplicates_removed = all.len() - merged.len();

        let now = Utc::now();
        let mut result = target.clone();
        result.context = Self::merge_contexts(&source.context, &target.context, self.context_policy);
        if result.context.project_path.is_some() {
            result.meta.project_path = result.context.project_path.clone();
        }
        result.messages = merged;
        result.meta.message_count = result.messages.len();
        result.meta.updated_at = now;
        result.meta.restored_from = Some(source.meta.session_id.clone());
        result.meta.restored_at = Some(now);
        result.meta.merge_strategy = Some(MergeStrategy::Merge);
        result.meta.duplicates_removed = Some(duplicates_removed);
        result
    }

    /// Field-by-field context merge
    pub fn merge_contexts(
        source: &SessionContext,
        target: &SessionContext,
        policy: ContextPolicy,
    ) -> SessionContext {
        match policy {
            ContextPolicy::Source => override_context(target, source),
            ContextPolicy::Target => override_context(source, target),
            ContextPolicy::Latest => SessionContext {
                project_path: merge_project_path(
                    source.project_path.as_deref(),
                    target.project_path.as_deref(),
                ),
                files: merge_files(&target.files, &source.files),
                active_files: merge_active_files(&target.active_files, &source.active_files),
                notes: merge_notes(target.notes.as_deref(), source.notes.as_deref()),
            },
        }
    }

    pub fn session_state(messages: &[Message]) -> SessionState {
        if messages.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Active
        }
    }

    /// True when any message id appears on both sides
    pub fn has_message_overlap(source: &[Message], target: &[Message]) -> bool {
        let source_ids: HashSet<&str> = source.iter().map(|m| m.id.as_str()).collect();
        target.iter().any(|m| source_ids.contains(m.id.as_str()))
    }

    pub fn compare_sessions(source: &SessionSnapshot, target: &SessionSnapshot) -> SessionComparison {
        SessionComparison {
            source_count: source.messages.len(),
            target_count: target.messages.len(),
            source_last_updated: source.meta.updated_at,
            target_last_updated: target.meta.updated_at,
            has_overlap: Self::has_message_overlap(&source.messages, &target.messages),
        }
    }

    /// Pick a strategy for two sessions that differ without a flagged conflict
    pub fn recommend_strategy(
        source: &SessionSnapshot,
        target: &SessionSnapshot,
    ) -> MergeRecommendation {
        if Self::session_state(&target.messages) == SessionState::Empty {
            return MergeRecommendation {
                strategy: MergeStrategy::Replace,
                reason: "target session is empty".to_string(),
                can_replace: true,
                can_append: false,
                can_merge: false,
                warning: None,
            };
        }

        let comparison = Self::compare_sessions(source, target);
        if comparison.has_overlap {
            return MergeRecommendation {
                strategy: MergeStrategy::Merge,
                reason: "sessions have overlapping messages".to_string(),
                can_replace: true,
                can_append: false,
                can_merge: true,
                warning: Some(
                    "Some messages may be duplicated if not merged carefully".to_string(),
                ),
            };
        }

        if comparison.source_last_updated > comparison.target_last_updated {
            return MergeRecommendation {
                strategy: MergeStrategy::Append,
                reason: "source session is newer and has no overlap".to_string(),
                can_replace: true,
                can_append: true,
                can_merge: true,
                warning: None,
            };
        }

        MergeRecommendation {
            strategy: MergeStrategy::Replace,
            reason: "source session is older".to_string(),
            can_replace: true,
            can_append: false,
            can_merge: false,
            warning: Some("Replacing discards the target messages".to_string()),
        }
    }

    /// Dry-run a strategy and report the effect
    pub fn preview(
        &self,
        source: &SessionSnapshot,
        target: &SessionSnapshot,
        strategy: MergeStrategy,
    ) -> MergePreview {
        let recommended = Self::recommend_strategy(source, target).strategy;
        let result = self.apply(strategy, source, target);
        MergePreview {
            strategy,
            recommended,
            matches_recommendation: strategy == recommended,
            source_session_id: source.meta.session_id.clone(),
            source_message_count: source.messages.len(),
            target_message_count: target.messages.len(),
            result_message_count: result.messages.len(),
            change: result.messages.len() as i64 - target.messages.len() as i64,
            duplicates_removed: result.meta.duplicates_removed.unwrap_or(0),
            appended_count: result.meta.appended_count.unwrap_or(0),
        }
    }
}

/// `base` with every field `top` actually sets taken from `top`
fn override_context(base: &SessionContext, top: &SessionContext) -> SessionContext {
    SessionContext {
        project_path: top.project_path.clone().or_else(|| base.project_path.clone()),
        files: if top.files.is_empty() {
            base.files.clone()
        } else {
            top.files.clone()
        },
        active_files: if top.active_files.is_empty() {
            base.active_files.clone()
        } else {
            top.active_files.clone()
        },
        notes: top.notes.clone().or_else(|| base.notes.clone()),
    }
}

/// The longer path is taken as the more specific one
fn merge_project_path(source: Option<&str>, target: Option<&str>) -> Option<String> {
    match (source, target) {
        (Some(s), Some(t)) if s.len() > t.len() => Some(s.to_string()),
        (_, Some(t)) => Some(t.to_string()),
        (Some(s), None) => Some(s.to_string()),
        (None, None) => None,
    }
}

/// Dedupe by path, later entries replace earlier ones in place
fn merge_files(first: &[FileRef], second: &[FileRef]) -> Vec<FileRef> {
    let mut files: Vec<FileRef> = Vec::new();
    let mut index_by_path: HashMap<&str, usize> = HashMap::new();
    for file in first.iter().chain(second) {
        match index_by_path.get(file.path.as_str()) {
            Some(&idx) => files[idx] = file.clone(),
            None => {
                index_by_path.insert(file.path.as_str(), files.len());
                files.push(file.clone());
            }
        }
    }
    files
}

fn merge_active_files(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .iter()
        .chain(second)
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

/// Notes from both sides joined by a `---` separator; identical notes are kept once
fn merge_notes(target: Option<&str>, source: Option<&str>) -> Option<String> {
    match (target, source) {
        (Some(t), Some(s)) if t == s => Some(t.to_string()),
        (Some(t), Some(s)) => Some(format!("{}\n\n---\n\n{}", t, s)),
        (Some(t), None) => Some(t.to_string()),
        (None, Some(s)) => Some(s.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, Version};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, content: &str, secs: i64) -> Message {
        Message::new(id, Role::User, content).at(ts(secs))
    }

    fn create_session(id: &str, updated: i64, messages: Vec<Message>) -> SessionSnapshot {
        let mut s = SessionSnapshot::new(id, Version::new(1, ts(updated), "dev")).with_messages(messages);
        s.meta.updated_at = ts(updated);
        s
    }

    fn ids(snapshot: &SessionSnapshot) -> Vec<&str> {
        snapshot.messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_replace() {
        let source = create_session("src", 0, vec![msg("a", "x", 0)]);
        let result = MergeEngine::new().replace(&source);
        assert_eq!(result.messages, source.messages);
        assert_eq!(result.meta.restored_from.as_deref(), Some("src"));
        assert_eq!(result.meta.merge_strategy, Some(MergeStrategy::Replace));
    }

    #[test]
    fn test_append_skips_known_ids() {
        let source = create_session("src", 10, vec![msg("m1", "a", 0), msg("m3", "c", 2)]);
        let target = create_session("dst", 0, vec![msg("m1", "a", 0), msg("m2", "b", 1)]);

        let result = MergeEngine::new().append(&source, &target);
        assert_eq!(ids(&result), vec!["m1", "m2", "m3"]);
        assert_eq!(result.meta.appended_count, Some(1));
        assert_eq!(result.meta.message_count, 3);
        assert_eq!(result.meta.session_id, "dst");
    }

    #[test]
    fn test_append_context_override() {
        let mut source = create_session("src", 10, vec![]);
        source.context.notes = Some("source notes".to_string());
        let mut target = create_session("dst", 0, vec![]);
        target.context.project_path = Some("/p".to_string());
        target.context.notes = Some("target notes".to_string());

        let result = MergeEngine::new().append(&source, &target);
        assert_eq!(result.context.project_path.as_deref(), Some("/p"));
        assert_eq!(result.context.notes.as_deref(), Some("source notes"));
    }

    #[test]
    fn test_merge_sorts_and_dedupes() {
        let source = create_session("src", 0, vec![msg("b", "same", 5), msg("s1", "two", 2)]);
        let target = create_session("dst", 0, vec![msg("a", "same", 5), msg("t1", "one", 1)]);

        let result = MergeEngine::new().merge(&source, &target);
        assert_eq!(ids(&result), vec!["t1", "s1", "b"]);
        assert_eq!(result.meta.duplicates_removed, Some(1));
    }

    #[test]
    fn test_merge_disjoint_keeps_everything() {
        let source = create_session("src", 0, vec![msg("s1", "x", 1), msg("s2", "y", 3)]);
        let target = create_session("dst", 0, vec![msg("t1", "z", 2)]);
        let result = MergeEngine::new().merge(&source, &target);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.meta.duplicates_removed, Some(0));
    }

    #[test]
    fn test_latest_context_policy() {
        let source = SessionContext {
            project_path: Some("/work/app/sub".to_string()),
            files: vec![FileRef::new("a.rs"), FileRef::new("b.rs")],
            active_files: vec!["a.rs".to_string(), "c.rs".to_string()],
            notes: Some("from source".to_string()),
        };
        let target = SessionContext {
            project_path: Some("/work/app".to_string()),
            files: vec![FileRef::new("a.rs")],
            active_files: vec!["a.rs".to_string()],
            notes: Some("from target".to_string()),
        };

        let merged = MergeEngine::merge_contexts(&source, &target, ContextPolicy::Latest);
        assert_eq!(merged.project_path.as_deref(), Some("/work/app/sub"));
        assert_eq!(merged.files.len(), 2);
        assert_eq!(merged.active_files, vec!["a.rs".to_string(), "c.rs".to_string()]);
        assert_eq!(
            merged.notes.as_deref(),
            Some("from target\n\n---\n\nfrom source")
        );
    }

    #[test]
    fn test_target_policy() {
        let source = SessionContext {
            project_path: Some("/src".to_string()),
            ..Default::default()
        };
        let target = SessionContext {
            project_path: Some("/dst".to_string()),
            ..Default::default()
        };
        let merged = MergeEngine::merge_contexts(&source, &target, ContextPolicy::Target);
        assert_eq!(merged.project_path.as_deref(), Some("/dst"));
    }

    #[test]
    fn test_recommend_strategy() {
        let empty = create_session("dst", 0, vec![]);
        let older = create_session("dst", 0, vec![msg("t1", "z", 0)]);
        let newer = create_session("src", 100, vec![msg("s1", "x", 50)]);
        let overlapping = create_session("src", 100, vec![msg("t1", "z", 0)]);

        assert_eq!(
            MergeEngine::recommend_strategy(&newer, &empty).strategy,
            MergeStrategy::Replace
        );
        assert_eq!(
            MergeEngine::recommend_strategy(&newer, &older).strategy,
            MergeStrategy::Append
        );
        assert_eq!(
            MergeEngine::recommend_strategy(&overlapping, &older).strategy,
            MergeStrategy::Merge
        );
        assert_eq!(
            MergeEngine::recommend_strategy(&older, &newer).strategy,
            MergeStrategy::Replace
        );
    }

    #[test]
    fn test_preview() {
        let source = create_session("src", 100, vec![msg("s1", "x", 50)]);
        let target = create_session("dst", 0, vec![msg("t1", "z", 0)]);
        let preview = MergeEngine::new().preview(&source, &target, MergeStrategy::Append);
        assert!(preview.matches_recommendation);
        assert_eq!(preview.result_message_count, 2);
        assert_eq!(preview.change, 1);
        assert_eq!(preview.appended_count, 1);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("merge".parse::<MergeStrategy>().unwrap(), MergeStrategy::Merge);
        let err = "squash".parse::<MergeStrategy>().unwrap_err();
        assert_eq!(err.code(), "unknown_merge_strategy");
    }
}

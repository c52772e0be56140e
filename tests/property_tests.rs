//! Property-based tests for session-sync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Classification is deterministic
//! - Resolution never silently drops a message
//! - Resolved versions dominate both replicas
//! - Edited messages are never auto-merged
//!
//! Run with: cargo test --test property_tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use session_sync::storage::{BackupFilter, BackupStore, MemoryBackupStore, MemoryHistoryStore};
use session_sync::sync::conflict::{
    AutoMergeAssessor, ClassifyOptions, ConflictClassifier, ConflictReport, DataDiffer,
    MergeEngine, ResolutionCoordinator, ResolutionStrategy,
};
use session_sync::sync::VersionClock;
use session_sync::{Message, Role, SessionSnapshot, StaticIdentity, Version};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn clock() -> VersionClock {
    VersionClock::new(Arc::new(StaticIdentity::new("prop")))
}

/// Messages keyed by id; the creation time is derived from the id so both
/// replicas agree on it.
fn messages(entries: &BTreeMap<String, String>) -> Vec<Message> {
    entries
        .iter()
        .map(|(id, content)| {
            let secs = id.bytes().map(i64::from).sum::<i64>();
            Message::new(id.clone(), Role::User, content.clone()).at(ts(secs))
        })
        .collect()
}

fn snapshot(number: u64, secs: i64, entries: &BTreeMap<String, String>) -> SessionSnapshot {
    SessionSnapshot::new("prop-session", Version::new(number, ts(secs), "device"))
        .with_messages(messages(entries))
}

fn message_map() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("m[a-h]", "[xyz]{1,2}", 0..6)
}

fn classify(local: &SessionSnapshot, cloud: &SessionSnapshot) -> ConflictReport {
    ConflictClassifier::new(clock()).classify(Some(local), Some(cloud), &ClassifyOptions::default())
}

// ============================================================================
// CLASSIFICATION TESTS
// ============================================================================

mod classification_tests {
    use super::*;

    proptest! {
        /// Invariant: the same inputs always produce the same report
        #[test]
        fn deterministic(
            local in message_map(),
            cloud in message_map(),
            ln in 1u64..6,
            cn in 1u64..6,
            base in proptest::option::of(1u64..6),
        ) {
            let l = snapshot(ln, 1, &local);
            let c = snapshot(cn, 2, &cloud);
            let options = ClassifyOptions {
                last_synced_version: base.map(|n| Version::new(n, ts(0), "device")),
            };
            let classifier = ConflictClassifier::new(clock());
            let first = classifier.classify(Some(&l), Some(&c), &options);
            let second = classifier.classify(Some(&l), Some(&c), &options);
            prop_assert_eq!(first, second);
        }

        /// Invariant: a missing replica is never a conflict
        #[test]
        fn missing_side_is_not_a_conflict(local in message_map()) {
            let l = snapshot(1, 0, &local);
            let report = ConflictClassifier::new(clock())
                .classify(Some(&l), None, &ClassifyOptions::default());
            prop_assert!(!report.has_conflict);
        }

        /// Invariant: diff partitions ids by membership
        #[test]
        fn diff_partitions_ids(local in message_map(), cloud in message_map()) {
            let diff = DataDiffer::new().diff(&messages(&local), &messages(&cloud));

            let only_local: HashSet<&str> = diff.only_local.iter().map(|m| m.id.as_str()).collect();
            let expected: HashSet<&str> = local
                .keys()
                .filter(|id| !cloud.contains_key(*id))
                .map(String::as_str)
                .collect();
            prop_assert_eq!(only_local, expected);

            for modified in &diff.modified_overlap {
                prop_assert_ne!(&local[&modified.id], &cloud[&modified.id]);
            }
        }
    }
}

// ============================================================================
// AUTO-MERGE TESTS
// ============================================================================

mod auto_merge_tests {
    use super::*;

    proptest! {
        /// Invariant: an edited shared message blocks auto-merge
        #[test]
        fn modified_overlap_never_auto_merges(
            mut local in message_map(),
            mut cloud in message_map(),
        ) {
            local.insert("shared".to_string(), "before".to_string());
            cloud.insert("shared".to_string(), "after".to_string());

            let report = classify(&snapshot(3, 0, &local), &snapshot(3, 0, &cloud));
            prop_assert!(report.has_conflict);
            let assessment = AutoMergeAssessor::new().assess(&report);
            prop_assert!(!assessment.can_auto_merge);
        }

        /// Invariant: merging disjoint sessions keeps every message
        #[test]
        fn disjoint_merge_keeps_all(
            local in prop::collection::btree_map("l[a-h]", "[xyz]{1,2}", 0..6),
            cloud in prop::collection::btree_map("c[a-h]", "[xyz]{1,2}", 0..6),
        ) {
            let l = snapshot(1, 0, &local);
            let c = snapshot(1, 0, &cloud);
            let merged = MergeEngine::new().merge(&l, &c);
            prop_assert_eq!(merged.messages.len(), local.len() + cloud.len());

            let mut previous = None;
            for message in &merged.messages {
                if let Some(prev) = previous {
                    prop_assert!(prev <= message.created_at);
                }
                previous = Some(message.created_at);
            }
        }
    }
}

// ============================================================================
// RESOLUTION TESTS
// ============================================================================

mod resolution_tests {
    use super::*;

    fn strategy_for(index: u8) -> ResolutionStrategy {
        match index % 3 {
            0 => ResolutionStrategy::KeepLocal,
            1 => ResolutionStrategy::KeepCloud,
            _ => ResolutionStrategy::AutoMerge,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariant: every input message survives in the result or a backup,
        /// and the resolved version dominates both replicas
        #[test]
        fn no_silent_loss(
            local in message_map(),
            cloud in message_map(),
            ln in 1u64..6,
            cn in 1u64..6,
            pick in 0u8..3,
        ) {
            let l = snapshot(ln, 1, &local);
            let c = snapshot(cn, 2, &cloud);
            let report = classify(&l, &c);
            prop_assume!(report.has_conflict);

            let backups = Arc::new(MemoryBackupStore::default());
            let coordinator = ResolutionCoordinator::new(
                clock(),
                backups.clone(),
                Arc::new(MemoryHistoryStore::default()),
            );

            let Ok(result) = tokio_test::block_on(coordinator.resolve(&report, strategy_for(pick))) else {
                // Refused auto-merge persists nothing and loses nothing
                return Ok(());
            };
            let resolved = result.resolved_session.as_ref().unwrap();
            prop_assert!(resolved.meta.version.number > ln.max(cn));

            let entries = tokio_test::block_on(backups.list(&BackupFilter::default())).unwrap();
            let mut kept: HashSet<String> =
                resolved.messages.iter().map(|m| m.id.clone()).collect();
            for entry in &entries {
                kept.extend(entry.session.messages.iter().map(|m| m.id.clone()));
            }
            for id in local.keys().chain(cloud.keys()) {
                prop_assert!(kept.contains(id), "message {} lost", id);
            }
        }
    }
}

// ============================================================================
// VERSION TESTS
// ============================================================================

mod version_tests {
    use super::*;
    use std::cmp::Ordering;

    proptest! {
        /// Invariant: compare is antisymmetric
        #[test]
        fn compare_antisymmetric(an in 1u64..10, bn in 1u64..10, at in 0i64..100, bt in 0i64..100) {
            let a = Version::new(an, ts(at), "a");
            let b = Version::new(bn, ts(bt), "b");
            prop_assert_eq!(VersionClock::compare(&a, &b), VersionClock::compare(&b, &a).reverse());
        }

        /// Invariant: increment always moves forward
        #[test]
        fn increment_advances(n in 1u64..1000) {
            let current = Version::new(n, ts(0), "a");
            let next = clock().increment(&current, "prop");
            prop_assert_eq!(next.number, n + 1);
            prop_assert_eq!(VersionClock::compare(&next, &current), Ordering::Greater);
        }
    }
}

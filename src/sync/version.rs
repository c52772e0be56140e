//! Version stamps: creation, increment, comparison and divergence checks

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::conflict::ConflictReason;
use super::SyncDirection;
use crate::identity::IdentityProvider;
use crate::types::{Version, VersionResolution};

/// Outcome of comparing the local and cloud version stamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCheck {
    pub has_conflict: bool,
    pub reason: ConflictReason,
    /// The replicas differ and one should be pushed/pulled
    pub needs_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SyncDirection>,
    /// Both stamps are identical
    pub synced: bool,
    pub local: Version,
    pub cloud: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<Version>,
}

/// Distance between two versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDifference {
    pub ordering: i8,
    pub version_diff: i64,
    pub time_diff_ms: i64,
    pub time_diff_formatted: String,
    pub versions_behind: u64,
    pub versions_ahead: u64,
}

/// Creates and compares version stamps
#[derive(Clone)]
pub struct VersionClock {
    identity: Arc<dyn IdentityProvider>,
    require_baseline: bool,
}

impl std::fmt::Debug for VersionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionClock")
            .field("device_id", &self.identity.device_id())
            .field("require_baseline", &self.require_baseline)
            .finish()
    }
}

impl VersionClock {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            require_baseline: false,
        }
    }

    /// Refuse the first-sync fast path when the versions diverge and no baseline is known
    pub fn with_require_baseline(mut self, require: bool) -> Self {
        self.require_baseline = require;
        self
    }

    pub fn device_id(&self) -> String {
        self.identity.device_id()
    }

    /// First version of a new lineage
    pub fn create_initial(&self) -> Version {
        Version::new(1, Utc::now(), self.identity.device_id())
    }

    /// Next version after `current`, recording the predecessor
    pub fn increment(&self, current: &Version, author: &str) -> Version {
        Version {
            number: current.number + 1,
            timestamp: Utc::now(),
            device_id: self.identity.device_id(),
            author: author.to_string(),
            previous_number: Some(current.number),
            previous_timestamp: Some(current.timestamp),
            resolution: None,
            synced_at: None,
        }
    }

    /// Version produced by merging both replicas: `max(local, cloud) + 1`
    pub fn merge_version(&self, local: &Version, cloud: &Version, strategy: &str) -> Version {
        let base = local.number.max(cloud.number);
        Version {
            number: base + 1,
            timestamp: Utc::now(),
            device_id: self.identity.device_id(),
            author: "merged".to_string(),
            previous_number: Some(base),
            previous_timestamp: Some(local.timestamp.max(cloud.timestamp)),
            resolution: Some(VersionResolution {
                strategy: strategy.to_string(),
                local_number: local.number,
                cloud_number: cloud.number,
            }),
            synced_at: None,
        }
    }

    /// Adopt the cloud stamp after a pull
    pub fn sync_version(cloud: &Version) -> Version {
        Version {
            synced_at: Some(Utc::now()),
            ..cloud.clone()
        }
    }

    /// Compare by number, then by timestamp
    pub fn compare(a: &Version, b: &Version) -> Ordering {
        a.number
            .cmp(&b.number)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    }

    /// Decide whether the two replicas diverged since `last_synced`.
    ///
    /// Only when both sides moved past the baseline is the divergence a conflict;
    /// otherwise one side simply catches up with the other.
    pub fn detect_conflict(
        &self,
        local: &Version,
        cloud: &Version,
        last_synced: Option<&Version>,
    ) -> VersionCheck {
        let ordering = Self::compare(local, cloud);
        let mut check = VersionCheck {
            has_conflict: false,
            reason: ConflictReason::SameVersion,
            needs_sync: false,
            direction: None,
            synced: false,
            local: local.clone(),
            cloud: cloud.clone(),
            last_synced: last_synced.cloned(),
        };

        let Some(baseline) = last_synced else {
            if self.require_baseline && ordering != Ordering::Equal {
                check.has_conflict = true;
                check.reason = ConflictReason::MissingBaseline;
                return check;
            }
            check.reason = ConflictReason::FirstSync;
            check.needs_sync = true;
            return check;
        };

        let local_modified = local.number > baseline.number;
        let cloud_modified = cloud.number > baseline.number;
        if local_modified && cloud_modified && ordering != Ordering::Equal {
            check.has_conflict = true;
            check.reason = ConflictReason::ConcurrentModification;
            return check;
        }

        match ordering {
            Ordering::Equal => {
                check.synced = true;
            }
            Ordering::Less => {
                check.reason = ConflictReason::CloudNewer;
                check.needs_sync = true;
                check.direction = Some(SyncDirection::Pull);
            }
            Ordering::Greater => {
                check.reason = ConflictReason::LocalNewer;
                check.needs_sync = true;
                check.direction = Some(SyncDirection::Push);
            }
        }
        check
    }
}

/// Check a version stamp for structural problems
pub fn validate_version(version: &Version) -> Vec<String> {
    let mut errors = Vec::new();
    if version.number < 1 {
        errors.push("version must be a positive number".to_string());
    }
    if version.device_id.trim().is_empty() {
        errors.push("device identifier is required".to_string());
    }
    errors
}

/// Short display form, `N/A` when absent
pub fn format_version(version: Option<&Version>) -> String {
    match version {
        Some(v) => format!("v{} ({})", v.number, v.timestamp.format("%Y-%m-%d %H:%M:%S")),
        None => "N/A".to_string(),
    }
}

/// How far apart two versions are
pub fn version_difference(a: &Version, b: &Version) -> VersionDifference {
    let ordering = VersionClock::compare(a, b);
    let time_diff_ms = (a.timestamp - b.timestamp).num_milliseconds();
    VersionDifference {
        ordering: ordering as i8,
        version_diff: a.number as i64 - b.number as i64,
        time_diff_ms,
        time_diff_formatted: format_duration(time_diff_ms.unsigned_abs()),
        versions_behind: if ordering == Ordering::Less {
            b.number.saturating_sub(a.number)
        } else {
            0
        },
        versions_ahead: if ordering == Ordering::Greater {
            a.number.saturating_sub(b.number)
        } else {
            0
        },
    }
}

/// Compact duration such as `2d 3h` or `45s`
pub fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

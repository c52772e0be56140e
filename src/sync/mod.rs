//! Session sync between the local and cloud replicas
//!
//! Version stamping, conflict classification and resolution. Snapshots are
//! fetched through [`SnapshotProvider`]s; everything else is pure.

pub mod conflict;
pub mod version;

pub use conflict::{
    AutoMergeAssessment, AutoMergeAssessor, ClassifyOptions, ConflictClassifier, ConflictReport,
    ConflictType, MergeEngine, MergeStrategy, ResolutionCoordinator, ResolutionResult,
    ResolutionStrategy, Severity, StrategyKind,
};
pub use version::{VersionCheck, VersionClock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SessionSnapshot;

/// Sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local is ahead, upload
    Push,
    /// Cloud is ahead, download
    Pull,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "push" => Ok(SyncDirection::Push),
            "pull" => Ok(SyncDirection::Pull),
            _ => Err(format!("Unknown sync direction: {}", s)),
        }
    }
}

/// Source of one replica's snapshots.
///
/// Implementations are expected to stamp `meta.hash`. Transient failures
/// should map to [`crate::error::SyncError::Snapshot`] so callers can retry.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;
}

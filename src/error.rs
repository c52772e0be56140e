//! Error types for session-sync

use thiserror::Error;

use crate::sync::conflict::AssessmentReason;

/// Result type alias for session-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for session-sync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No conflict to resolve")]
    NoConflictToResolve,

    #[error("Cannot auto-merge: {0}")]
    CannotAutoMerge(AssessmentReason),

    #[error("Unknown resolution strategy: {0}")]
    UnknownResolutionStrategy(String),

    #[error("Unknown merge strategy: {0}")]
    UnknownMergeStrategy(String),

    #[error("Backup write failed: {0}")]
    BackupWriteFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Snapshot provider error: {0}")]
    Snapshot(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Snapshot(_) | SyncError::Timeout(_) | SyncError::Io(_)
        )
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> String {
        match self {
            SyncError::NoConflictToResolve => "no_conflict_to_resolve".to_string(),
            SyncError::CannotAutoMerge(reason) => format!("cannot_auto_merge:{}", reason),
            SyncError::UnknownResolutionStrategy(_) => "unknown_resolution_strategy".to_string(),
            SyncError::UnknownMergeStrategy(_) => "unknown_merge_strategy".to_string(),
            SyncError::BackupWriteFailed(_) => "backup_write_failed".to_string(),
            SyncError::ValidationFailed(field) => format!("validation_failed:{}", field),
            SyncError::BackupNotFound(_) => "backup_not_found".to_string(),
            SyncError::InvalidInput(_) => "invalid_input".to_string(),
            SyncError::Snapshot(_) => "snapshot_unavailable".to_string(),
            SyncError::Timeout(_) => "timeout".to_string(),
            SyncError::Storage(_) | SyncError::Database(_) | SyncError::Io(_) => {
                "storage_error".to_string()
            }
            SyncError::Config(_) => "config_error".to_string(),
            SyncError::Serialization(_) => "serialization_error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SyncError::NoConflictToResolve.code(),
            "no_conflict_to_resolve"
        );
        assert_eq!(
            SyncError::CannotAutoMerge(AssessmentReason::HasModifiedOverlaps).code(),
            "cannot_auto_merge:has_modified_overlaps"
        );
        assert_eq!(
            SyncError::ValidationFailed("meta.version".to_string()).code(),
            "validation_failed:meta.version"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SyncError::Timeout("fetch".to_string()).is_retryable());
        assert!(SyncError::Snapshot("offline".to_string()).is_retryable());
        assert!(!SyncError::NoConflictToResolve.is_retryable());
        assert!(!SyncError::BackupWriteFailed("disk full".to_string()).is_retryable());
    }
}

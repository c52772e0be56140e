//! High-level sync engine
//!
//! Wires the classifier, auto-merge assessor, resolution coordinator and the
//! persistent stores together behind one handle.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::storage::{
    BackupEntry, BackupFilter, BackupStore, FileBackupStore, FileHistoryStore, HistoryEntry,
    HistoryFilter, HistoryStore, MemoryBackupStore, MemoryHistoryStore, PurgeReport,
    SyncStateStore,
};
use crate::sync::conflict::{
    AutoMergeAssessment, AutoMergeAssessor, ClassifyOptions, ConflictClassifier, ConflictReason,
    ConflictReport, ResolutionCoordinator, ResolutionResult, ResolutionStrategy,
    SmartMergeOutcome, StrategyKind,
};
use crate::sync::{SnapshotProvider, SyncDirection, VersionClock};
use crate::types::{SessionSnapshot, SyncConfig, Version};

/// What [`SyncEngine::reconcile`] concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// One or both replicas are missing
    Missing { report: ConflictReport },
    /// Both replicas carry the same version; baseline recorded
    InSync { version: Version },
    /// One side is simply behind
    NeedsSync {
        direction: Option<SyncDirection>,
        report: ConflictReport,
    },
    /// Lossless merge applied; the caller writes the result to both replicas
    Merged { result: ResolutionResult },
    /// A human has to pick a strategy
    #[serde(rename_all = "camelCase")]
    ConflictPending {
        report: ConflictReport,
        assessment: AutoMergeAssessment,
        recommended_strategies: Vec<StrategyKind>,
    },
}

/// Entry point for classifying, resolving and auditing session conflicts
pub struct SyncEngine {
    config: SyncConfig,
    classifier: ConflictClassifier,
    assessor: AutoMergeAssessor,
    coordinator: ResolutionCoordinator,
    state: SyncStateStore,
}

impl SyncEngine {
    /// File-backed stores under `config.backup_dir`, SQLite sync state
    pub fn new(config: SyncConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        if config.retention_days <= 0 {
            return Err(SyncError::Config(
                "retention_days must be positive".to_string(),
            ));
        }
        if config.history_limit == 0 {
            return Err(SyncError::Config("history_limit must be positive".to_string()));
        }

        let backups: Arc<dyn BackupStore> = Arc::new(FileBackupStore::from_config(&config));
        let history: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::from_config(&config));
        let state = match &config.state_db_path {
            Some(path) => SyncStateStore::open(path)?,
            None => SyncStateStore::open_in_memory()?,
        };
        Ok(Self::with_stores(config, identity, backups, history, state))
    }

    /// Everything in memory, for tests and embedding
    pub fn in_memory(config: SyncConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let backups: Arc<dyn BackupStore> = Arc::new(MemoryBackupStore::new(config.retention()));
        let history: Arc<dyn HistoryStore> =
            Arc::new(MemoryHistoryStore::new(config.history_limit));
        let state = SyncStateStore::open_in_memory()?;
        Ok(Self::with_stores(config, identity, backups, history, state))
    }

    pub fn with_stores(
        config: SyncConfig,
        identity: Arc<dyn IdentityProvider>,
        backups: Arc<dyn BackupStore>,
        history: Arc<dyn HistoryStore>,
        state: SyncStateStore,
    ) -> Self {
        let clock = VersionClock::new(identity).with_require_baseline(config.require_baseline);
        let coordinator = ResolutionCoordinator::new(clock.clone(), backups, history)
            .with_io_timeout(config.io_timeout());
        Self {
            classifier: ConflictClassifier::new(clock),
            assessor: AutoMergeAssessor::new(),
            coordinator,
            state,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    pub fn classify_conflict(
        &self,
        local: Option<&SessionSnapshot>,
        cloud: Option<&SessionSnapshot>,
        options: &ClassifyOptions,
    ) -> ConflictReport {
        self.classifier.classify(local, cloud, options)
    }

    pub fn assess_auto_merge(&self, report: &ConflictReport) -> AutoMergeAssessment {
        self.assessor.assess(report)
    }

    pub fn recommend_strategies(&self, report: &ConflictReport) -> Vec<StrategyKind> {
        AutoMergeAssessor::recommended_strategies(report)
    }

    pub async fn resolve(
        &self,
        report: &ConflictReport,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionResult> {
        self.coordinator.resolve(report, strategy).await
    }

    pub async fn smart_merge(&self, report: &ConflictReport) -> Result<SmartMergeOutcome> {
        self.coordinator.smart_merge(report).await
    }

    /// Non-expired backups, newest first
    pub async fn list_backups(&self, session_id: Option<&str>) -> Result<Vec<BackupEntry>> {
        let filter = BackupFilter {
            session_id: session_id.map(str::to_string),
            include_expired: false,
        };
        self.coordinator.backups().list(&filter).await
    }

    pub async fn restore_backup(&self, backup_id: &str) -> Result<SessionSnapshot> {
        let entry = self.coordinator.backups().restore(backup_id).await?;
        info!(backup_id, session_id = %entry.session_id, "Backup restored");
        Ok(entry.session)
    }

    pub async fn get_resolution_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        self.coordinator.history().query(filter).await
    }

    pub async fn purge_expired_backups(&self) -> Result<PurgeReport> {
        self.coordinator.backups().purge_expired().await
    }

    pub async fn backup_report(&self, session_id: Option<&str>) -> Result<String> {
        self.coordinator.backups().render_report(session_id).await
    }

    /// Record that both replicas now hold `version`
    pub fn mark_synced(
        &self,
        session_id: &str,
        version: &Version,
        direction: Option<SyncDirection>,
    ) -> Result<()> {
        self.state.record_sync(session_id, version, direction)
    }

    /// Fetch both replicas, classify against the stored baseline and apply
    /// a lossless merge when one is possible.
    ///
    /// Never picks a side on its own; anything beyond an auto-merge comes
    /// back as [`ReconcileOutcome::ConflictPending`].
    pub async fn reconcile(
        &self,
        session_id: &str,
        local: &dyn SnapshotProvider,
        cloud: &dyn SnapshotProvider,
    ) -> Result<ReconcileOutcome> {
        let fetched = async {
            let l = self.fetch_with_retry(local, session_id, "local").await?;
            let c = self.fetch_with_retry(cloud, session_id, "cloud").await?;
            Ok::<_, SyncError>((l, c))
        }
        .await;
        let (local_snapshot, cloud_snapshot) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                self.state.record_error(session_id, &e.to_string())?;
                return Err(e);
            }
        };

        for snapshot in [&local_snapshot, &cloud_snapshot].into_iter().flatten() {
            if snapshot.meta.hash.is_some() && !snapshot.verify_hash() {
                warn!(session_id, device = %snapshot.meta.device, "Snapshot hash mismatch");
            }
        }

        let options = ClassifyOptions {
            last_synced_version: self.state.last_synced_version(session_id)?,
        };
        let report = self.classifier.classify(
            local_snapshot.as_ref(),
            cloud_snapshot.as_ref(),
            &options,
        );

        if !report.has_conflict {
            if report.reason == ConflictReason::MissingSessionData {
                return Ok(ReconcileOutcome::Missing { report });
            }
            if let (Some(l), Some(c)) = (&local_snapshot, &cloud_snapshot) {
                if VersionClock::compare(&l.meta.version, &c.meta.version) == Ordering::Equal {
                    self.state.record_sync(session_id, &l.meta.version, None)?;
                    return Ok(ReconcileOutcome::InSync {
                        version: l.meta.version.clone(),
                    });
                }
            }
            debug!(session_id, direction = ?report.sync_direction, "Replicas need sync");
            return Ok(ReconcileOutcome::NeedsSync {
                direction: report.sync_direction,
                report,
            });
        }

        let assessment = self.assessor.assess(&report);
        if assessment.can_auto_merge {
            let result = self
                .coordinator
                .resolve(&report, ResolutionStrategy::AutoMerge)
                .await?;
            return Ok(ReconcileOutcome::Merged { result });
        }

        info!(
            session_id,
            conflict_type = %report.conflict_type,
            reason = %assessment.reason,
            "Conflict needs manual resolution"
        );
        Ok(ReconcileOutcome::ConflictPending {
            recommended_strategies: AutoMergeAssessor::recommended_strategies(&report),
            report,
            assessment,
        })
    }

    async fn fetch_with_retry(
        &self,
        provider: &dyn SnapshotProvider,
        session_id: &str,
        side: &str,
    ) -> Result<Option<SessionSnapshot>> {
        let max_retries = self.config.max_io_retries;
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.io_timeout(),
                provider.fetch(session_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!("fetching {} snapshot", side))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        session_id,
                        side,
                        attempt,
                        error = %e,
                        "Snapshot fetch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt - 1))).await;
                }
                other => return other,
            }
        }
    }
}

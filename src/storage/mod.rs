//! Persistence: backups, resolution history and sync state

mod backup;
mod history;
mod sync_state;

pub use backup::{
    backup_id, BackupEntry, BackupFilter, BackupStore, BackupType, FileBackupStore,
    MemoryBackupStore, PurgeFailure, PurgeReport,
};
pub use history::{
    apply_filter, FileHistoryStore, HistoryEntry, HistoryFilter, HistoryStore,
    MemoryHistoryStore, DEFAULT_HISTORY_LIMIT, HISTORY_FILE_NAME,
};
pub use sync_state::{SyncStateStore, SyncStatus};

//! Session Sync - conflict engine for replicated chat sessions
//!
//! Detects, classifies and resolves divergence between a local and a cloud
//! copy of the same session, with backups of everything a resolution replaces.

pub mod engine;
pub mod error;
pub mod identity;
pub mod storage;
pub mod sync;
pub mod types;

pub use engine::{ReconcileOutcome, SyncEngine};
pub use error::{Result, SyncError};
pub use identity::{HostIdentity, IdentityProvider, StaticIdentity};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

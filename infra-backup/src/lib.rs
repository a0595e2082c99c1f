//! Infra Backup Library
//!
//! Backup, verification and disaster-recovery orchestration: data source
//! adapters feed a staged compress/encrypt pipeline, artifacts are verified and
//! recorded in an append-only catalog, retention purges stale artifacts, and a
//! failover/failback state machine drives cross-site recovery.

pub mod adapters;
pub mod catalog;
pub mod config;
pub mod dr;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod logging;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod secret;
pub mod verify;

// Re-export commonly used types
pub use config::Settings;
pub use error::BackupError;
pub use model::{BackupKind, Status};
pub type Result<T> = std::result::Result<T, BackupError>;

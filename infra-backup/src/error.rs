//! Error taxonomy for backup, verification and retention work.
//!
//! Every variant carries a severity: most are failures local to one target,
//! a few only downgrade the outcome to a warning, and the pre-flight gates are
//! global and stop a batch before any work starts.

use crate::model::Status;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Required tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Insufficient disk space on {path}: {available_mb} MiB free, {required_mb} MiB required")]
    InsufficientDisk {
        path: String,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("Remote host unreachable: {host}: {reason}")]
    RemoteUnreachable { host: String, reason: String },

    #[error("Extraction failed on {host}: {reason}")]
    ExtractionFailed { host: String, reason: String },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Retention delete failed for {path}: {reason}")]
    RetentionDelete { path: String, reason: String },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Lease for {scope} is held by {holder}")]
    LeaseHeld { scope: String, holder: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {secs}s: {operation}")]
    Timeout { secs: u64, operation: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Outcome a job receives when it ends with this error.
    pub fn severity(&self) -> Status {
        match self {
            BackupError::EncryptionFailed(_)
            | BackupError::RetentionDelete { .. }
            | BackupError::UploadFailed(_) => Status::Warning,
            _ => Status::Fail,
        }
    }

    /// Global errors abort a whole batch; everything else stays local to one target.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            BackupError::ToolUnavailable(_)
                | BackupError::InsufficientDisk { .. }
                | BackupError::LeaseHeld { .. }
                | BackupError::Config(_)
        )
    }

    pub fn catalog(err: anyhow::Error) -> Self {
        BackupError::Catalog(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(BackupError::EncryptionFailed("no key".into()).severity(), Status::Warning);
        assert_eq!(
            BackupError::RetentionDelete { path: "/x".into(), reason: "busy".into() }.severity(),
            Status::Warning
        );
        assert_eq!(
            BackupError::ExtractionFailed { host: "db-01".into(), reason: "exit 1".into() }.severity(),
            Status::Fail
        );
        assert_eq!(BackupError::VerificationFailed("empty".into()).severity(), Status::Fail);
    }

    #[test]
    fn test_global_gates() {
        assert!(BackupError::ToolUnavailable("pg_dump".into()).is_global());
        assert!(BackupError::InsufficientDisk { path: "/".into(), available_mb: 1, required_mb: 2 }.is_global());
        assert!(!BackupError::RemoteUnreachable { host: "h".into(), reason: "refused".into() }.is_global());
    }
}

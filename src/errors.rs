//! Engine Error Types
//!
//! One error enum for the whole engine, classified into a fault taxonomy:
//! - Transient operational errors are returned to the caller and require
//!   no replica-level action.
//! - Transient-fatal errors restart the replica via a transient fault
//!   report; data is not considered lost.
//! - Permanent-fatal errors request a rebuild of the replica.
//! - Restore-safety errors are always surfaced to the restore caller and
//!   never auto-retried.
//!
//! Errors from the local store or the transport are inspected only far
//! enough to classify them; they are never silently swallowed except where
//! explicitly idempotent (e.g. deleting an already-absent tombstone).

use thiserror::Error;

/// Result type used across the engine
pub type StoreResult<T> = Result<T, StoreError>;

/// Fault classification for replica-level handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Returned to the caller, no replica action
    Transient,

    /// Report a transient fault; the platform restarts the replica
    TransientFatal,

    /// Report a permanent fault; the platform rebuilds the replica
    PermanentFatal,

    /// Surfaced to the restore caller, never auto-retried
    RestoreSafety,
}

/// Engine error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("local store fatal error: {0}")]
    StoreFatal(String),

    #[error("replica is not primary")]
    NotPrimary,

    #[error("reconfiguration pending")]
    ReconfigurationPending,

    #[error("no write quorum")]
    NoWriteQuorum,

    #[error("object closed")]
    ObjectClosed,

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("database migration in progress")]
    MigrationInProgress,

    #[error("database files corrupted: {0}")]
    DatabaseFilesCorrupted(String),

    #[error("store in use: {0}")]
    StoreInUse(String),

    #[error("restore safety check failed: {0}")]
    RestoreSafeCheckFailed(String),

    #[error("invalid backup chain: {0}")]
    InvalidBackupChain(String),

    #[error("missing full backup: incremental backup is not armed for this store")]
    MissingFullBackup,

    #[error("duplicate backups: {0}")]
    DuplicateBackups(String),

    #[error("invalid restore data: {0}")]
    InvalidRestoreData(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("i/o failure: {0}")]
    Io(String),
}

impl StoreError {
    /// I/O error with context. The source error is stringified so the
    /// engine error stays cheap to clone across completion channels.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io(format!("{}: {}", context.into(), source))
    }

    /// Serialization error with context.
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization(format!("{}: {}", context.into(), source))
    }

    /// Stable error code string for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RecordNotFound(_) => "STORE_RECORD_NOT_FOUND",
            Self::RecordAlreadyExists(_) => "STORE_RECORD_ALREADY_EXISTS",
            Self::WriteConflict(_) => "STORE_WRITE_CONFLICT",
            Self::StoreFatal(_) => "STORE_FATAL",
            Self::NotPrimary => "NOT_PRIMARY",
            Self::ReconfigurationPending => "RECONFIGURATION_PENDING",
            Self::NoWriteQuorum => "NO_WRITE_QUORUM",
            Self::ObjectClosed => "OBJECT_CLOSED",
            Self::TransactionAborted(_) => "TRANSACTION_ABORTED",
            Self::MigrationInProgress => "MIGRATION_IN_PROGRESS",
            Self::DatabaseFilesCorrupted(_) => "DATABASE_FILES_CORRUPTED",
            Self::StoreInUse(_) => "STORE_IN_USE",
            Self::RestoreSafeCheckFailed(_) => "RESTORE_SAFE_CHECK_FAILED",
            Self::InvalidBackupChain(_) => "INVALID_BACKUP_CHAIN",
            Self::MissingFullBackup => "MISSING_FULL_BACKUP",
            Self::DuplicateBackups(_) => "DUPLICATE_BACKUPS",
            Self::InvalidRestoreData(_) => "INVALID_RESTORE_DATA",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
            Self::Io(_) => "IO_FAILURE",
        }
    }

    /// Classify this error for replica-level handling.
    pub fn fault_class(&self) -> FaultClass {
        match self {
            Self::NotPrimary
            | Self::ReconfigurationPending
            | Self::NoWriteQuorum
            | Self::ObjectClosed
            | Self::WriteConflict(_)
            | Self::RecordNotFound(_)
            | Self::RecordAlreadyExists(_)
            | Self::TransactionAborted(_)
            | Self::MigrationInProgress
            | Self::InvalidOperation(_) => FaultClass::Transient,

            Self::StoreFatal(_) | Self::Serialization(_) | Self::Io(_) => {
                FaultClass::TransientFatal
            }

            Self::DatabaseFilesCorrupted(_) | Self::StoreInUse(_) => FaultClass::PermanentFatal,

            Self::RestoreSafeCheckFailed(_)
            | Self::InvalidBackupChain(_)
            | Self::MissingFullBackup
            | Self::DuplicateBackups(_)
            | Self::InvalidRestoreData(_) => FaultClass::RestoreSafety,
        }
    }

    /// Whether an open failure is eligible for the repair policy.
    ///
    /// Only file corruption and sharing violations are repair-eligible;
    /// everything else takes the generic fault path.
    pub fn is_repair_eligible(&self) -> bool {
        matches!(self, Self::DatabaseFilesCorrupted(_) | Self::StoreInUse(_))
    }
}

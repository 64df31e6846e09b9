//! Engine error type.

use std::time::Duration;

use thiserror::Error;

use crate::types::ids::JobId;

/// Errors surfaced by the orchestration engine.
///
/// Per-task failures never travel through this type past the worker that
/// produced them; they are captured as [`TaskFailure`](crate::orchestration::task::TaskFailure)
/// on the task record instead.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The target could not be resolved to a local path.
    #[error("Target acquisition failed for {target}: {reason}")]
    TargetAcquisition {
        /// The target as requested.
        target: String,
        /// Why resolution failed.
        reason: String,
    },

    /// `git diff` against the requested revision failed.
    #[error("Change detection failed for {target}: {reason}")]
    ChangeDetection {
        /// Repository path.
        target: String,
        /// git's stderr or the local rejection reason.
        reason: String,
    },

    /// A scanner adapter returned an error.
    #[error("Scanner {scanner} failed: {reason}")]
    ScannerExecution {
        /// Scanner name.
        scanner: String,
        /// Adapter-provided reason.
        reason: String,
    },

    /// A scanner exceeded its task timeout.
    #[error("Scanner {scanner} timed out after {timeout:?}")]
    ScannerTimeout {
        /// Scanner name.
        scanner: String,
        /// The limit that elapsed.
        timeout: Duration,
    },

    /// A cached entry could not be decoded.
    #[error("Cache entry {key} is corrupt: {reason}")]
    CacheCorruption {
        /// Cache key digest.
        key: String,
        /// Decode failure.
        reason: String,
    },

    /// No adapter is registered under this name.
    #[error("Unknown scanner: {0}")]
    UnknownScanner(String),

    /// No bundle is configured under this name.
    #[error("Unknown scanner bundle: {0}")]
    UnknownBundle(String),

    /// The job decomposed into zero tasks.
    #[error("No schedulable tasks for job {0}")]
    NoSchedulableTasks(JobId),

    /// The job id is unknown or its record was swept.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The persistence layer rejected a write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An event sink failed to accept an event.
    #[error("Event sink error: {0}")]
    EventSink(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The orchestrator no longer accepts work.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// Filesystem or process I/O.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside the engine.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Shorthand for [`ScanError::ScannerExecution`].
    pub fn execution(scanner: impl Into<String>, reason: impl Into<String>) -> Self {
        ScanError::ScannerExecution {
            scanner: scanner.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ScanError::TargetAcquisition`].
    pub fn target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        ScanError::TargetAcquisition {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ScanError>;

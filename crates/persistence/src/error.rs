//! Error types for the storage engine.
//!
//! Errors are organized into a hierarchy that separates record-state errors,
//! concurrency errors, reindex-job errors, extraction errors, and backend
//! errors. Backend-specific failure codes never cross this boundary; every
//! failure a caller can observe maps onto one of the [`ErrorKind`] values.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// The primary error type for all storage and reindex operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record state errors
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Concurrency and versioning errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Reindex job errors
    #[error(transparent)]
    Job(#[from] JobError),

    /// Search-value extraction errors
    #[error(transparent)]
    Extraction(#[from] ExtractError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The operation was canceled before it could complete.
    #[error("operation canceled")]
    Canceled,
}

/// Errors related to record state.
#[derive(Error, Debug)]
pub enum RecordError {
    /// The requested record was not found.
    #[error("record not found: {resource_type}/{logical_id}")]
    NotFound {
        resource_type: String,
        logical_id: String,
    },

    /// The requested version of the record was not found.
    #[error("version not found: {resource_type}/{logical_id}/_history/{version}")]
    VersionNotFound {
        resource_type: String,
        logical_id: String,
        version: u64,
    },

    /// The record exists but its current version is a tombstone (HTTP 410 Gone).
    #[error("record deleted: {resource_type}/{logical_id}")]
    Gone {
        resource_type: String,
        logical_id: String,
        deleted_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// The operation is not allowed for this record state.
    #[error("method not allowed: {reason}")]
    MethodNotAllowed { reason: String },

    /// The incoming draft could not be accepted.
    #[error("invalid record: {message}")]
    InvalidDraft { message: String },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// If-Match precondition failed: the caller's version expectation is stale.
    #[error(
        "precondition failed for {resource_type}/{logical_id}: expected version {expected}, found {actual}"
    )]
    PreconditionFailed {
        resource_type: String,
        logical_id: String,
        expected: u64,
        actual: u64,
    },

    /// A conditional replace lost the race and the bounded retries ran out.
    #[error("write conflict on {resource_type}/{logical_id}")]
    WriteConflict {
        resource_type: String,
        logical_id: String,
    },
}

/// Errors related to reindex jobs.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job was not found.
    #[error("reindex job not found: {id}")]
    NotFound { id: String },

    /// A non-terminal job already exists; only one may run per deployment.
    #[error("a reindex job is already active: {id}")]
    ActiveJobExists { id: String },

    /// The job is in a terminal status and can no longer be modified.
    #[error("reindex job {id} is already {status}")]
    TerminalState { id: String, status: String },

    /// Conditional job replace failed: the etag is stale.
    #[error("reindex job {id} was modified concurrently")]
    EtagMismatch { id: String },

    /// The job failed for an unrecoverable reason.
    #[error("reindex job {id} failed: {reason}")]
    Unrecoverable { id: String, reason: String },
}

/// Errors raised while extracting index values from a payload.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The payload is not a shape values can be extracted from.
    #[error("invalid payload: {message}")]
    InvalidPayload { message: String },

    /// The extraction expression is not supported by this engine.
    #[error("unsupported expression: {expression}")]
    UnsupportedExpression { expression: String },
}

/// Errors originating from the storage backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// The backend asked the caller to slow down.
    #[error("backend rate limited: {backend_name}")]
    RateLimited { backend_name: String },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// The caller's credentials were rejected by the backend.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Caller-visible failure kinds.
///
/// Every [`StoreError`] projects onto exactly one kind; the HTTP layer maps
/// kinds to status codes without inspecting backend details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Gone,
    Conflict,
    PreconditionFailed,
    MethodNotAllowed,
    RequestNotValid,
    Unauthorized,
    RateLimited,
    Unavailable,
    Canceled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Gone => "gone",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition-failed",
            ErrorKind::MethodNotAllowed => "method-not-allowed",
            ErrorKind::RequestNotValid => "request-not-valid",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl StoreError {
    /// Projects this error onto its caller-visible kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Record(e) => match e {
                RecordError::NotFound { .. } | RecordError::VersionNotFound { .. } => {
                    ErrorKind::NotFound
                }
                RecordError::Gone { .. } => ErrorKind::Gone,
                RecordError::MethodNotAllowed { .. } => ErrorKind::MethodNotAllowed,
                RecordError::InvalidDraft { .. } => ErrorKind::RequestNotValid,
            },
            StoreError::Concurrency(e) => match e {
                ConcurrencyError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
                ConcurrencyError::WriteConflict { .. } => ErrorKind::Conflict,
            },
            StoreError::Job(e) => match e {
                JobError::NotFound { .. } => ErrorKind::NotFound,
                JobError::ActiveJobExists { .. } => ErrorKind::Conflict,
                JobError::TerminalState { .. } => ErrorKind::RequestNotValid,
                JobError::EtagMismatch { .. } => ErrorKind::PreconditionFailed,
                JobError::Unrecoverable { .. } => ErrorKind::Internal,
            },
            StoreError::Extraction(_) => ErrorKind::RequestNotValid,
            StoreError::Backend(e) => match e {
                BackendError::Unavailable { .. } | BackendError::PoolExhausted { .. } => {
                    ErrorKind::Unavailable
                }
                BackendError::RateLimited { .. } => ErrorKind::RateLimited,
                BackendError::Unauthorized { .. } => ErrorKind::Unauthorized,
                BackendError::Serialization { .. } | BackendError::Internal { .. } => {
                    ErrorKind::Internal
                }
            },
            StoreError::Canceled => ErrorKind::Canceled,
        }
    }
}

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(BackendError::Serialization {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_display() {
        let err = StoreError::Record(RecordError::NotFound {
            resource_type: "Patient".to_string(),
            logical_id: "123".to_string(),
        });
        assert_eq!(err.to_string(), "record not found: Patient/123");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn precondition_display_and_kind() {
        let err = StoreError::Concurrency(ConcurrencyError::PreconditionFailed {
            resource_type: "Observation".to_string(),
            logical_id: "obs-1".to_string(),
            expected: 1,
            actual: 2,
        });
        assert!(err.to_string().contains("expected version 1, found 2"));
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn job_error_kinds() {
        let conflict = StoreError::Job(JobError::ActiveJobExists {
            id: "j1".to_string(),
        });
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let terminal = StoreError::Job(JobError::TerminalState {
            id: "j1".to_string(),
            status: "completed".to_string(),
        });
        assert_eq!(terminal.kind(), ErrorKind::RequestNotValid);

        let stale = StoreError::Job(JobError::EtagMismatch {
            id: "j1".to_string(),
        });
        assert_eq!(stale.kind(), ErrorKind::PreconditionFailed);
    }

    #[test]
    fn backend_error_kinds() {
        let limited = StoreError::Backend(BackendError::RateLimited {
            backend_name: "sqlite".to_string(),
        });
        assert_eq!(limited.kind(), ErrorKind::RateLimited);

        let unavailable = StoreError::Backend(BackendError::Unavailable {
            backend_name: "memory".to_string(),
            message: "shutting down".to_string(),
        });
        assert_eq!(unavailable.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::PreconditionFailed.to_string(),
            "precondition-failed"
        );
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate-limited");
    }
}

//! # Notebook Errors
//!
//! Error taxonomy shared by every layer of the notebook substrate.
//!
//! - [`StorageError`]: failures raised by a storage backend, including the
//!   contention cases (`VersionConflict`, `SequenceConflict`) that callers
//!   retry a bounded number of times. `StaleClaim` means the lease moved to
//!   another worker and is never retried.
//! - [`NotebookError`]: what service entry points return. Every variant maps
//!   to an [`ErrorStatus`] so a transport can tell Denied from Conflict from a
//!   transient server failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionError { backend: String, reason: String },

    #[error("Query on {backend} failed: {reason}")]
    QueryError { backend: String, reason: String },

    #[error("Serialization error: {error_type} - {reason}")]
    SerializationError { error_type: String, reason: String },

    #[error("Not found on {backend}:{id}")]
    NotFound { backend: String, id: String },

    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: String,
        id: String,
        expected: i64,
    },

    #[error("Sequence conflict in notebook {notebook_id}")]
    SequenceConflict { notebook_id: String },

    #[error("Stale claim on job {job_id}: not held by {worker_id}")]
    StaleClaim { job_id: String, worker_id: String },

    #[error("Duplicate {entity}: {id}")]
    Duplicate { entity: String, id: String },
}

impl StorageError {
    /// Contention errors are retried internally before surfacing as
    /// [`NotebookError::Conflict`].
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StorageError::VersionConflict { .. } | StorageError::SequenceConflict { .. }
        )
    }

    pub fn query(backend: &str, reason: impl std::fmt::Display) -> Self {
        StorageError::QueryError {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn serialization(error_type: &str, reason: impl std::fmt::Display) -> Self {
        StorageError::SerializationError {
            error_type: error_type.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(backend: &str, id: impl std::fmt::Display) -> Self {
        StorageError::NotFound {
            backend: backend.to_string(),
            id: id.to_string(),
        }
    }
}

/// Status class reported to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Denied,
    Conflict,
    NotFound,
    InvalidInput,
    Unavailable,
    Internal,
}

impl ErrorStatus {
    pub fn http_code(self) -> u16 {
        match self {
            ErrorStatus::Denied => 403,
            ErrorStatus::Conflict => 409,
            ErrorStatus::NotFound => 404,
            ErrorStatus::InvalidInput => 422,
            ErrorStatus::Unavailable => 503,
            ErrorStatus::Internal => 500,
        }
    }

    /// Whether a client may retry the whole request.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorStatus::Conflict | ErrorStatus::Unavailable)
    }
}

/// Errors returned by notebook service operations.
#[derive(Debug, Error)]
pub enum NotebookError {
    #[error("Access denied: {author} holds {effective} on notebook {notebook}, {required} required")]
    Denied {
        notebook: String,
        author: String,
        required: String,
        effective: String,
    },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    #[error("Permanent failure of job {job_id}: {reason}")]
    Permanent { job_id: String, reason: String },

    #[error("Replication gap on subscription {subscription_id}: watermark {watermark}, blocked at {blocked_at}")]
    ReplicationGap {
        subscription_id: String,
        watermark: i64,
        blocked_at: i64,
    },

    #[error("Resource not found: {resource}:{id}")]
    NotFound { resource: String, id: String },

    #[error("Invalid input: {field} reason: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl NotebookError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            NotebookError::Denied { .. } => ErrorStatus::Denied,
            NotebookError::Conflict { .. } => ErrorStatus::Conflict,
            NotebookError::Transient { .. } | NotebookError::ReplicationGap { .. } => {
                ErrorStatus::Unavailable
            }
            NotebookError::Permanent { .. } => ErrorStatus::Internal,
            NotebookError::NotFound { .. } => ErrorStatus::NotFound,
            NotebookError::InvalidInput { .. } => ErrorStatus::InvalidInput,
            NotebookError::Storage(e) => match e {
                StorageError::VersionConflict { .. }
                | StorageError::SequenceConflict { .. }
                | StorageError::StaleClaim { .. }
                | StorageError::Duplicate { .. } => ErrorStatus::Conflict,
                StorageError::NotFound { .. } => ErrorStatus::NotFound,
                StorageError::ConnectionError { .. } => ErrorStatus::Unavailable,
                StorageError::QueryError { .. } | StorageError::SerializationError { .. } => {
                    ErrorStatus::Internal
                }
            },
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, NotebookError::Denied { .. })
    }

    pub fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        NotebookError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        NotebookError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Collapses exhausted contention retries into a caller-facing conflict.
    pub fn from_contention(err: StorageError) -> Self {
        if err.is_contention() {
            NotebookError::Conflict {
                reason: err.to_string(),
            }
        } else {
            NotebookError::Storage(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, NotebookError>;

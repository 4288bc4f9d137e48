//! Typed errors for the task, upload and remote-service layers.

use crate::task::TaskStatus;

/// Errors from [`crate::registry::TaskRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown session: {0}")]
    InvalidSession(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("remote job id already assigned for task {0}")]
    RemoteIdAlreadyAssigned(String),
}

/// Errors from [`crate::uploads::UploadStore`].
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload storage failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a [`crate::remote::VideoApi`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The remote service refused the request. The detail is the remote's own
    /// message, surfaced to the user verbatim.
    #[error("{0}")]
    RemoteRejected(String),

    /// Network failure, timeout or a remote 5xx. Transient.
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),
}

/// Rejections of a generation request before any task is created.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("invalid generation request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

//! Error types for the task-queue engine
//!
//! Every failure surfaces as a distinct kind plus a human-readable reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Queue or task id unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name collision
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation conflicts with an in-progress task
    #[error("Busy: {0}")]
    Busy(String),

    /// Malformed task spec
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Process could not start
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Plugin missing or malformed
    #[error("Post-handler load failed: {0}")]
    PostHandlerLoadFailed(String),

    /// Stream requested with nothing running
    #[error("No active task: {0}")]
    NoActiveTask(String),

    /// Unexpected I/O failure while capturing or persisting output
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable error discriminant, used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Busy,
    ValidationFailed,
    SpawnFailed,
    PostHandlerLoadFailed,
    NoActiveTask,
    Internal,
    Unauthorized,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Busy(_) => ErrorKind::Busy,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Self::PostHandlerLoadFailed(_) => ErrorKind::PostHandlerLoadFailed,
            Self::NoActiveTask(_) => ErrorKind::NoActiveTask,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Reason string without the kind prefix
    pub fn reason(&self) -> &str {
        match self {
            Self::NotFound(r)
            | Self::AlreadyExists(r)
            | Self::Busy(r)
            | Self::ValidationFailed(r)
            | Self::SpawnFailed(r)
            | Self::PostHandlerLoadFailed(r)
            | Self::NoActiveTask(r)
            | Self::Internal(r) => r,
        }
    }

    pub(crate) fn no_such_queue(name: &str) -> Self {
        Self::NotFound(format!("no such queue: {}", name))
    }

    pub(crate) fn no_such_task(id: u32) -> Self {
        Self::NotFound(format!("no such id: {}", id))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_reason() {
        let err = Error::no_such_queue("build");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.reason(), "no such queue: build");
        assert_eq!(err.to_string(), "Not found: no such queue: build");
    }

    #[test]
    fn test_io_error_is_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::NoActiveTask).unwrap();
        assert_eq!(json, "\"no_active_task\"");
    }
}

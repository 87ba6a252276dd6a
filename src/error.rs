//! Error types for the chat process manager

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Worker capacity exceeded: {limit} workers already running")]
    CapacityExceeded { limit: usize },

    #[error("Failed to start worker: {0}")]
    SpawnFailure(String),

    #[error("Worker did not report ready within {0:?}")]
    LaunchTimeout(std::time::Duration),

    #[error("Chat {0} is already processing a message")]
    Busy(String),

    #[error("Worker for chat {0} is no longer available")]
    WorkerUnavailable(String),

    #[error("Worker did not reply within {0:?}")]
    DispatchTimeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Failed to send message to worker: {0}")]
    SendFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable tag reported as `type` at the chat boundary
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::SpawnFailure(_) => "spawn_failure",
            Error::LaunchTimeout(_) => "launch_timeout",
            Error::Busy(_) => "busy",
            Error::WorkerUnavailable(_) => "worker_unavailable",
            Error::DispatchTimeout(_) => "dispatch_timeout",
            Error::Protocol(_) => "protocol_error",
            Error::Worker(_) => "worker_error",
            Error::SendFailure(_) => "send_failure",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Config(_) => "config_error",
            Error::InvalidPath(_) => "invalid_path",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether the worker that produced this error has been retired
    pub fn retires_worker(&self) -> bool {
        matches!(
            self,
            Error::DispatchTimeout(_) | Error::Protocol(_) | Error::SendFailure(_)
        )
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

// Errors cross the chat boundary as their display string
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

//! Error types for progrun-core.

use thiserror::Error;

use crate::execute::JobId;

/// Result type for progrun-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in progrun-core.
///
/// Failures of user code are not errors: they are reported as data in a
/// [`RunResult`](crate::RunResult). The variants here are contract violations,
/// transport failures and missing capabilities.
#[derive(Debug, Error)]
pub enum Error {
    /// A reply or lookup named a job id that was never issued, or has been forgotten.
    #[error("Unrecognised job id {0}")]
    UnknownJob(JobId),

    /// A job received a second completion.
    #[error("job {0} has already completed")]
    JobAlreadyCompleted(JobId),

    /// No runner is registered under this name.
    #[error("unknown language runner: {0}")]
    UnknownLanguage(String),

    /// The backend offers no way to interrupt running code.
    #[error("the {0} runner can't be interrupted")]
    InterruptNotSupported(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker sent something that violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker rejected an internal command.
    #[error("worker error: {0}")]
    Worker(String),

    /// The worker went away before replying.
    #[error("worker connection closed")]
    WorkerClosed,

    /// A queued task was dropped before it produced a value.
    #[error("queued task did not complete")]
    TaskDropped,

    /// A question resource could not be fetched.
    #[error("failed to fetch resource {name}: {message}")]
    ResourceFetch { name: String, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

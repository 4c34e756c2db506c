//! Error taxonomy shared across the engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HavocError {
    /// Connectivity or target-namespace check failed. Fatal; nothing has
    /// mutated when this is raised.
    #[error("prerequisite failed: {0}")]
    Prerequisite(String),

    /// No candidate resource matched. Fatal for this run; callers may retry
    /// with an explicit id.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A remote call failed. Soft at phase level: the phase is marked
    /// degraded and the run continues with partial data.
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),

    /// Interactive confirmation declined. No mutation was performed.
    #[error("cancelled by user")]
    UserCancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("report error: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type HavocResult<T> = Result<T, HavocError>;

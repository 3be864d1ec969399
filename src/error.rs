//! Error types for the engine pool.

use std::fmt::Display;

use crate::job::{JobId, JobStatus};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reported by pool operations. All of them are recoverable by the caller.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool size is equal zero")]
    EmptyPool,

    #[error("job with id={id} does not exist")]
    JobNotExists { id: JobId },

    #[error("job {id} cannot be submitted in status {status}")]
    NotSubmittable { id: JobId, status: JobStatus },

    #[error("job id 0 is reserved and cannot be submitted")]
    ReservedJobId,

    #[error("job with id={id} is already in the pool")]
    DuplicateJob { id: JobId },

    #[error("pool has been shut down")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors raised when reading results out of a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {id} has no results (status: {status})")]
    NoResults { id: JobId, status: JobStatus },

    #[error("an error has occurred during job execution (id: {id}): {message}")]
    ExecutionError { id: JobId, message: String },
}

/// Errors from starting, driving or stopping a compute engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine failed to start: {reason}")]
    StartFailed { reason: String },

    #[error("Engine process exited: {reason}")]
    Exited { reason: String },

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from loading a pool factory out of a shared library.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Cannot load library \"{path}\": {reason}")]
    CannotLoadLibrary { path: String, reason: String },

    #[error("Cannot load library function \"{name}\": {reason}")]
    CannotLoadFunction { name: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Report a broken scheduler invariant and abort the process.
///
/// Reached only when the job state machine is driven through a transition it
/// does not allow. Continuing would corrupt the queue or the worker table, so
/// the process is stopped instead of unwinding into the scheduler task.
#[cold]
pub(crate) fn invariant_violation(what: impl Display) -> ! {
    tracing::error!(violation = %what, "Internal consistency violation, aborting");
    std::process::abort()
}

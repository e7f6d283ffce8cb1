//! Typed error hierarchy for the relay pipeline.
//!
//! Two enums cover the two subsystems:
//! - `PipelineError` — fatal stage failures that halt the run
//! - `RegistryError` — hook registry configuration failures, detected eagerly
//!   at registration time
//!
//! Recoverable conditions (audit lookup misses, repository lookup misses) are
//! not modeled here; they are logged and the run continues.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors from the stage executor. Any of these halts the remainder of
/// the chain, closes the overview log, and terminates with non-zero status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "{count} studies have conflicting reviews, please address manually and continue pipeline"
    )]
    ReviewConflict { count: usize },

    #[error("command `{command}` exited with status {code}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("de-identification engine reported failure, see {}", in_progress.display())]
    EngineFailure { in_progress: PathBuf },

    #[error("hook `{0}` is not registered and no default hook exists")]
    HookNotFound(String),

    #[error("failed to write {}: {source}", path.display())]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Hook registry configuration errors. These are raised at registration or
/// unregistration time, never deferred to lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("hook `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error(
        "the default hook cannot be set more than once for this registry (`{existing}` is the default)"
    )]
    DefaultAlreadySet { existing: String },

    #[error("hook `{0}` is not registered")]
    NotRegistered(String),
}

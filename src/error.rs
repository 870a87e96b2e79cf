//! Crate-wide error type.
//!
//! Every public operation returns [`Result<T>`]; no stage boundary panics or throws.
//! Sub-component errors ([`crate::analyzer::AnalyzerError`], [`crate::scheduler::SchedulerError`])
//! convert into [`BuildError`] via `#[from]` so each module's tests can assert against its own
//! error type before the crate-wide one is built on top of it.

use std::path::PathBuf;

use crate::analyzer::AnalyzerError;
use crate::scheduler::SchedulerError;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Top-level error a [`crate::pipeline::Pipeline`] run can fail with.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The job's entry file does not exist or could not be read.
    #[error("input program not found: {0}")]
    InputNotFound(PathBuf),

    /// Two jobs in the same batch target the same output artifact path.
    #[error("output path collision: {0}")]
    OutputCollision(PathBuf),

    /// A job's cancellation token fired mid-stage.
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self::Message(msg.to_string())
    }
}

//! Scheduler error types.

use thiserror::Error;

use batchgrid_state::JobId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {job} has negative priority {priority}")]
    InvalidPriority { job: JobId, priority: i32 },

    #[error("at least one priority level is required")]
    NoLevels,

    #[error("invalid level {level}: {reason}")]
    InvalidLevel { level: usize, reason: String },

    #[error("no such level: {0}")]
    UnknownLevel(usize),

    #[error("state store error: {0}")]
    State(#[from] batchgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

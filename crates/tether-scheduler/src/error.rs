use thiserror::Error;

use tether_core::{JobKey, TriggerKey};

/// Errors raised by a [`Scheduler`](crate::Scheduler) implementation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No job with the given key is stored.
    #[error("Job not found: {key}")]
    JobNotFound { key: JobKey },

    /// `add_job` was called without `replace` for a key that already exists.
    #[error("Job already exists: {key}")]
    JobExists { key: JobKey },

    /// A trigger with the same key is already scheduled.
    #[error("Trigger already exists: {key}")]
    TriggerExists { key: TriggerKey },

    /// A job with no trigger can only be stored when it is durable.
    #[error("Job {key} is not durable and has no trigger")]
    NonDurableJob { key: JobKey },

    /// The scheduler could not be reached or refused the call.
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

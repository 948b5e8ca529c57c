use thiserror::Error;

use tether_core::{CoreError, TriggerKey};
use tether_scheduler::{HookError, JobError, SchedulerError};

#[derive(Debug, Error)]
pub enum HooksError {
    /// A job declares retry or concurrency behaviour but its policy is
    /// missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A metadata value could not be read or written as its declared type.
    #[error("Malformed metadata value for {key}: {source}")]
    Codec {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Parent trigger not found: {key}")]
    ParentNotFound { key: TriggerKey },

    /// Links can only be attached while the parent is waiting to fire.
    #[error("Parent trigger is currently executing: {key}")]
    ParentRunning { key: TriggerKey },

    #[error("Trigger {parent} already continues with {child}")]
    ContinuationExists { parent: TriggerKey, child: TriggerKey },

    /// The execution was cancelled while a scheduler call was in flight.
    #[error("Scheduler call cancelled")]
    Cancelled,
}

impl HooksError {
    /// True for wiring mistakes that should surface immediately.
    pub fn is_configuration(&self) -> bool {
        matches!(self, HooksError::Config(_) | HooksError::Codec { .. })
    }
}

impl From<HooksError> for HookError {
    fn from(e: HooksError) -> Self {
        HookError::Failed(Box::new(e))
    }
}

impl From<HooksError> for JobError {
    fn from(e: HooksError) -> Self {
        JobError::Other(anyhow::Error::new(e))
    }
}

pub type Result<T> = std::result::Result<T, HooksError>;

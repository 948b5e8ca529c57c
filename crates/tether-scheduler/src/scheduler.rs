use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tether_core::{JobKey, TriggerKey};

use crate::error::Result;
use crate::types::{ExecutionContext, JobDetail, Trigger};

/// The operations tether consumes from a time-based scheduler.
///
/// Implementations own trigger persistence, firing and clustering; the
/// orchestration layer only ever talks to them through this trait.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Store `job` (replacing any previous detail) and schedule `trigger`
    /// for it. Returns the first fire time.
    async fn schedule(&self, job: JobDetail, trigger: Trigger) -> Result<DateTime<Utc>>;

    /// Replace the trigger stored under `key` with `trigger`.
    ///
    /// Returns the new fire time, or `None` when no trigger with that key
    /// exists (nothing is stored in that case).
    async fn reschedule(&self, key: &TriggerKey, trigger: Trigger)
        -> Result<Option<DateTime<Utc>>>;

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    /// Remove a trigger. Returns `false` when it did not exist.
    async fn delete_trigger(&self, key: &TriggerKey) -> Result<bool>;

    /// Store a job without scheduling it. Non-durable jobs need a trigger.
    async fn add_job(&self, job: JobDetail, replace: bool) -> Result<()>;

    /// Snapshot of every execution whose job body may currently be running.
    async fn currently_executing(&self) -> Result<Vec<ExecutionContext>>;

    /// Fire a stored job immediately on a freshly generated trigger.
    async fn trigger_now(&self, job: &JobKey) -> Result<TriggerKey>;
}

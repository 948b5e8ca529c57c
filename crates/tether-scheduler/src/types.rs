use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::{JobKey, TriggerKey};

use crate::scheduler::Scheduler;

/// Untyped key/value map attached 1:1 to a trigger.
///
/// The scheduler stores it opaquely; typed access lives in the
/// `tether-hooks` codec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap(Map<String, Value>);

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// A firing instruction bound to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub fire_at: DateTime<Utc>,
    /// Higher value fires first among triggers due at the same instant.
    pub priority: i32,
    pub metadata: MetadataMap,
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, fire_at: DateTime<Utc>) -> Self {
        Self {
            key,
            job_key,
            fire_at,
            priority: 0,
            metadata: MetadataMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Same trigger (key, job, priority, metadata) firing at `fire_at`.
    ///
    /// Every reschedule goes through here so the metadata map is always
    /// carried forward.
    pub fn rebuilt_at(&self, fire_at: DateTime<Utc>) -> Self {
        Self {
            fire_at,
            ..self.clone()
        }
    }
}

/// Failure raised by a job body.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A unit of work. Implementations receive the execution context so they can
/// observe cancellation and reach the scheduler.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError>;
}

/// A job registered with the scheduler under a stable key.
#[derive(Clone)]
pub struct JobDetail {
    pub key: JobKey,
    /// Durable jobs stay stored after their last trigger is gone.
    pub durable: bool,
    pub job: Arc<dyn Job>,
}

impl JobDetail {
    pub fn new(key: impl Into<JobKey>, job: impl Job + 'static) -> Self {
        Self::from_arc(key, Arc::new(job))
    }

    pub fn from_arc(key: impl Into<JobKey>, job: Arc<dyn Job>) -> Self {
        Self {
            key: key.into(),
            durable: false,
            job,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

impl fmt::Debug for JobDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDetail")
            .field("key", &self.key)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

/// Everything a hook or job body sees about one firing.
///
/// `trigger` is a snapshot taken when the trigger fired; later reschedules
/// do not change it.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Unique per firing, distinguishes this execution from others of the
    /// same trigger.
    pub fire_id: Uuid,
    pub trigger: Trigger,
    pub fired_at: DateTime<Utc>,
    cancellation: CancellationToken,
    scheduler_cancellation: CancellationToken,
    scheduler: Arc<dyn Scheduler>,
}

impl ExecutionContext {
    pub fn new(
        trigger: Trigger,
        scheduler: Arc<dyn Scheduler>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            fire_id: Uuid::now_v7(),
            trigger,
            fired_at: Utc::now(),
            cancellation,
            scheduler_cancellation: CancellationToken::new(),
            scheduler,
        }
    }

    /// Token that abandons scheduler calls made on behalf of this firing.
    /// Defaults to one that is never cancelled.
    pub fn with_scheduler_cancellation(mut self, token: CancellationToken) -> Self {
        self.scheduler_cancellation = token;
        self
    }

    pub fn trigger_key(&self) -> &TriggerKey {
        &self.trigger.key
    }

    pub fn job_key(&self) -> &JobKey {
        &self.trigger.job_key
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.trigger.metadata
    }

    /// The scheduler that fired this execution.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Interrupt signal for the job body.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancelled only when the scheduler itself stops serving calls, never
    /// by an interrupt, so hooks can finish their bookkeeping for an
    /// interrupted body.
    pub fn scheduler_cancellation(&self) -> &CancellationToken {
        &self.scheduler_cancellation
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("fire_id", &self.fire_id)
            .field("trigger", &self.trigger)
            .field("fired_at", &self.fired_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rebuilt_trigger_carries_metadata_forward() {
        let mut metadata = MetadataMap::new();
        metadata.insert("attempt", json!(2));
        let t = Trigger::new("q_1".into(), "job".into(), Utc::now())
            .with_priority(3)
            .with_metadata(metadata.clone());

        let later = t.fire_at + chrono::Duration::seconds(30);
        let rebuilt = t.rebuilt_at(later);

        assert_eq!(rebuilt.key, t.key);
        assert_eq!(rebuilt.priority, 3);
        assert_eq!(rebuilt.metadata, metadata);
        assert_eq!(rebuilt.fire_at, later);
    }

    #[test]
    fn metadata_map_serialises_as_plain_object() {
        let mut metadata = MetadataMap::new();
        metadata.insert("k", json!("v"));
        let s = serde_json::to_string(&metadata).unwrap();
        assert_eq!(s, r#"{"k":"v"}"#);
    }
}

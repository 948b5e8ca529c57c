use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tether_core::types::validate_queue_name;
use tether_core::{BackoffPolicy, JobKey, TetherConfig, TriggerKey};
use tether_scheduler::{JobDetail, MetadataMap, Scheduler, Trigger};

use crate::backoff;
use crate::codec::{
    self, MetadataExt, CONCURRENCY_POLICY, CONTINUATION_CHILD, GROUP, RETRY_COUNT, RETRY_POLICY,
};
use crate::error::{HooksError, Result};
use crate::types::{CompletionCondition, ContinuationLink};

/// Per-call knobs for [`JobQueue`]. Unset fields fall back to the queue's
/// entry in [`TetherConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub retry: Option<BackoffPolicy>,
    pub exclusive: bool,
    pub concurrency: Option<BackoffPolicy>,
    pub priority: Option<i32>,
    pub group: Option<String>,
}

impl EnqueueOptions {
    pub fn with_retry(mut self, policy: BackoffPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Never run concurrently with another instance of the same group.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Exclusive, with an explicit postponement policy.
    pub fn with_concurrency(mut self, policy: BackoffPolicy) -> Self {
        self.concurrency = Some(policy);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Exclusive within `group` instead of within the queue.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Work-queue front end over a [`Scheduler`]: fire-and-forget and delayed
/// enqueue, plus continuations.
pub struct JobQueue {
    scheduler: Arc<dyn Scheduler>,
    config: Arc<TetherConfig>,
}

impl JobQueue {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: Arc<TetherConfig>) -> Self {
        Self { scheduler, config }
    }

    /// Run `job` as soon as possible on `queue`.
    pub async fn enqueue(
        &self,
        queue: &str,
        job: JobDetail,
        options: EnqueueOptions,
    ) -> Result<TriggerKey> {
        self.enqueue_at(queue, job, Utc::now(), options).await
    }

    /// Run `job` on `queue` after `delay`.
    pub async fn enqueue_in(
        &self,
        queue: &str,
        job: JobDetail,
        delay: Duration,
        options: EnqueueOptions,
    ) -> Result<TriggerKey> {
        let at = backoff::fire_time(Utc::now(), delay);
        self.enqueue_at(queue, job, at, options).await
    }

    pub async fn enqueue_at(
        &self,
        queue: &str,
        job: JobDetail,
        at: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<TriggerKey> {
        validate_queue_name(queue)?;
        let key = TriggerKey::generate(queue);
        let trigger = self.build_trigger(queue, key.clone(), job.key.clone(), at, &options)?;
        let fire_at = self.scheduler.schedule(job, trigger).await?;
        info!(queue, trigger = %key, %fire_at, "job enqueued");
        Ok(key)
    }

    /// Store `job` durably so it can be fired later with [`JobQueue::trigger`].
    pub async fn register(&self, job: JobDetail) -> Result<()> {
        let key = job.key.clone();
        self.scheduler.add_job(job.durable(true), true).await?;
        info!(job = %key, "durable job registered");
        Ok(())
    }

    /// Fire a registered job now.
    pub async fn trigger(&self, job: &JobKey) -> Result<TriggerKey> {
        Ok(self.scheduler.trigger_now(job).await?)
    }

    /// Link `job` to run on `queue` after `parent` completes under `condition`.
    ///
    /// The child trigger is created inert (parked at the configured horizon)
    /// before the link is written into the parent, so a stored link always
    /// points at an existing trigger. Returns the child's trigger key, which
    /// can itself be used as a parent.
    pub async fn continue_with(
        &self,
        parent: &TriggerKey,
        queue: &str,
        job: JobDetail,
        condition: CompletionCondition,
        options: EnqueueOptions,
    ) -> Result<TriggerKey> {
        validate_queue_name(queue)?;

        let parent_trigger = self
            .scheduler
            .get_trigger(parent)
            .await?
            .ok_or_else(|| HooksError::ParentNotFound { key: parent.clone() })?;
        if let Some(child) = parent_trigger.metadata.read(&CONTINUATION_CHILD)? {
            return Err(HooksError::ContinuationExists {
                parent: parent.clone(),
                child,
            });
        }
        let running = self.scheduler.currently_executing().await?;
        if running.iter().any(|c| c.trigger_key() == parent) {
            return Err(HooksError::ParentRunning { key: parent.clone() });
        }

        let child_key = TriggerKey::continuation(queue);
        let horizon_days = u64::try_from(self.config.scheduler.inert_horizon_days).unwrap_or(0);
        let inert_at = backoff::fire_time(
            Utc::now(),
            Duration::from_secs(horizon_days.saturating_mul(86_400)),
        );
        let child =
            self.build_trigger(queue, child_key.clone(), job.key.clone(), inert_at, &options)?;
        self.scheduler.schedule(job.durable(true), child).await?;

        let link = ContinuationLink {
            child: child_key.clone(),
            condition,
            priority: options.priority,
        };
        let mut linked = parent_trigger;
        codec::write_continuation(&mut linked.metadata, &link)?;

        if self.scheduler.reschedule(parent, linked).await?.is_none() {
            warn!(parent = %parent, child = %child_key, "parent vanished while linking, dropping child");
            self.scheduler.delete_trigger(&child_key).await?;
            return Err(HooksError::ParentNotFound { key: parent.clone() });
        }

        info!(parent = %parent, child = %child_key, ?condition, "continuation linked");
        Ok(child_key)
    }

    fn build_trigger(
        &self,
        queue: &str,
        key: TriggerKey,
        job_key: JobKey,
        at: DateTime<Utc>,
        options: &EnqueueOptions,
    ) -> Result<Trigger> {
        let queue_config = self.config.queue(queue);
        let mut metadata = MetadataMap::new();

        let retry = options
            .retry
            .as_ref()
            .or_else(|| queue_config.and_then(|q| q.retry.as_ref()));
        if let Some(retry) = retry {
            metadata.write(&RETRY_POLICY, retry)?;
            metadata.write(&RETRY_COUNT, &0)?;
        }

        let exclusive = options.exclusive
            || options.concurrency.is_some()
            || options.group.is_some()
            || queue_config.is_some_and(|q| q.exclusive);
        if exclusive {
            let policy = options
                .concurrency
                .as_ref()
                .unwrap_or(&self.config.concurrency);
            let group = options.group.clone().unwrap_or_else(|| queue.to_string());
            metadata.write(&CONCURRENCY_POLICY, policy)?;
            metadata.write(&GROUP, &group)?;
        }

        let priority = options
            .priority
            .unwrap_or_else(|| self.config.priority_for(queue));
        Ok(Trigger::new(key, job_key, at)
            .with_priority(priority)
            .with_metadata(metadata))
    }
}

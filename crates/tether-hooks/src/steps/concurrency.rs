use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use tether_core::BackoffPolicy;
use tether_scheduler::ExecutionContext;

use crate::backoff;
use crate::cleanup::schedule_cleanup;
use crate::codec::{self, MetadataExt, CONCURRENCY_COUNT, CONCURRENCY_POLICY, GROUP};
use crate::error::{HooksError, Result};
use crate::forward::forward;
use crate::types::{Admission, Step};

/// Keeps two instances of one logical job from running at the same time.
///
/// This is a best-effort check: the "list running executions, then decide"
/// sequence is not atomic, so two firings that reach it together can both
/// be admitted. A hard guarantee needs an external lock.
///
/// On conflict the trigger is rescheduled with backoff using its own
/// concurrency counter, separate from the execution-retry counter. Once the
/// ceiling is reached the firing is dropped and its continuation chain is
/// handed to a cleanup job.
pub struct ConcurrencyStep {
    cleanup: BackoffPolicy,
}

impl ConcurrencyStep {
    /// `cleanup` is the retry policy attached to scheduled chain cleanups.
    pub fn new(cleanup: BackoffPolicy) -> Self {
        Self { cleanup }
    }
}

#[async_trait]
impl Step for ConcurrencyStep {
    fn name(&self) -> &str {
        "concurrency"
    }

    async fn before(&self, ctx: &ExecutionContext) -> Result<Admission> {
        let key = ctx.trigger_key();
        let metadata = ctx.metadata();

        let Some(policy) = metadata.read(&CONCURRENCY_POLICY)? else {
            if metadata.has(&GROUP) || metadata.has(&CONCURRENCY_COUNT) {
                return Err(HooksError::Config(format!(
                    "trigger {key} declares concurrency control without a concurrency policy"
                )));
            }
            return Ok(Admission::Proceed);
        };

        let group = codec::group_of(&ctx.trigger)?;
        let running = forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().currently_executing(),
        )
        .await?;
        let conflict = running.iter().find(|other| {
            other.fire_id != ctx.fire_id
                && codec::group_of(&other.trigger).ok().as_deref() == Some(group.as_str())
        });
        let Some(other) = conflict else {
            debug!(trigger = %key, %group, "no running instance, admitted");
            return Ok(Admission::Proceed);
        };

        let attempt = metadata.read(&CONCURRENCY_COUNT)?.unwrap_or(0);
        if policy.is_exhausted(attempt) {
            warn!(
                trigger = %key,
                %group,
                running = %other.trigger_key(),
                attempt,
                "concurrency retries exhausted, firing dropped"
            );
            if let Some(link) = codec::continuation(metadata)? {
                schedule_cleanup(ctx, &link.child, &self.cleanup).await?;
            }
            return Ok(Admission::Vetoed {
                reason: format!("logical job {group} still running after {attempt} postponements"),
            });
        }

        let delay = backoff::delay(attempt, &policy.delays);
        let mut next = ctx.trigger.rebuilt_at(backoff::fire_time(Utc::now(), delay));
        next.metadata.write(&CONCURRENCY_COUNT, &(attempt + 1))?;

        let rescheduled = forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().reschedule(key, next),
        )
        .await?;
        if rescheduled.is_none() {
            return Ok(Admission::Vetoed {
                reason: format!("trigger {key} removed while postponing"),
            });
        }

        info!(
            trigger = %key,
            %group,
            running = %other.trigger_key(),
            attempt = attempt + 1,
            delay_secs = delay.as_secs(),
            "logical job already running, firing postponed"
        );
        Ok(Admission::Rearmed {
            reason: format!("logical job {group} already running as {}", other.trigger_key()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RETRY_COUNT, RETRY_POLICY};
    use serde_json::json;
    use tether_core::config::SchedulerConfig;
    use tether_core::TriggerKey;
    use tether_scheduler::{
        Job, JobDetail, JobError, MemoryScheduler, MetadataMap, Scheduler, Trigger,
    };
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    /// Runs until released.
    struct Hold(Arc<Notify>);

    #[async_trait]
    impl Job for Hold {
        async fn execute(&self, _: &ExecutionContext) -> std::result::Result<(), JobError> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _: &ExecutionContext) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    fn exclusive(max: u32) -> MetadataMap {
        let mut m = MetadataMap::new();
        m.write(&CONCURRENCY_POLICY, &BackoffPolicy::new(max, vec![7])).unwrap();
        m
    }

    async fn fire(s: &MemoryScheduler, queue: &str, metadata: MetadataMap) -> ExecutionContext {
        let t = Trigger::new(TriggerKey::generate(queue), "job".into(), Utc::now())
            .with_metadata(metadata);
        s.schedule(JobDetail::new("job", Noop), t.clone()).await.unwrap();
        ExecutionContext::new(t, s.handle(), CancellationToken::new())
    }

    fn step() -> ConcurrencyStep {
        ConcurrencyStep::new(BackoffPolicy::new(3, vec![1]))
    }

    #[tokio::test]
    async fn job_without_policy_is_admitted() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = fire(&s, "sync", MetadataMap::new()).await;
        assert_eq!(step().before(&ctx).await.unwrap(), Admission::Proceed);
    }

    #[tokio::test]
    async fn group_without_policy_is_a_configuration_error() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let mut m = MetadataMap::new();
        m.write(&GROUP, &"sync".to_string()).unwrap();
        let ctx = fire(&s, "sync", m).await;
        assert!(step().before(&ctx).await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn lone_instance_is_admitted() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = fire(&s, "sync", exclusive(3)).await;
        assert_eq!(step().before(&ctx).await.unwrap(), Admission::Proceed);
    }

    #[tokio::test]
    async fn admission_check_ignores_execution_retry_counter() {
        // A high execution-retry count must not be mistaken for a concurrency count.
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let mut m = exclusive(1);
        m.write(&RETRY_POLICY, &BackoffPolicy::exponential(9)).unwrap();
        m.write(&RETRY_COUNT, &5).unwrap();
        m.insert("app.payload", json!({"id": 1}));
        let ctx = fire(&s, "sync", m).await;
        assert_eq!(step().before(&ctx).await.unwrap(), Admission::Proceed);
    }

    #[tokio::test]
    async fn key_prefix_identifies_group_when_none_is_stored() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let release = Arc::new(Notify::new());
        let running = Trigger::new(TriggerKey::generate("sync"), "hold".into(), Utc::now())
            .with_metadata(exclusive(3));
        s.schedule(JobDetail::new("hold", Hold(Arc::clone(&release))), running)
            .await
            .unwrap();
        let handles = s.spawn_due(Utc::now());
        assert_eq!(handles.len(), 1);

        let ctx = fire(&s, "sync", exclusive(3)).await;
        assert!(!ctx.metadata().has(&GROUP));
        let before = Utc::now();
        let admission = step().before(&ctx).await.unwrap();
        assert!(matches!(admission, Admission::Rearmed { .. }));

        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored.metadata.read(&CONCURRENCY_COUNT).unwrap(), Some(1));
        assert!(stored.fire_at >= before + chrono::Duration::seconds(7));

        let other = fire(&s, "reports", exclusive(3)).await;
        assert_eq!(step().before(&other).await.unwrap(), Admission::Proceed);

        release.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use tether_core::BackoffPolicy;
use tether_scheduler::{ExecutionContext, JobError};

use crate::cleanup::schedule_cleanup;
use crate::codec::{self, MetadataExt, RETRY_COUNT};
use crate::error::Result;
use crate::forward::forward;
use crate::types::{ObservedState, Step};

/// Fires or tears down the follow-up trigger linked from a finished one.
///
/// Success or failure is derived from the execution error here, not from
/// what the retry step decided. The only thing taken from the scheduler is
/// whether a newer attempt of this trigger is already waiting, in which case
/// the decision belongs to that attempt.
pub struct ContinuationStep {
    cleanup: BackoffPolicy,
}

impl ContinuationStep {
    /// `cleanup` is the retry policy attached to scheduled chain cleanups.
    pub fn new(cleanup: BackoffPolicy) -> Self {
        Self { cleanup }
    }

    /// True when the stored trigger is a later attempt than the one that ran.
    async fn superseded(&self, ctx: &ExecutionContext) -> Result<bool> {
        let stored = forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().get_trigger(ctx.trigger_key()),
        )
        .await?;
        let Some(stored) = stored else {
            return Ok(false);
        };
        let ran = ctx.metadata().read(&RETRY_COUNT)?.unwrap_or(0);
        let waiting = stored.metadata.read(&RETRY_COUNT)?.unwrap_or(0);
        Ok(waiting > ran)
    }
}

#[async_trait]
impl Step for ContinuationStep {
    fn name(&self) -> &str {
        "continuation"
    }

    async fn after(&self, ctx: &ExecutionContext, error: Option<&JobError>) -> Result<()> {
        let Some(link) = codec::continuation(ctx.metadata())? else {
            return Ok(());
        };
        let key = ctx.trigger_key();

        if self.superseded(ctx).await? {
            debug!(trigger = %key, child = %link.child, "retry pending, continuation deferred");
            return Ok(());
        }

        let observed = ObservedState::from_error(error);
        if !link.condition.accepts(observed) {
            info!(
                trigger = %key,
                child = %link.child,
                ?observed,
                condition = ?link.condition,
                "continuation condition not met, removing chain"
            );
            schedule_cleanup(ctx, &link.child, &self.cleanup).await?;
            return Ok(());
        }

        let child = forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().get_trigger(&link.child),
        )
        .await?;
        let Some(child) = child else {
            warn!(trigger = %key, child = %link.child, "continuation trigger missing, nothing to fire");
            return Ok(());
        };

        let mut due = child.rebuilt_at(Utc::now());
        if let Some(priority) = link.priority {
            due.priority = priority;
        }
        forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().reschedule(&link.child, due),
        )
        .await?;
        info!(trigger = %key, child = %link.child, ?observed, "continuation fired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_continuation, RETRY_POLICY};
    use crate::types::{CompletionCondition, ContinuationLink};
    use tether_core::config::SchedulerConfig;
    use tether_core::{JobKey, TriggerKey};
    use tether_scheduler::{Job, JobDetail, MemoryScheduler, MetadataMap, Scheduler, Trigger};
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _: &ExecutionContext) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    fn step() -> ContinuationStep {
        ContinuationStep::new(BackoffPolicy::new(3, vec![1]))
    }

    fn far() -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::days(365)
    }

    /// Stores a parent linked to an inert child and returns the parent's context.
    async fn linked(
        s: &MemoryScheduler,
        condition: CompletionCondition,
        priority: Option<i32>,
    ) -> ExecutionContext {
        let child = Trigger::new("child".into(), "child-job".into(), far());
        s.schedule(JobDetail::new("child-job", Noop).durable(true), child)
            .await
            .unwrap();

        let mut metadata = MetadataMap::new();
        let link = ContinuationLink {
            child: "child".into(),
            condition,
            priority,
        };
        write_continuation(&mut metadata, &link).unwrap();
        let parent = Trigger::new("parent".into(), "job".into(), Utc::now()).with_metadata(metadata);
        s.schedule(JobDetail::new("job", Noop), parent.clone()).await.unwrap();
        ExecutionContext::new(parent, s.handle(), CancellationToken::new())
    }

    #[tokio::test]
    async fn trigger_without_link_is_ignored() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let t = Trigger::new("solo".into(), "job".into(), Utc::now());
        let ctx = ExecutionContext::new(t, s.handle(), CancellationToken::new());
        step().after(&ctx, None).await.unwrap();
        assert!(s.triggers().is_empty());
    }

    #[tokio::test]
    async fn matching_condition_makes_child_due_with_link_priority() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = linked(&s, CompletionCondition::OnSuccess, Some(9)).await;

        step().after(&ctx, None).await.unwrap();

        let child = s.get_trigger(&"child".into()).await.unwrap().unwrap();
        assert!(child.fire_at <= Utc::now());
        assert_eq!(child.priority, 9);
        assert_eq!(child.job_key, JobKey::new("child-job"));
    }

    #[tokio::test]
    async fn unmet_condition_schedules_cleanup_instead_of_firing() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = linked(&s, CompletionCondition::OnSuccess, None).await;

        step().after(&ctx, Some(&JobError::failed("x"))).await.unwrap();

        let child = s.get_trigger(&"child".into()).await.unwrap().unwrap();
        assert!(child.fire_at > Utc::now());
        let cleanups = s
            .triggers()
            .into_iter()
            .filter(|t| t.key.logical_prefix() == crate::cleanup::CLEANUP_QUEUE)
            .count();
        assert_eq!(cleanups, 1);
    }

    #[tokio::test]
    async fn pending_retry_defers_decision() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = linked(&s, CompletionCondition::OnSuccess, None).await;

        let mut retried = ctx.trigger.rebuilt_at(Utc::now());
        retried.metadata.write(&RETRY_POLICY, &BackoffPolicy::new(2, vec![1])).unwrap();
        retried.metadata.write(&RETRY_COUNT, &1).unwrap();
        s.reschedule(ctx.trigger_key(), retried).await.unwrap();

        step().after(&ctx, Some(&JobError::failed("x"))).await.unwrap();

        let child = s.get_trigger(&"child".into()).await.unwrap().unwrap();
        assert!(child.fire_at > Utc::now());
        assert_eq!(s.triggers().len(), 2);
    }

    #[tokio::test]
    async fn missing_child_is_not_an_error() {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let ctx = linked(&s, CompletionCondition::OnEither, None).await;
        s.delete_trigger(&TriggerKey::from("child")).await.unwrap();

        step().after(&ctx, None).await.unwrap();
        assert!(s.get_trigger(&"child".into()).await.unwrap().is_none());
    }
}

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use tether_scheduler::{ExecutionContext, JobError};

use crate::backoff;
use crate::codec::{MetadataExt, RETRY_COUNT, RETRY_POLICY};
use crate::error::Result;
use crate::forward::forward;
use crate::types::Step;

/// Absorbs a failed execution by replacing its trigger with a later one.
///
/// The attempt counter travels in the trigger's metadata and only grows; a
/// brand-new trigger is the only way to reset it.
pub struct RetryStep;

#[async_trait]
impl Step for RetryStep {
    fn name(&self) -> &str {
        "retry"
    }

    async fn after(&self, ctx: &ExecutionContext, error: Option<&JobError>) -> Result<()> {
        let Some(error) = error else {
            return Ok(());
        };
        let key = ctx.trigger_key();
        let metadata = ctx.metadata();

        let Some(policy) = metadata.read(&RETRY_POLICY)? else {
            debug!(trigger = %key, "no retry policy, failure propagates");
            return Ok(());
        };
        let attempt = metadata.read(&RETRY_COUNT)?.unwrap_or(0);
        if policy.is_exhausted(attempt) {
            warn!(
                trigger = %key,
                attempt,
                max_attempts = policy.max_attempts,
                "retries exhausted, failure propagates"
            );
            return Ok(());
        }

        let delay = backoff::delay(attempt, &policy.delays);
        let mut next = ctx.trigger.rebuilt_at(backoff::fire_time(Utc::now(), delay));
        next.metadata.write(&RETRY_COUNT, &(attempt + 1))?;

        let rescheduled = forward(
            ctx.scheduler_cancellation(),
            ctx.scheduler().reschedule(key, next),
        )
        .await?;
        match rescheduled {
            Some(fire_at) => info!(
                trigger = %key,
                attempt = attempt + 1,
                delay_secs = delay.as_secs(),
                %fire_at,
                %error,
                "job failed, retry scheduled"
            ),
            None => warn!(trigger = %key, "trigger removed before retry could be scheduled"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HooksError;
    use serde_json::json;
    use tether_core::config::SchedulerConfig;
    use tether_core::BackoffPolicy;
    use tether_scheduler::{JobDetail, MemoryScheduler, MetadataMap, Scheduler, Trigger};
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl tether_scheduler::Job for Noop {
        async fn execute(&self, _: &ExecutionContext) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    async fn stored_ctx(metadata: MetadataMap) -> (MemoryScheduler, ExecutionContext) {
        let s = MemoryScheduler::new(SchedulerConfig::default(), None);
        let t = Trigger::new("q_1".into(), "job".into(), Utc::now()).with_metadata(metadata);
        s.schedule(JobDetail::new("job", Noop), t.clone()).await.unwrap();
        let ctx = ExecutionContext::new(t, s.handle(), CancellationToken::new());
        (s, ctx)
    }

    fn policy(max: u32, delays: &[u64]) -> MetadataMap {
        let mut m = MetadataMap::new();
        m.write(&RETRY_POLICY, &BackoffPolicy::new(max, delays.to_vec())).unwrap();
        m
    }

    #[tokio::test]
    async fn success_passes_through() {
        let (s, ctx) = stored_ctx(policy(3, &[1])).await;
        RetryStep.after(&ctx, None).await.unwrap();
        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored, ctx.trigger);
    }

    #[tokio::test]
    async fn failure_without_policy_is_left_alone() {
        let (s, ctx) = stored_ctx(MetadataMap::new()).await;
        RetryStep.after(&ctx, Some(&JobError::failed("x"))).await.unwrap();
        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored, ctx.trigger);
    }

    #[tokio::test]
    async fn failure_reschedules_with_incremented_count_and_metadata_kept() {
        let mut m = policy(3, &[10, 20]);
        m.insert("app.tenant", json!("acme"));
        let (s, ctx) = stored_ctx(m).await;

        let before = Utc::now();
        RetryStep.after(&ctx, Some(&JobError::failed("x"))).await.unwrap();

        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored.metadata.read(&RETRY_COUNT).unwrap(), Some(1));
        assert_eq!(stored.metadata.get("app.tenant"), Some(&json!("acme")));
        let delay = (stored.fire_at - before).num_seconds();
        assert!((10..=11).contains(&delay), "delay was {delay}");
    }

    #[tokio::test]
    async fn exhausted_policy_does_not_reschedule() {
        let mut m = policy(2, &[1]);
        m.write(&RETRY_COUNT, &2).unwrap();
        let (s, ctx) = stored_ctx(m).await;
        RetryStep.after(&ctx, Some(&JobError::failed("x"))).await.unwrap();
        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored.fire_at, ctx.trigger.fire_at);
    }

    #[tokio::test]
    async fn policy_without_ceiling_raises() {
        let mut m = MetadataMap::new();
        m.insert(RETRY_POLICY.name(), json!({ "delays": [1] }));
        let (_s, ctx) = stored_ctx(m).await;
        let err = RetryStep
            .after(&ctx, Some(&JobError::failed("x")))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, HooksError::Codec { .. }));
    }

    #[tokio::test]
    async fn interrupted_body_is_still_retried() {
        let (s, ctx) = stored_ctx(policy(3, &[1])).await;
        ctx.cancellation().cancel();
        RetryStep.after(&ctx, Some(&JobError::Cancelled)).await.unwrap();
        let stored = s.get_trigger(ctx.trigger_key()).await.unwrap().unwrap();
        assert_eq!(stored.metadata.read(&RETRY_COUNT).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn closed_scheduler_abandons_reschedule() {
        let (_s, ctx) = stored_ctx(policy(3, &[1])).await;
        let token = CancellationToken::new();
        let ctx = ctx.with_scheduler_cancellation(token.clone());
        token.cancel();
        let err = RetryStep
            .after(&ctx, Some(&JobError::failed("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, HooksError::Cancelled));
    }
}

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_core::{BackoffPolicy, JobKey, TriggerKey};
use tether_scheduler::{
    ExecutionContext, Job, JobDetail, JobError, MetadataMap, Scheduler, Trigger,
};

use crate::codec::{MetadataExt, CLEANUP_START, CONTINUATION_CHILD, RETRY_POLICY};
use crate::error::Result;
use crate::forward::forward;

/// Queue name of scheduled cleanup triggers.
pub const CLEANUP_QUEUE: &str = "tether-cleanup";

/// Job key shared by every cleanup trigger.
pub const CLEANUP_JOB: &str = "tether.cleanup";

/// Delete the continuation chain that starts at `start`.
///
/// Follows each trigger's child link until a link is missing. Triggers that
/// are already gone end the walk quietly, so running this twice is a no-op
/// the second time. Returns the number of triggers deleted.
pub async fn remove_chain(
    scheduler: &dyn Scheduler,
    start: &TriggerKey,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut next = Some(start.clone());
    let mut removed = 0;

    while let Some(key) = next.take() {
        let Some(trigger) = forward(cancel, scheduler.get_trigger(&key)).await? else {
            debug!(trigger = %key, "chain link already gone");
            break;
        };
        if forward(cancel, scheduler.delete_trigger(&key)).await? {
            removed += 1;
        }
        next = trigger.metadata.read(&CONTINUATION_CHILD)?;
    }

    Ok(removed)
}

/// Scheduled form of [`remove_chain`].
///
/// The start key travels in the trigger metadata, and the trigger carries a
/// retry policy, so a scheduler that is briefly unreachable is retried by
/// the pipeline like any other failing job.
pub struct CleanupJob;

#[async_trait]
impl Job for CleanupJob {
    async fn execute(&self, ctx: &ExecutionContext) -> std::result::Result<(), JobError> {
        let start = ctx
            .metadata()
            .read(&CLEANUP_START)?
            .ok_or_else(|| JobError::failed("cleanup trigger carries no start key"))?;
        let removed = remove_chain(ctx.scheduler().as_ref(), &start, ctx.cancellation()).await?;
        info!(start = %start, removed, "continuation chain removed");
        Ok(())
    }
}

/// Schedule a [`CleanupJob`] for the chain starting at `start`, firing now.
pub async fn schedule_cleanup(
    ctx: &ExecutionContext,
    start: &TriggerKey,
    retry: &BackoffPolicy,
) -> Result<TriggerKey> {
    let key = TriggerKey::generate(CLEANUP_QUEUE);
    let mut metadata = MetadataMap::new();
    metadata.write(&CLEANUP_START, start)?;
    metadata.write(&RETRY_POLICY, retry)?;

    let trigger =
        Trigger::new(key.clone(), JobKey::new(CLEANUP_JOB), Utc::now()).with_metadata(metadata);
    let job = JobDetail::new(CLEANUP_JOB, CleanupJob);
    forward(ctx.scheduler_cancellation(), ctx.scheduler().schedule(job, trigger)).await?;

    debug!(cleanup = %key, start = %start, "chain cleanup scheduled");
    Ok(key)
}

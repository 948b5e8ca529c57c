use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info};

use tether_core::TetherConfig;
use tether_scheduler::{ExecutionContext, ExecutionHooks, HookError, JobError};

use crate::error::{HooksError, Result};
use crate::steps::{ConcurrencyStep, ContinuationStep, RetryStep};
use crate::types::{Admission, Step};

/// Ordered list of [`Step`]s exposed to the scheduler as one hook pair.
///
/// Before-phases run in registration order until one does not return
/// [`Admission::Proceed`]. After-phases always run for every step, in
/// registration order, whichever before-path was taken.
pub struct Pipeline {
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// The standard chain: concurrency admission, then retry, then
    /// continuation.
    pub fn standard(config: &TetherConfig) -> Self {
        Self::new()
            .with_step(ConcurrencyStep::new(config.cleanup.clone()))
            .with_step(RetryStep)
            .with_step(ContinuationStep::new(config.cleanup.clone()))
    }

    /// Append a step. Order is significant and fixed once the pipeline is
    /// handed to a scheduler.
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        debug!(step = step.name(), position = self.steps.len(), "step registered");
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run before-phases from `cursor` onwards.
    async fn dispatch_before(&self, ctx: &ExecutionContext, mut cursor: usize) -> Result<Admission> {
        while let Some(step) = self.steps.get(cursor) {
            let t = Instant::now();
            let admission = step.before(ctx).await?;
            debug!(
                step = step.name(),
                duration_ms = t.elapsed().as_millis() as u64,
                "before step completed"
            );
            if admission != Admission::Proceed {
                info!(step = step.name(), trigger = %ctx.trigger_key(), ?admission, "chain halted");
                return Ok(admission);
            }
            cursor += 1;
        }
        Ok(Admission::Proceed)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionHooks for Pipeline {
    async fn before_execute(&self, ctx: &ExecutionContext) -> std::result::Result<(), HookError> {
        match self.dispatch_before(ctx, 0).await {
            Ok(Admission::Proceed) => Ok(()),
            Ok(Admission::Rearmed { reason }) => Err(HookError::Rearmed { reason }),
            Ok(Admission::Vetoed { reason }) => Err(HookError::Vetoed { reason }),
            Err(e) => {
                error!(trigger = %ctx.trigger_key(), error = %e, "before phase failed");
                Err(e.into())
            }
        }
    }

    /// A failing step does not stop later steps; the first failure is
    /// returned once all have run.
    async fn after_execute(
        &self,
        ctx: &ExecutionContext,
        error: Option<&JobError>,
    ) -> std::result::Result<(), HookError> {
        let mut first_failure: Option<HooksError> = None;

        for step in &self.steps {
            let t = Instant::now();
            match step.after(ctx, error).await {
                Ok(()) => debug!(
                    step = step.name(),
                    duration_ms = t.elapsed().as_millis() as u64,
                    "after step completed"
                ),
                Err(e) => {
                    error!(step = step.name(), trigger = %ctx.trigger_key(), error = %e, "after step failed");
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

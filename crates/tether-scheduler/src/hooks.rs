use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ExecutionContext, JobError};

/// What a hook can tell the scheduler.
///
/// `Rearmed` and `Vetoed` are control flow, not failures: the job body does
/// not run and no failure is reported.
#[derive(Debug, Error)]
pub enum HookError {
    /// The trigger has already been rescheduled by the hook; try later.
    #[error("execution rearmed: {reason}")]
    Rearmed { reason: String },

    /// This firing is dropped.
    #[error("execution vetoed: {reason}")]
    Vetoed { reason: String },

    /// The hook itself failed.
    #[error("hook failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    /// True for the two control signals that are not failures.
    pub fn is_signal(&self) -> bool {
        matches!(self, HookError::Rearmed { .. } | HookError::Vetoed { .. })
    }
}

/// The before/after pair a scheduler invokes around every job body.
///
/// `before_execute` returning any error means "do not run". A `Failed`
/// error additionally asks the scheduler to re-arm the trigger itself.
/// `after_execute` is only called when the body actually ran.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn before_execute(&self, ctx: &ExecutionContext) -> Result<(), HookError>;

    async fn after_execute(
        &self,
        ctx: &ExecutionContext,
        error: Option<&JobError>,
    ) -> Result<(), HookError>;
}

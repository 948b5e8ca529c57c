use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::TriggerKey;
use tether_scheduler::{ExecutionContext, JobError};

use crate::error::Result;

/// Result of a step's before-phase.
///
/// Anything other than `Proceed` halts the chain: later steps' before-phases
/// and the job body do not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// The step rescheduled the trigger itself; the firing is postponed.
    Rearmed { reason: String },
    /// The firing is dropped.
    Vetoed { reason: String },
}

/// One stage of the execution pipeline.
///
/// Steps are registered once, in order, on a [`Pipeline`](crate::Pipeline).
/// Both phases default to no-ops so a step only implements the phase it
/// cares about.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &ExecutionContext) -> Result<Admission> {
        Ok(Admission::Proceed)
    }

    /// Runs after the job body with its error, if any.
    async fn after(&self, _ctx: &ExecutionContext, _error: Option<&JobError>) -> Result<()> {
        Ok(())
    }
}

/// How a finished execution ended, as seen by continuation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Success,
    Failure,
}

impl ObservedState {
    pub fn from_error(error: Option<&JobError>) -> Self {
        match error {
            None => ObservedState::Success,
            Some(_) => ObservedState::Failure,
        }
    }
}

/// When a continuation fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCondition {
    OnSuccess,
    OnFailure,
    OnEither,
}

impl CompletionCondition {
    pub fn accepts(self, observed: ObservedState) -> bool {
        match self {
            CompletionCondition::OnEither => true,
            CompletionCondition::OnSuccess => observed == ObservedState::Success,
            CompletionCondition::OnFailure => observed == ObservedState::Failure,
        }
    }
}

/// Pointer from a parent trigger to its pre-created child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationLink {
    pub child: TriggerKey,
    pub condition: CompletionCondition,
    /// Priority applied to the child when it fires.
    pub priority: Option<i32>,
}

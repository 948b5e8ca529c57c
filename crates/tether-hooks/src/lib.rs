//! `tether-hooks` — job-lifecycle orchestration on top of a [`Scheduler`].
//!
//! # Overview
//!
//! Every firing passes through a [`Pipeline`] of [`Step`]s registered on the
//! scheduler as one [`ExecutionHooks`] pair. Steps keep all of their state in
//! the trigger's metadata map (see [`codec`]), so a job's retry count,
//! concurrency postponements and continuation link survive any number of
//! reschedules without a store of their own.
//!
//! # Standard pipeline
//!
//! | Order | Step           | Phase  |
//! |-------|----------------|--------|
//! | 1     | `concurrency`  | before |
//! | 2     | `retry`        | after  |
//! | 3     | `continuation` | after  |
//!
//! [`JobQueue`] is the client side: it creates triggers carrying the right
//! metadata and links continuations to existing triggers.
//!
//! [`Scheduler`]: tether_scheduler::Scheduler
//! [`ExecutionHooks`]: tether_scheduler::ExecutionHooks

pub mod backoff;
pub mod cleanup;
pub mod codec;
pub mod engine;
pub mod error;
pub mod forward;
pub mod queue;
pub mod steps;
pub mod types;

pub use cleanup::{remove_chain, schedule_cleanup, CleanupJob};
pub use engine::Pipeline;
pub use error::{HooksError, Result};
pub use queue::{EnqueueOptions, JobQueue};
pub use steps::{ConcurrencyStep, ContinuationStep, RetryStep};
pub use types::{Admission, CompletionCondition, ContinuationLink, ObservedState, Step};

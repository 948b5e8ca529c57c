//! `tether-scheduler` — the time-based scheduler surface tether builds on.
//!
//! # Overview
//!
//! The job-lifecycle layer never owns storage. Everything it needs from the
//! outside world is expressed by the [`Scheduler`] trait (store, replace,
//! fetch and delete triggers, store jobs, list running executions) and the
//! [`ExecutionHooks`] pair the scheduler calls around every job body.
//!
//! [`MemoryScheduler`] is an in-process implementation of both sides of that
//! contract: it keeps jobs and triggers in memory, fires due triggers on a
//! Tokio task per execution and invokes the registered hooks.
//!
//! # Trigger lifecycle
//!
//! | Step        | Behaviour                                                     |
//! |-------------|---------------------------------------------------------------|
//! | `schedule`  | Job stored (replacing any previous detail), trigger waiting   |
//! | fire        | Trigger acquired, context registered as currently executing   |
//! | reschedule  | Trigger replaced; a replaced trigger survives its execution   |
//! | complete    | Trigger consumed unless replaced; orphaned jobs removed       |

pub mod engine;
pub mod error;
pub mod hooks;
pub mod scheduler;
pub mod types;

pub use engine::{ExecutionOutcome, ExecutionReport, MemoryScheduler};
pub use error::{Result, SchedulerError};
pub use hooks::{ExecutionHooks, HookError};
pub use scheduler::Scheduler;
pub use types::{ExecutionContext, Job, JobDetail, JobError, MetadataMap, Trigger};

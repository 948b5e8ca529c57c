//! The built-in pipeline steps.
//!
//! | Step           | Phase  | Decision                                            |
//! |----------------|--------|-----------------------------------------------------|
//! | `concurrency`  | before | postpone or drop a firing whose logical job is busy |
//! | `retry`        | after  | absorb a failure by rescheduling with backoff       |
//! | `continuation` | after  | fire or tear down the linked follow-up trigger      |

pub mod concurrency;
pub mod continuation;
pub mod retry;

pub use concurrency::ConcurrencyStep;
pub use continuation::ContinuationStep;
pub use retry::RetryStep;

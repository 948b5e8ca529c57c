//! `tether-core` — shared vocabulary for the tether job-lifecycle layer.
//!
//! Holds the typed job/trigger keys and the naming rules that derive a
//! logical-job prefix from a generated trigger key, the [`BackoffPolicy`]
//! shape shared by retry and concurrency control, and [`TetherConfig`].

pub mod config;
pub mod error;
pub mod policy;
pub mod types;

pub use config::TetherConfig;
pub use error::{CoreError, Result};
pub use policy::BackoffPolicy;
pub use types::{logical_prefix, JobKey, TriggerKey};

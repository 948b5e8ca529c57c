use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::policy::BackoffPolicy;

pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_REARM_DELAY_SECS: u64 = 5;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Inert placeholders are parked this far in the future (~100 years).
pub const DEFAULT_INERT_HORIZON_DAYS: i64 = 36_500;

/// Top-level config (tether.toml + TETHER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Policy applied to exclusive jobs that do not bring their own.
    #[serde(default = "default_concurrency_policy")]
    pub concurrency: BackoffPolicy,
    /// Retry policy attached to every chain-cleanup job.
    #[serde(default = "default_cleanup_policy")]
    pub cleanup: BackoffPolicy,
    /// Per-queue settings keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            concurrency: default_concurrency_policy(),
            cleanup: default_cleanup_policy(),
            queues: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling cadence of the in-process scheduler loop.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Delay before a trigger whose before-hook failed is fired again.
    #[serde(default = "default_rearm_delay_secs")]
    pub rearm_delay_secs: u64,
    #[serde(default = "default_inert_horizon_days")]
    pub inert_horizon_days: i64,
    /// Upper bound on executions running at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            rearm_delay_secs: DEFAULT_REARM_DELAY_SECS,
            inert_horizon_days: DEFAULT_INERT_HORIZON_DAYS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Trigger priority; higher fires first when several are due together.
    #[serde(default)]
    pub priority: i32,
    /// Retry policy for jobs enqueued without an explicit one.
    pub retry: Option<BackoffPolicy>,
    /// When true, instances of this queue never execute concurrently.
    #[serde(default)]
    pub exclusive: bool,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_rearm_delay_secs() -> u64 {
    DEFAULT_REARM_DELAY_SECS
}
fn default_inert_horizon_days() -> i64 {
    DEFAULT_INERT_HORIZON_DAYS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_concurrency_policy() -> BackoffPolicy {
    BackoffPolicy::new(10, vec![1, 2, 5, 10, 30])
}
fn default_cleanup_policy() -> BackoffPolicy {
    BackoffPolicy::new(3, vec![1, 5, 30])
}

impl TetherConfig {
    /// Load config from a TOML file with TETHER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TETHER_SCHEDULER__TICK_MS=250`. Missing files are not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::from(Serialized::defaults(TetherConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TETHER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.get(name)
    }

    /// Priority lookup for triggers created on `queue`; unknown queues get 0.
    pub fn priority_for(&self, queue: &str) -> i32 {
        self.queue(queue).map(|q| q.priority).unwrap_or_default()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.toml");
            let config = TetherConfig::load(path.to_str()).expect("load failed");
            assert_eq!(config.scheduler.tick_ms, DEFAULT_TICK_MS);
            assert_eq!(config.cleanup, default_cleanup_policy());
            assert!(config.queues.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_sections_and_env_overrides_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tether.toml",
                r#"
                [scheduler]
                tick_ms = 250

                [queues.emails]
                priority = 7
                exclusive = true
                retry = { max_attempts = 3, delays = [1, 2, 5] }
                "#,
            )?;
            jail.set_env("TETHER_SCHEDULER__MAX_CONCURRENT", "2");

            let config = TetherConfig::load(Some("tether.toml")).expect("load failed");
            assert_eq!(config.scheduler.tick_ms, 250);
            assert_eq!(config.scheduler.max_concurrent, 2);
            assert_eq!(config.priority_for("emails"), 7);
            assert_eq!(config.priority_for("unknown"), 0);

            let emails = config.queue("emails").expect("queue missing");
            assert!(emails.exclusive);
            assert_eq!(emails.retry, Some(BackoffPolicy::new(3, vec![1, 2, 5])));
            Ok(())
        });
    }

    #[test]
    fn queue_retry_without_ceiling_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tether.toml",
                r#"
                [queues.broken]
                retry = { delays = [1] }
                "#,
            )?;
            assert!(TetherConfig::load(Some("tether.toml")).is_err());
            Ok(())
        });
    }
}

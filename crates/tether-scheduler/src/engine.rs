use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::config::SchedulerConfig;
use tether_core::{JobKey, TriggerKey};

use crate::{
    error::{Result, SchedulerError},
    hooks::{ExecutionHooks, HookError},
    scheduler::Scheduler,
    types::{ExecutionContext, JobDetail, Trigger},
};

/// How a single firing ended, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// The body failed. `rearmed` is true when the trigger was replaced during
    /// the execution, i.e. the failure was absorbed by a retry.
    Failed { error: String, rearmed: bool },
    /// A before-hook postponed the firing.
    Rearmed { reason: String },
    /// A before-hook dropped the firing.
    Vetoed { reason: String },
    /// The body ran but the after-hook failed.
    HookFailed { error: String },
}

/// Emitted once per firing on the optional report channel.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub trigger: TriggerKey,
    pub job: JobKey,
    pub fire_id: Uuid,
    pub outcome: ExecutionOutcome,
}

struct StoredTrigger {
    trigger: Trigger,
    /// Bumped on every store; a firing only consumes the generation it fired.
    generation: u64,
    /// True while a firing of this generation is in flight.
    acquired: bool,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, StoredTrigger>,
    executing: HashMap<Uuid, ExecutionContext>,
    generation: u64,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Store a new generation of `trigger`. A trigger replaced while a
    /// firing is in flight stays acquired until that firing completes.
    fn store_trigger(&mut self, trigger: Trigger) {
        let generation = self.next_generation();
        let acquired = self.triggers.get(&trigger.key).is_some_and(|s| s.acquired);
        self.triggers.insert(
            trigger.key.clone(),
            StoredTrigger {
                trigger,
                generation,
                acquired,
            },
        );
    }

    /// Non-durable jobs live only as long as some trigger points at them.
    fn drop_orphaned_job(&mut self, key: &JobKey) {
        if self.jobs.get(key).is_some_and(|j| j.durable) {
            return;
        }
        if self.triggers.values().any(|t| &t.trigger.job_key == key) {
            return;
        }
        if self.jobs.remove(key).is_some() {
            debug!(job = %key, "non-durable job removed with its last trigger");
        }
    }
}

struct Acquired {
    ctx: ExecutionContext,
    generation: u64,
    job: Option<JobDetail>,
}

struct Inner {
    state: Mutex<State>,
    hooks: RwLock<Option<Arc<dyn ExecutionHooks>>>,
    reports_tx: Option<mpsc::Sender<ExecutionReport>>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    /// Cancels running job bodies.
    shutdown: CancellationToken,
    /// Cancels scheduler calls issued by hooks; set by `close`.
    closing: CancellationToken,
}

/// In-process scheduler: keeps jobs and triggers in memory and fires due
/// triggers on Tokio tasks, invoking the registered [`ExecutionHooks`].
///
/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct MemoryScheduler {
    inner: Arc<Inner>,
}

impl MemoryScheduler {
    /// Create an empty scheduler.
    ///
    /// Pass `Some(tx)` to receive an [`ExecutionReport`] for every firing.
    /// Reports are sent with `try_send`, so a full channel never stalls
    /// execution.
    pub fn new(config: SchedulerConfig, reports_tx: Option<mpsc::Sender<ExecutionReport>>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                hooks: RwLock::new(None),
                reports_tx,
                config,
                permits,
                shutdown: CancellationToken::new(),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Install the before/after hook pair. Replaces any previous hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn ExecutionHooks>) {
        *self
            .inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    /// This scheduler as a trait object, for handing to clients.
    pub fn handle(&self) -> Arc<dyn Scheduler> {
        Arc::new(self.clone())
    }

    /// Snapshot of every stored trigger, ordered by key.
    pub fn triggers(&self) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = self
            .state()
            .triggers
            .values()
            .map(|s| s.trigger.clone())
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        triggers
    }

    pub fn has_job(&self, key: &JobKey) -> bool {
        self.state().jobs.contains_key(key)
    }

    /// Signal cancellation to every running execution of `job`.
    ///
    /// The job body decides how to react; nothing is aborted forcibly.
    /// Returns the number of executions signalled.
    pub fn interrupt(&self, job: &JobKey) -> usize {
        let state = self.state();
        let mut signalled = 0;
        for ctx in state.executing.values().filter(|c| c.job_key() == job) {
            ctx.cancellation().cancel();
            signalled += 1;
        }
        if signalled > 0 {
            info!(job = %job, count = signalled, "executions interrupted");
        }
        signalled
    }

    /// Stop serving scheduler calls. Calls still in flight from hooks are
    /// abandoned and every later call fails with
    /// [`SchedulerError::Unavailable`]. Running bodies are not touched.
    pub fn close(&self) {
        info!("memory scheduler closed");
        self.inner.closing.cancel();
    }

    /// Acquire every trigger due at `now` and start one task per firing.
    ///
    /// Triggers fire in fire-time order, higher priority first among equal
    /// fire times; at most `max_concurrent` bodies run at once.
    pub fn spawn_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<ExecutionReport>> {
        self.acquire_due(now)
            .into_iter()
            .map(|acquired| {
                let this = self.clone();
                let permits = Arc::clone(&self.inner.permits);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    this.execute(acquired).await
                })
            })
            .collect()
    }

    /// Fire everything due at `now` and wait for all of it to finish.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<ExecutionReport> {
        join_all(self.spawn_due(now))
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("execution task failed: {e}");
                    None
                }
            })
            .collect()
    }

    /// Main event loop. Polls every `tick_ms` until `shutdown` broadcasts
    /// `true`, then cancels all running executions.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("memory scheduler started");

        let tick = Duration::from_millis(self.inner.config.tick_ms.max(1));
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let fired = self.spawn_due(Utc::now());
                    if !fired.is_empty() {
                        debug!(count = fired.len(), "due triggers fired");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("memory scheduler shutting down");
                        self.inner.shutdown.cancel();
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(SchedulerError::Unavailable("scheduler closed".to_string()));
        }
        Ok(())
    }

    fn hooks(&self) -> Option<Arc<dyn ExecutionHooks>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn acquire_due(&self, now: DateTime<Utc>) -> Vec<Acquired> {
        let mut guard = self.state();
        let state = &mut *guard;

        let mut due: Vec<(DateTime<Utc>, Reverse<i32>, TriggerKey)> = state
            .triggers
            .values()
            .filter(|s| !s.acquired && s.trigger.fire_at <= now)
            .map(|s| (s.trigger.fire_at, Reverse(s.trigger.priority), s.trigger.key.clone()))
            .collect();
        due.sort();

        let mut acquired = Vec::with_capacity(due.len());
        for (_, _, key) in due {
            let Some(stored) = state.triggers.get_mut(&key) else {
                continue;
            };
            stored.acquired = true;
            let generation = stored.generation;
            let trigger = stored.trigger.clone();
            let job = state.jobs.get(&trigger.job_key).cloned();
            let ctx = ExecutionContext::new(trigger, self.handle(), self.inner.shutdown.child_token())
                .with_scheduler_cancellation(self.inner.closing.child_token());
            // Listed as executing from acquisition on, including while the
            // task waits for a permit.
            if job.is_some() {
                state.executing.insert(ctx.fire_id, ctx.clone());
            }
            acquired.push(Acquired {
                ctx,
                generation,
                job,
            });
        }
        acquired
    }

    async fn execute(self, acquired: Acquired) -> ExecutionReport {
        let Acquired {
            ctx,
            generation,
            job,
        } = acquired;
        let key = ctx.trigger_key().clone();
        let job_key = ctx.job_key().clone();

        let outcome = match job {
            None => {
                error!(trigger = %key, job = %job_key, "fired trigger references a missing job");
                self.complete(&key, generation);
                ExecutionOutcome::Failed {
                    error: format!("job not found: {job_key}"),
                    rearmed: false,
                }
            }
            Some(detail) => {
                let outcome = self.run_with_hooks(&ctx, &detail, generation).await;
                self.state().executing.remove(&ctx.fire_id);
                outcome
            }
        };

        let report = ExecutionReport {
            trigger: key,
            job: job_key,
            fire_id: ctx.fire_id,
            outcome,
        };
        self.send_report(&report);
        report
    }

    async fn run_with_hooks(
        &self,
        ctx: &ExecutionContext,
        detail: &JobDetail,
        generation: u64,
    ) -> ExecutionOutcome {
        let key = ctx.trigger_key();
        let hooks = self.hooks();

        if let Some(hooks) = &hooks {
            if let Err(e) = hooks.before_execute(ctx).await {
                return match e {
                    HookError::Rearmed { reason } => {
                        debug!(trigger = %key, reason, "firing rearmed by before hook");
                        self.complete(key, generation);
                        ExecutionOutcome::Rearmed { reason }
                    }
                    HookError::Vetoed { reason } => {
                        info!(trigger = %key, reason, "firing vetoed by before hook");
                        self.complete(key, generation);
                        ExecutionOutcome::Vetoed { reason }
                    }
                    HookError::Failed(err) => {
                        let delay = self.inner.config.rearm_delay_secs;
                        error!(trigger = %key, error = %err, delay_secs = delay, "before hook failed, re-arming trigger");
                        let at = after_secs(Utc::now(), delay);
                        self.rearm(key, generation, at);
                        ExecutionOutcome::Rearmed {
                            reason: err.to_string(),
                        }
                    }
                };
            }
        }

        let result = detail.job.execute(ctx).await;
        if let Err(e) = &result {
            warn!(trigger = %key, job = %ctx.job_key(), error = %e, "job body failed");
        }

        let after = match &hooks {
            Some(hooks) => hooks.after_execute(ctx, result.as_ref().err()).await,
            None => Ok(()),
        };
        let rearmed = self.complete(key, generation);

        if let Err(e) = after {
            error!(trigger = %key, error = %e, "after hook failed");
            return ExecutionOutcome::HookFailed {
                error: e.to_string(),
            };
        }

        match result {
            Ok(()) => {
                debug!(trigger = %key, "job completed");
                ExecutionOutcome::Succeeded
            }
            Err(e) => {
                if !rearmed {
                    error!(trigger = %key, job = %ctx.job_key(), error = %e, "job failed with no retry pending");
                }
                ExecutionOutcome::Failed {
                    error: e.to_string(),
                    rearmed,
                }
            }
        }
    }

    /// Put a fired trigger back in the waiting set at `at`, unless it was
    /// already replaced during the firing.
    fn rearm(&self, key: &TriggerKey, generation: u64, at: DateTime<Utc>) {
        let mut state = self.state();
        let next = state.next_generation();
        if let Some(stored) = state.triggers.get_mut(key) {
            if stored.generation == generation {
                stored.trigger.fire_at = at;
                stored.generation = next;
            }
            stored.acquired = false;
        }
    }

    /// Consume the fired generation of `key`.
    ///
    /// Returns true when the trigger was replaced during the firing, in which
    /// case the replacement stays scheduled.
    fn complete(&self, key: &TriggerKey, generation: u64) -> bool {
        let mut state = self.state();
        match state.triggers.get(key).map(|s| s.generation) {
            Some(g) if g == generation => {
                if let Some(removed) = state.triggers.remove(key) {
                    state.drop_orphaned_job(&removed.trigger.job_key);
                }
                false
            }
            Some(_) => {
                if let Some(stored) = state.triggers.get_mut(key) {
                    stored.acquired = false;
                }
                true
            }
            None => false,
        }
    }

    fn send_report(&self, report: &ExecutionReport) {
        if let Some(tx) = &self.inner.reports_tx {
            // try_send never blocks the executing task; warn if the channel is full.
            if tx.try_send(report.clone()).is_err() {
                warn!(trigger = %report.trigger, "report channel full or closed, report dropped");
            }
        }
    }
}

/// `now + secs`, saturating at the latest representable instant.
fn after_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(secs))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn schedule(&self, job: JobDetail, trigger: Trigger) -> Result<DateTime<Utc>> {
        self.ensure_open()?;
        let mut state = self.state();
        if state.triggers.contains_key(&trigger.key) {
            return Err(SchedulerError::TriggerExists { key: trigger.key });
        }
        let trigger = Trigger {
            job_key: job.key.clone(),
            ..trigger
        };
        let fire_at = trigger.fire_at;
        debug!(trigger = %trigger.key, job = %job.key, %fire_at, "trigger scheduled");
        state.jobs.insert(job.key.clone(), job);
        state.store_trigger(trigger);
        Ok(fire_at)
    }

    async fn reschedule(
        &self,
        key: &TriggerKey,
        trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        let mut state = self.state();
        let Some(previous_job) = state.triggers.get(key).map(|s| s.trigger.job_key.clone()) else {
            return Ok(None);
        };
        if !state.jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::JobNotFound {
                key: trigger.job_key,
            });
        }
        let trigger = Trigger {
            key: key.clone(),
            ..trigger
        };
        let fire_at = trigger.fire_at;
        let job_changed = trigger.job_key != previous_job;
        state.store_trigger(trigger);
        if job_changed {
            state.drop_orphaned_job(&previous_job);
        }
        debug!(trigger = %key, %fire_at, "trigger rescheduled");
        Ok(Some(fire_at))
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.ensure_open()?;
        Ok(self.state().triggers.get(key).map(|s| s.trigger.clone()))
    }

    async fn delete_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state();
        let Some(removed) = state.triggers.remove(key) else {
            return Ok(false);
        };
        state.drop_orphaned_job(&removed.trigger.job_key);
        debug!(trigger = %key, "trigger deleted");
        Ok(true)
    }

    async fn add_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if !replace && state.jobs.contains_key(&job.key) {
            return Err(SchedulerError::JobExists { key: job.key });
        }
        if !job.durable && !state.triggers.values().any(|t| t.trigger.job_key == job.key) {
            return Err(SchedulerError::NonDurableJob { key: job.key });
        }
        debug!(job = %job.key, durable = job.durable, "job stored");
        state.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn currently_executing(&self) -> Result<Vec<ExecutionContext>> {
        self.ensure_open()?;
        Ok(self.state().executing.values().cloned().collect())
    }

    async fn trigger_now(&self, job: &JobKey) -> Result<TriggerKey> {
        self.ensure_open()?;
        let mut state = self.state();
        if !state.jobs.contains_key(job) {
            return Err(SchedulerError::JobNotFound { key: job.clone() });
        }
        let key = TriggerKey::generate(job.as_str());
        state.store_trigger(Trigger::new(key.clone(), job.clone(), Utc::now()));
        info!(job = %job, trigger = %key, "job triggered now");
        Ok(key)
    }
}

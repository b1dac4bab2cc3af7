use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId, SchedulerConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::ExecutionDispatcher;
use crate::error::{Result, SchedulerError};
use crate::events::{AuditRecorder, EventBus, JobEvent, JobEventKind};
use crate::recovery::recover;
use crate::registry::TaskRegistry;
use crate::store::{JobStore, Reservation};
use crate::trigger;
use crate::types::{
    HistoryQuery, Job, JobDefinition, JobExecutionRecord, JobFilter, JobStatus, JobSummary,
    MisfirePolicy, TargetRef, TriggerSpec,
};

const AUDIT_SUBSCRIBER: &str = "audit";

/// Lifecycle of a [`Scheduler`]: `Stopped -> Starting -> Running -> ShuttingDown -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Starting => "starting",
            SchedulerState::Running => "running",
            SchedulerState::ShuttingDown => "shutting_down",
        };
        write!(f, "{s}")
    }
}

/// Timer-queue changes pushed by admin calls; applied on the timer loop.
#[derive(Debug)]
enum Mutation {
    /// `None` drops the entry (paused, disabled or exhausted).
    Upsert {
        id: JobId,
        next: Option<DateTime<Utc>>,
    },
    Remove {
        id: JobId,
    },
}

/// Parts that only exist while the scheduler runs.
struct Running {
    dispatcher: Arc<ExecutionDispatcher>,
    mutations: mpsc::UnboundedSender<Mutation>,
    cancel: CancellationToken,
    timer: JoinHandle<()>,
    audit: JoinHandle<()>,
}

struct Inner {
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
    bus: EventBus,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    running: Mutex<Option<Running>>,
}

/// Admin-facing handle to the scheduler. Cheap to clone.
///
/// Job CRUD works in every state and goes straight to the store; while the
/// scheduler runs, each write also reaches the timer loop through its
/// mutation queue so a sleeping loop wakes up for the change.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, registry: Arc<TaskRegistry>, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        let bus = EventBus::new(Duration::from_millis(config.event_send_timeout_ms));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                bus,
                config,
                state,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Bounded stream of job events. Falls behind silently if not drained.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<JobEvent> {
        self.inner
            .bus
            .subscribe(name, self.inner.config.event_buffer)
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> Result<()> {
        let mut found = from;
        let changed = self.inner.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                found = *s;
                false
            }
        });
        if !changed {
            return Err(SchedulerError::InvalidState {
                expected: from.to_string(),
                found: found.to_string(),
            });
        }
        debug!(%from, %to, "scheduler state changed");
        Ok(())
    }

    /// Recover persisted jobs and start the timer loop.
    pub async fn start(&self) -> Result<()> {
        self.transition(SchedulerState::Stopped, SchedulerState::Starting)?;
        let inner = &self.inner;
        let config = &inner.config;

        let audit = AuditRecorder::spawn(
            Arc::clone(&inner.store),
            inner.bus.subscribe(AUDIT_SUBSCRIBER, config.event_buffer),
        );

        let grace = Duration::from_secs(config.misfire_grace_secs);
        let report = match recover(&inner.store, &inner.bus, Utc::now(), grace).await {
            Ok(report) => report,
            Err(e) => {
                error!("recovery failed: {e}");
                inner.bus.unsubscribe(AUDIT_SUBSCRIBER);
                let _ = audit.await;
                inner.state.send_replace(SchedulerState::Stopped);
                return Err(e);
            }
        };

        let dispatcher = Arc::new(ExecutionDispatcher::new(
            Arc::clone(&inner.registry),
            inner.bus.clone(),
            config.pool_size,
            config.queue_depth,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut core = SchedulerCore {
            store: Arc::clone(&inner.store),
            dispatcher: Arc::clone(&dispatcher),
            bus: inner.bus.clone(),
            config: config.clone(),
            queue: TimerQueue::default(),
            mutations: rx,
            cancel: cancel.clone(),
        };
        for (id, next) in report.seeded {
            core.queue.schedule(id, next);
        }
        let timer = tokio::spawn(core.run());

        *inner.running.lock().expect("scheduler state poisoned") = Some(Running {
            dispatcher,
            mutations: tx,
            cancel,
            timer,
            audit,
        });
        self.transition(SchedulerState::Starting, SchedulerState::Running)?;
        info!(
            pool_size = config.pool_size,
            queue_depth = config.queue_depth,
            "scheduler running"
        );
        Ok(())
    }

    /// Stop firing, wait for in-flight executions (bounded by the shutdown
    /// grace, then cancelled), flush the audit trail.
    pub async fn shutdown(&self) -> Result<()> {
        self.transition(SchedulerState::Running, SchedulerState::ShuttingDown)?;
        let running = self
            .inner
            .running
            .lock()
            .expect("scheduler state poisoned")
            .take();

        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.timer.await {
                error!("timer loop ended abnormally: {e}");
            }
            let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
            if !running.dispatcher.shutdown(grace).await {
                warn!("some executions were cancelled at shutdown");
            }
            self.inner.bus.unsubscribe(AUDIT_SUBSCRIBER);
            if let Err(e) = running.audit.await {
                error!("audit recorder ended abnormally: {e}");
            }
        }

        self.transition(SchedulerState::ShuttingDown, SchedulerState::Stopped)?;
        info!("scheduler stopped");
        Ok(())
    }

    fn notify(&self, mutation: Mutation) {
        let running = self.inner.running.lock().expect("scheduler state poisoned");
        if let Some(r) = running.as_ref() {
            // The loop owns the receiver until shutdown; a send error means it is gone.
            let _ = r.mutations.send(mutation);
        }
    }

    fn dispatcher(&self) -> Result<Arc<ExecutionDispatcher>> {
        self.inner
            .running
            .lock()
            .expect("scheduler state poisoned")
            .as_ref()
            .map(|r| Arc::clone(&r.dispatcher))
            .ok_or(SchedulerError::NotRunning)
    }

    // --- admin operations -----------------------------------------------------

    /// Start a definition with this scheduler's default misfire policy.
    pub fn definition(
        &self,
        name: impl Into<String>,
        target: TargetRef,
        trigger: TriggerSpec,
    ) -> JobDefinition {
        JobDefinition::new(name, target, trigger).misfire_policy(MisfirePolicy {
            coalesce: self.inner.config.default_coalesce,
            max_instances: self.inner.config.default_max_instances,
        })
    }

    /// Persist a new job; `InvalidTrigger` if the trigger is malformed or can never fire.
    pub fn add_job(&self, def: JobDefinition) -> Result<Job> {
        let job = self.inner.store.add(def, Utc::now())?;
        self.notify(Mutation::Upsert {
            id: job.id.clone(),
            next: job.next_fire_time,
        });
        Ok(job)
    }

    pub fn edit_job(&self, id: &JobId, def: JobDefinition) -> Result<Job> {
        let job = self.inner.store.edit(id, def, Utc::now())?;
        self.notify(Mutation::Upsert {
            id: job.id.clone(),
            next: job.next_fire_time,
        });
        Ok(job)
    }

    /// Delete a job and drop its timer entry. A running instance is left to finish.
    pub fn remove_job(&self, id: &JobId) -> Result<()> {
        self.inner.store.remove(id)?;
        self.notify(Mutation::Remove { id: id.clone() });
        if let Ok(dispatcher) = self.dispatcher() {
            dispatcher.release_job(id);
        }
        Ok(())
    }

    /// Remove several jobs; returns the ids that did not exist.
    pub fn remove_jobs(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let missing = self.inner.store.remove_many(ids)?;
        let missing_set: HashSet<&JobId> = missing.iter().collect();
        let dispatcher = self.dispatcher().ok();
        for id in ids.iter().filter(|id| !missing_set.contains(id)) {
            self.notify(Mutation::Remove { id: id.clone() });
            if let Some(d) = &dispatcher {
                d.release_job(id);
            }
        }
        Ok(missing)
    }

    pub fn pause_job(&self, id: &JobId) -> Result<Job> {
        self.set_status(id, JobStatus::Paused)
    }

    /// Re-enable a job; its next fire time is computed from now.
    pub fn resume_job(&self, id: &JobId) -> Result<Job> {
        self.set_status(id, JobStatus::Enabled)
    }

    pub fn disable_job(&self, id: &JobId) -> Result<Job> {
        self.set_status(id, JobStatus::Disabled)
    }

    fn set_status(&self, id: &JobId, status: JobStatus) -> Result<Job> {
        let job = self.inner.store.set_status(id, status, None, Utc::now())?;
        self.notify(Mutation::Upsert {
            id: job.id.clone(),
            next: job.next_fire_time,
        });
        Ok(job)
    }

    /// Run a job now, outside its schedule. Its `next_fire_time` is untouched
    /// and its instance cap still applies. Paused jobs may be run this way.
    pub async fn execute_once(&self, id: &JobId) -> Result<InstanceId> {
        let dispatcher = self.dispatcher()?;
        let job = self
            .inner
            .store
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let instance_id = InstanceId::new();
        info!(job_id = %id, %instance_id, "manual execution requested");
        dispatcher
            .submit(&job, Utc::now(), instance_id.clone())
            .await?;
        Ok(instance_id)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.inner.store.get(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        Ok(self
            .inner
            .store
            .list(filter)?
            .iter()
            .map(Job::summary)
            .collect())
    }

    /// Records of `job_id` with `from <= fire_time < to`, newest first.
    pub fn list_execution_history(
        &self,
        job_id: &JobId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobExecutionRecord>> {
        self.inner
            .store
            .list_records(&HistoryQuery::for_job(job_id.clone()).between(from, to))
    }

    pub fn query_execution_history(&self, query: &HistoryQuery) -> Result<Vec<JobExecutionRecord>> {
        self.inner.store.list_records(query)
    }

    pub fn delete_execution_records(&self, ids: &[i64]) -> Result<usize> {
        self.inner.store.delete_records(ids)
    }

    /// Drop finalized records, optionally for one job and/or before an instant.
    pub fn purge_execution_history(
        &self,
        job_id: Option<&JobId>,
        before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.inner.store.purge_records(job_id, before)
    }

    /// The next `count` fire times of `trigger` from now, without saving anything.
    pub fn preview(&self, trigger: &TriggerSpec, count: usize) -> Result<Vec<DateTime<Utc>>> {
        Ok(trigger::upcoming(trigger, Utc::now(), count)?)
    }
}

// --- timer loop ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    /// When the loop should look at the job again.
    wake_at: DateTime<Utc>,
    /// The `next_fire_time` the store is expected to hold.
    due: DateTime<Utc>,
}

/// Min-heap of wake-up times with lazy deletion.
///
/// `entries` is authoritative; heap items that no longer match it are stale
/// and skipped when they reach the top.
#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, JobId)>>,
    entries: HashMap<JobId, Entry>,
}

impl TimerQueue {
    fn schedule(&mut self, id: JobId, due: DateTime<Utc>) {
        self.defer(id, due, due);
    }

    fn defer(&mut self, id: JobId, due: DateTime<Utc>, wake_at: DateTime<Utc>) {
        self.entries.insert(id.clone(), Entry { wake_at, due });
        self.heap.push(Reverse((wake_at, id)));
    }

    fn unschedule(&mut self, id: &JobId) {
        self.entries.remove(id);
    }

    fn prune(&mut self) {
        while let Some(Reverse((at, id))) = self.heap.peek() {
            match self.entries.get(id) {
                Some(e) if e.wake_at == *at => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    fn next_wake(&mut self) -> Option<DateTime<Utc>> {
        self.prune();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop the earliest entry if it is due at `now`; returns its expected fire time.
    fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(JobId, DateTime<Utc>)> {
        self.prune();
        let Reverse((at, _)) = self.heap.peek()?;
        if *at > now {
            return None;
        }
        let Reverse((_, id)) = self.heap.pop()?;
        let entry = self.entries.remove(&id)?;
        Some((id, entry.due))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The single timer loop. Owns the queue; everything else talks to it
/// through the mutation channel.
struct SchedulerCore {
    store: Arc<JobStore>,
    dispatcher: Arc<ExecutionDispatcher>,
    bus: EventBus,
    config: SchedulerConfig,
    queue: TimerQueue,
    mutations: mpsc::UnboundedReceiver<Mutation>,
    cancel: CancellationToken,
}

impl SchedulerCore {
    async fn run(mut self) {
        info!(jobs = self.queue.len(), "timer loop started");
        let resync_every = Duration::from_secs(self.config.resync_interval_secs.max(1));
        let mut next_resync = Instant::now() + resync_every;

        loop {
            let now = Utc::now();
            while let Some((id, due)) = self.queue.pop_due(now) {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.fire(id, due).await;
            }

            let wake = match self.queue.next_wake() {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    (Instant::now() + wait).min(next_resync)
                }
                None => next_resync,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= next_resync {
                        self.resync();
                        next_resync = Instant::now() + resync_every;
                    }
                }
                mutation = self.mutations.recv() => match mutation {
                    Some(m) => self.apply(m),
                    None => break,
                },
            }
        }
        info!("timer loop stopped");
    }

    fn apply(&mut self, mutation: Mutation) {
        debug!(?mutation, "timer mutation");
        match mutation {
            Mutation::Upsert { id, next: Some(at) } => self.queue.schedule(id, at),
            Mutation::Upsert { id, next: None } | Mutation::Remove { id } => {
                self.queue.unschedule(&id)
            }
        }
    }

    /// Re-read enabled jobs so writes from other scheduler instances are seen.
    fn resync(&mut self) {
        let jobs = match self.store.list_enabled() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("resync failed: {e}");
                return;
            }
        };
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in jobs {
            let Some(next) = job.next_fire_time else {
                continue;
            };
            seen.insert(job.id.clone());
            let current = self.queue.entries.get(&job.id).map(|e| e.due);
            if current != Some(next) {
                self.queue.schedule(job.id, next);
            }
        }
        let gone: Vec<JobId> = self
            .queue
            .entries
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.queue.unschedule(id);
        }
        debug!(jobs = self.queue.len(), dropped = gone.len(), "timer queue resynced");
    }

    async fn fire(&mut self, id: JobId, due: DateTime<Utc>) {
        let now = Utc::now();
        let store = Arc::clone(&self.store);
        let reserved = with_store_retry(
            self.config.store_retry_attempts,
            Duration::from_millis(self.config.store_retry_base_ms),
            "reserve_and_advance",
            || store.reserve_and_advance(&id, due, now),
        )
        .await;

        let reservation = match reserved {
            Ok(r) => r,
            Err(e) => {
                // Try again on a later pass rather than stall the loop.
                error!(job_id = %id, "could not reserve firing: {e}");
                let retry_at = now + chrono::Duration::milliseconds(self.config.store_retry_base_ms as i64);
                self.queue.defer(id, due, retry_at);
                return;
            }
        };

        match reservation {
            Reservation::Reserved { job, fire_time } => {
                if let Some(next) = job.next_fire_time {
                    self.queue.schedule(job.id.clone(), next);
                }
                let lateness = (now - fire_time).to_std().unwrap_or(Duration::ZERO);
                if lateness > Duration::from_secs(self.config.misfire_grace_secs) {
                    warn!(job_id = %job.id, %fire_time, "misfire grace exceeded");
                    self.bus
                        .publish(JobEvent::new(
                            job.id.clone(),
                            InstanceId::new(),
                            fire_time,
                            JobEventKind::Missed {
                                reason: "misfire grace exceeded".into(),
                            },
                        ))
                        .await;
                    return;
                }
                let instance_id = InstanceId::new();
                debug!(job_id = %job.id, %instance_id, %fire_time, "dispatching");
                if let Err(e) = self.dispatcher.submit(&job, fire_time, instance_id).await {
                    // already published as Failed or Missed
                    debug!(job_id = %job.id, code = e.code(), "firing not dispatched");
                }
            }
            Reservation::AlreadyReserved { next_fire_time } => {
                debug!(job_id = %id, "firing handled elsewhere");
                let next = match next_fire_time {
                    Some(next) => Some(next),
                    None => match self.store.get(&id) {
                        Ok(Some(job)) if job.status == JobStatus::Enabled => job.next_fire_time,
                        Ok(_) => None,
                        Err(e) => {
                            warn!(job_id = %id, "re-read after lost reservation failed: {e}");
                            None
                        }
                    },
                };
                if let Some(next) = next {
                    self.queue.schedule(id, next);
                }
            }
            Reservation::NotDue { next_fire_time } => self.queue.schedule(id, next_fire_time),
            Reservation::Inactive | Reservation::NotFound => {
                debug!(job_id = %id, "timer entry dropped");
            }
        }
    }
}

/// Run a store operation, retrying transient failures with exponential backoff.
async fn with_store_retry<T>(
    attempts: u32,
    base: Duration,
    op: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = base * 2u32.saturating_pow(attempt);
                warn!(op, attempt, ?delay, "store operation failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

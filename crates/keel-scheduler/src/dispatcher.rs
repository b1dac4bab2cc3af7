use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_core::{InstanceId, JobId};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::registry::{JobContext, JobHandler, TaskRegistry};
use crate::types::{ExecutionOutcome, Job};

/// Per-job concurrency slot: a semaphore sized to the job's `max_instances`.
struct Slot {
    permits: Arc<Semaphore>,
    cap: u32,
    /// Job was removed while instances were still running.
    retired: bool,
}

impl Slot {
    fn new(cap: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(cap as usize)),
            cap,
            retired: false,
        }
    }

    fn idle(&self) -> bool {
        self.permits.available_permits() == self.cap as usize
    }
}

/// Decrements the waiting counter when a queued firing leaves the queue.
struct Waiting(Arc<AtomicUsize>);

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded worker pool that runs job bodies.
///
/// Every body runs on its own tokio task behind a global semaphore of
/// `pool_size` permits. A firing that cannot start at once, because the pool
/// is busy or its job is at `max_instances`, waits; at most `queue_depth`
/// firings may wait, beyond that `submit` fails with `PoolExhausted`. Errors, panics and
/// timeouts inside a body become a `Failure` outcome and never escape.
pub struct ExecutionDispatcher {
    registry: Arc<TaskRegistry>,
    bus: EventBus,
    workers: Arc<Semaphore>,
    queue_depth: usize,
    waiting: Arc<AtomicUsize>,
    slots: Arc<DashMap<JobId, Slot>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ExecutionDispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        bus: EventBus,
        pool_size: usize,
        queue_depth: usize,
    ) -> Self {
        Self {
            registry,
            bus,
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
            queue_depth,
            waiting: Arc::new(AtomicUsize::new(0)),
            slots: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Firings accepted but not yet holding a worker.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Bodies currently running or queued, across all jobs.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Instances of `job_id` currently holding a slot.
    pub fn running_instances(&self, job_id: &JobId) -> usize {
        self.slots
            .get(job_id)
            .map(|s| (s.cap as usize).saturating_sub(s.permits.available_permits()))
            .unwrap_or(0)
    }

    /// Forget the slot of a removed job. A slot still in use is retired and
    /// dropped when its last instance finishes.
    pub fn release_job(&self, job_id: &JobId) {
        if self.slots.remove_if(job_id, |_, s| s.idle()).is_none() {
            if let Some(mut slot) = self.slots.get_mut(job_id) {
                slot.retired = true;
            }
        }
    }

    /// Jobs with a slot currently tracked.
    pub fn tracked_jobs(&self) -> usize {
        self.slots.len()
    }

    /// Semaphore for `job`, resized if its `max_instances` changed while idle.
    fn slot_for(&self, job: &Job) -> Arc<Semaphore> {
        let cap = job.misfire_policy.max_instances.max(1);
        let mut slot = self
            .slots
            .entry(job.id.clone())
            .or_insert_with(|| Slot::new(cap));
        if slot.cap != cap && slot.idle() {
            *slot = Slot::new(cap);
        }
        Arc::clone(&slot.permits)
    }

    /// Hand one firing of `job` to the pool.
    ///
    /// Rejections are published on the bus before returning: an unresolvable
    /// target as `Failed`, a full pool or (with `coalesce`) a job already at
    /// its instance cap as `Missed`. Without `coalesce` a firing over the cap
    /// waits for a slot; it counts against the queue depth exactly like a
    /// firing waiting for a worker.
    pub async fn submit(
        &self,
        job: &Job,
        fire_time: DateTime<Utc>,
        instance_id: InstanceId,
    ) -> Result<JoinHandle<ExecutionOutcome>> {
        if self.tracker.is_closed() {
            return Err(SchedulerError::NotRunning);
        }

        let handler = match self.registry.resolve(&job.target) {
            Ok(h) => h,
            Err(e) => {
                warn!(job_id = %job.id, target = %job.target, "unknown target");
                self.publish(job, &instance_id, fire_time, JobEventKind::Failed {
                    error: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };

        let slot = self.slot_for(job);
        let job_permit = match Arc::clone(&slot).try_acquire_owned() {
            Ok(p) => Some(p),
            Err(_) if !job.misfire_policy.coalesce => None,
            Err(_) => {
                let e = SchedulerError::MaxInstancesReached {
                    id: job.id.to_string(),
                };
                info!(job_id = %job.id, "instance cap reached; firing coalesced");
                self.publish(job, &instance_id, fire_time, JobEventKind::Missed {
                    reason: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };
        let worker = if job_permit.is_some() {
            Arc::clone(&self.workers).try_acquire_owned().ok()
        } else {
            None
        };

        // Anything that cannot start right away takes a place in the queue.
        let waiting = if job_permit.is_some() && worker.is_some() {
            None
        } else {
            let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
            let waiting = Waiting(Arc::clone(&self.waiting));
            if queued >= self.queue_depth {
                drop(waiting);
                let e = SchedulerError::PoolExhausted;
                warn!(job_id = %job.id, queued, "execution queue full");
                self.publish(job, &instance_id, fire_time, JobEventKind::Missed {
                    reason: e.to_string(),
                })
                .await;
                return Err(e);
            }
            Some(waiting)
        };

        self.publish(job, &instance_id, fire_time, JobEventKind::Submitted)
            .await;

        let run = Run {
            handler,
            bus: self.bus.clone(),
            workers: Arc::clone(&self.workers),
            slots: Arc::clone(&self.slots),
            slot,
            job_permit,
            worker,
            waiting,
            cancel: self.cancel.child_token(),
            ctx: JobContext {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                instance_id,
                fire_time,
                args: job.target.args.clone(),
                kwargs: job.target.kwargs.clone(),
                cancel: CancellationToken::new(),
            },
            timeout: job.timeout(),
        };
        Ok(self.tracker.spawn(run.execute()))
    }

    /// Stop accepting work and wait up to `grace` for in-flight bodies.
    ///
    /// Bodies still running after the grace period are cancelled. Returns
    /// `true` if everything finished on its own.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }
        warn!(
            in_flight = self.tracker.len(),
            "shutdown grace elapsed; cancelling running jobs"
        );
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("jobs ignored cancellation");
        }
        false
    }

    async fn publish(
        &self,
        job: &Job,
        instance_id: &InstanceId,
        fire_time: DateTime<Utc>,
        kind: JobEventKind,
    ) {
        self.bus
            .publish(JobEvent::new(job.id.clone(), instance_id.clone(), fire_time, kind))
            .await;
    }
}

/// One accepted firing, moved onto its worker task.
struct Run {
    handler: Arc<dyn JobHandler>,
    bus: EventBus,
    workers: Arc<Semaphore>,
    slots: Arc<DashMap<JobId, Slot>>,
    slot: Arc<Semaphore>,
    job_permit: Option<OwnedSemaphorePermit>,
    worker: Option<OwnedSemaphorePermit>,
    waiting: Option<Waiting>,
    cancel: CancellationToken,
    ctx: JobContext,
    timeout: Option<Duration>,
}

impl Run {
    async fn execute(self) -> ExecutionOutcome {
        let Run {
            handler,
            bus,
            workers,
            slots,
            slot,
            job_permit,
            worker,
            waiting,
            cancel,
            mut ctx,
            timeout,
        } = self;
        let job_id = ctx.job_id.clone();
        let instance_id = ctx.instance_id.clone();
        let fire_time = ctx.fire_time;
        let event = |kind| JobEvent::new(job_id.clone(), instance_id.clone(), fire_time, kind);

        // Job slot first, so a queued firing does not sit on a worker.
        let permits = tokio::select! {
            permits = acquire(slot, job_permit, workers, worker) => permits,
            _ = cancel.cancelled() => None,
        };
        drop(waiting);
        let Some(permits) = permits else {
            slots.remove_if(&job_id, |_, s| s.retired && s.idle());
            bus.publish(event(JobEventKind::Missed {
                reason: "scheduler shutting down".into(),
            }))
            .await;
            return ExecutionOutcome::Missed;
        };

        ctx.cancel = cancel;
        bus.publish(event(JobEventKind::Started)).await;
        debug!(job_id = %job_id, instance_id = %instance_id, "job started");

        let outcome = match run_guarded(handler, ctx, timeout).await {
            Ok(()) => {
                info!(job_id = %job_id, instance_id = %instance_id, "job completed");
                bus.publish(event(JobEventKind::Completed)).await;
                ExecutionOutcome::Success
            }
            Err(error) => {
                warn!(job_id = %job_id, instance_id = %instance_id, %error, "job failed");
                bus.publish(event(JobEventKind::Failed { error })).await;
                ExecutionOutcome::Failure
            }
        };

        drop(permits);
        slots.remove_if(&job_id, |_, s| s.retired && s.idle());
        outcome
    }
}

async fn acquire(
    slot: Arc<Semaphore>,
    job_permit: Option<OwnedSemaphorePermit>,
    workers: Arc<Semaphore>,
    worker: Option<OwnedSemaphorePermit>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let job_permit = match job_permit {
        Some(p) => p,
        None => slot.acquire_owned().await.ok()?,
    };
    let worker = match worker {
        Some(p) => p,
        None => workers.acquire_owned().await.ok()?,
    };
    Some((job_permit, worker))
}

/// Run the body on its own task, turning errors, panics, timeouts and
/// cancellation into `Err(detail)`. The body task is aborted on timeout or
/// cancellation.
async fn run_guarded(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    limit: Option<Duration>,
) -> std::result::Result<(), String> {
    let cancel = ctx.cancel.clone();
    let mut body = tokio::spawn(async move { handler.run(ctx).await });
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let joined = tokio::select! {
        joined = &mut body => joined,
        _ = deadline => {
            cancel.cancel();
            body.abort();
            return Err("timeout".to_string());
        }
        _ = cancel.cancelled() => {
            body.abort();
            return Err("cancelled".to_string());
        }
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(e) if e.is_panic() => Err(format!("panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Err(e.to_string()),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

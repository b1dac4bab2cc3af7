use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId};
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::store::JobStore;
use crate::trigger;
use crate::types::{Job, JobStatus};

/// What startup recovery did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Timer entries to seed: every enabled job with a future (or just-due) fire time.
    pub seeded: Vec<(JobId, DateTime<Utc>)>,
    /// Jobs whose persisted fire time was older than the grace window.
    pub missed: usize,
    /// Jobs disabled because their trigger could not be evaluated.
    pub disabled: usize,
}

/// Load enabled jobs and bring stale schedules forward.
///
/// A job whose `next_fire_time` lies further in the past than `grace` gets a
/// single `Missed` event, however long the process was down, and is
/// rescheduled from `now`. Rescheduling goes through the version CAS, so when
/// several instances recover at once only the winner publishes the miss.
pub async fn recover(
    store: &JobStore,
    bus: &EventBus,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<RecoveryReport> {
    let cutoff = now - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
    let mut report = RecoveryReport::default();

    for job in store.list_enabled()? {
        match job.next_fire_time {
            Some(next) if next >= cutoff => report.seeded.push((job.id.clone(), next)),
            stale => {
                let Some(next) = bring_forward(store, bus, &job, stale, now, &mut report).await? else {
                    continue;
                };
                report.seeded.push((job.id.clone(), next));
            }
        }
    }

    info!(
        seeded = report.seeded.len(),
        missed = report.missed,
        disabled = report.disabled,
        "recovery complete"
    );
    Ok(report)
}

/// Reschedule `job` from `now`; returns the fire time to seed, if any.
async fn bring_forward(
    store: &JobStore,
    bus: &EventBus,
    job: &Job,
    stale: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    report: &mut RecoveryReport,
) -> Result<Option<DateTime<Utc>>> {
    let (next, status) = match trigger::next_fire_time(&job.trigger, now) {
        Ok(next) => (next, JobStatus::Enabled),
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "trigger can no longer be evaluated; disabling job");
            (None, JobStatus::Disabled)
        }
    };
    if stale.is_none() && next.is_none() && status == JobStatus::Enabled {
        // exhausted one-shot, nothing to write
        return Ok(None);
    }

    if !store.reschedule(&job.id, job.version, next, status)? {
        // Another instance got there first; take whatever it wrote.
        let current = store.get(&job.id)?;
        return Ok(current
            .filter(|j| j.status == JobStatus::Enabled)
            .and_then(|j| j.next_fire_time));
    }

    if status == JobStatus::Disabled {
        report.disabled += 1;
    }
    if let Some(fire_time) = stale {
        report.missed += 1;
        warn!(job_id = %job.id, %fire_time, next_fire_time = ?next, "firing missed while offline");
        bus.publish(JobEvent::new(
            job.id.clone(),
            InstanceId::new(),
            fire_time,
            JobEventKind::Missed {
                reason: "scheduler offline".into(),
            },
        ))
        .await;
    }
    Ok(next)
}

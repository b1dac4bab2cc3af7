// End-to-end behaviour of the scheduler through its public handle.
// Uses per-second cron expressions and short real sleeps.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{JobId, SchedulerConfig};
use keel_scheduler::{
    ExecutionOutcome, HistoryQuery, JobContext, JobDefinition, JobEvent, JobEventKind, JobStatus,
    JobStore, MisfirePolicy, Scheduler, SchedulerError, TargetRef, TaskRegistry, TriggerSpec,
};
use tokio::sync::mpsc;

const EVERY_SECOND: &str = "* * * * * *";

fn config() -> SchedulerConfig {
    SchedulerConfig {
        shutdown_grace_secs: 1,
        ..SchedulerConfig::default()
    }
}

fn scheduler(store: Arc<JobStore>, registry: Arc<TaskRegistry>) -> Scheduler {
    Scheduler::new(store, registry, config())
}

async fn wait_for(
    rx: &mut mpsc::Receiver<JobEvent>,
    pred: impl Fn(&JobEvent) -> bool,
) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_job_never_fires() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let registry = Arc::new(TaskRegistry::new());
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    registry.register_fn("count", move |_ctx: JobContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let s = scheduler(Arc::clone(&store), registry);
    s.start().await.unwrap();

    let soon = Utc::now() + chrono::Duration::milliseconds(1500);
    let job = s
        .add_job(JobDefinition::new("once", TargetRef::new("count"), TriggerSpec::date(soon)))
        .unwrap();

    assert!(s.remove_job(&job.id).is_ok());
    assert!(matches!(
        s.remove_job(&job.id),
        Err(SchedulerError::JobNotFound { .. })
    ));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    s.shutdown().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(s
        .query_execution_history(&HistoryQuery::for_job(job.id))
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_shot_job_fires_exactly_once() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let registry = Arc::new(TaskRegistry::new());
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    registry.register_fn("count", move |_ctx: JobContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let s = scheduler(Arc::clone(&store), registry);
    let mut events = s.subscribe("test");
    s.start().await.unwrap();

    // an instant that is not a whole millisecond, as `now + d` usually is
    let at = Utc::now() + chrono::Duration::milliseconds(300) + chrono::Duration::nanoseconds(123_456);
    let job = s
        .add_job(JobDefinition::new("once", TargetRef::new("count"), TriggerSpec::date(at)))
        .unwrap();
    let done = wait_for(&mut events, |e| {
        e.job_id == job.id && e.kind == JobEventKind::Completed
    })
    .await;
    assert_eq!(done.fire_time, at);

    tokio::time::sleep(Duration::from_millis(900)).await;
    s.shutdown().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let records = s
        .query_execution_history(&HistoryQuery::for_job(job.id.clone()))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Some(ExecutionOutcome::Success));
    assert_eq!(records[0].fire_time, at);

    let after = s.get_job(&job.id).unwrap().unwrap();
    assert_eq!(after.next_fire_time, None);
    assert_eq!(after.status, JobStatus::Enabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_body_is_recorded_and_schedule_advances() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let registry = Arc::new(TaskRegistry::new());
    registry.register_fn("fail", |_ctx: JobContext| async { anyhow::bail!("boom") });
    let s = scheduler(Arc::clone(&store), registry);
    let mut events = s.subscribe("test");
    s.start().await.unwrap();

    let job = s
        .add_job(JobDefinition::new("flaky", TargetRef::new("fail"), TriggerSpec::cron(EVERY_SECOND)))
        .unwrap();
    let failed = wait_for(&mut events, |e| {
        e.job_id == job.id && matches!(e.kind, JobEventKind::Failed { .. })
    })
    .await;
    s.shutdown().await.unwrap();

    let records = s
        .query_execution_history(&HistoryQuery::for_job(job.id.clone()))
        .unwrap();
    let for_instance: Vec<_> = records
        .iter()
        .filter(|r| r.instance_id == failed.instance_id)
        .collect();
    assert_eq!(for_instance.len(), 1);
    assert_eq!(for_instance[0].outcome, Some(ExecutionOutcome::Failure));
    assert_eq!(for_instance[0].error_detail.as_deref(), Some("boom"));

    let after = s.get_job(&job.id).unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Enabled);
    assert!(after.next_fire_time.unwrap() > failed.fire_time);
}

#[tokio::test]
async fn recovery_records_a_single_missed_firing() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let three_days_ago = Utc::now() - chrono::Duration::days(3);
    let def = JobDefinition::new("hourly", TargetRef::new("noop"), TriggerSpec::cron("0 * * * *"))
        .misfire_policy(MisfirePolicy {
            coalesce: true,
            max_instances: 1,
        });
    let job = store.add(def, three_days_ago).unwrap();

    let s = scheduler(Arc::clone(&store), Arc::new(TaskRegistry::new()));
    s.start().await.unwrap();
    s.shutdown().await.unwrap();

    let records = s
        .query_execution_history(&HistoryQuery::for_job(job.id.clone()))
        .unwrap();
    assert_eq!(records.len(), 1, "one missed record, not one per hour");
    assert_eq!(records[0].outcome, Some(ExecutionOutcome::Missed));

    let after = s.get_job(&job.id).unwrap().unwrap();
    assert!(after.next_fire_time.unwrap() > Utc::now());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_instance_cap_is_never_exceeded() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let registry = Arc::new(TaskRegistry::new());
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    registry.register_fn("slow", move |ctx: JobContext| {
        let (r, p) = (Arc::clone(&r), Arc::clone(&p));
        async move {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(1500)) => {}
                _ = ctx.cancel.cancelled() => {}
            }
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let s = scheduler(Arc::clone(&store), registry);
    s.start().await.unwrap();

    let job = s
        .add_job(JobDefinition::new("slow", TargetRef::new("slow"), TriggerSpec::cron(EVERY_SECOND)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    // a manual run competes for the same slot
    let _ = s.execute_once(&job.id).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    s.shutdown().await.unwrap();

    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_once_leaves_schedule_alone() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let registry = Arc::new(TaskRegistry::new());
    registry.register_fn("noop", |_ctx: JobContext| async { Ok(()) });
    let s = scheduler(Arc::clone(&store), registry);
    let mut events = s.subscribe("test");
    s.start().await.unwrap();

    let job = s
        .add_job(JobDefinition::new("nightly", TargetRef::new("noop"), TriggerSpec::cron("0 0 * * *")))
        .unwrap();
    let paused = s.pause_job(&job.id).unwrap();
    assert_eq!(paused.next_fire_time, None);

    let instance = s.execute_once(&paused.id).await.unwrap();
    wait_for(&mut events, |e| {
        e.instance_id == instance && e.kind == JobEventKind::Completed
    })
    .await;

    let resumed = s.resume_job(&job.id).unwrap();
    let next = resumed.next_fire_time;
    let instance = s.execute_once(&job.id).await.unwrap();
    wait_for(&mut events, |e| {
        e.instance_id == instance && e.kind == JobEventKind::Completed
    })
    .await;
    s.shutdown().await.unwrap();

    let after = s.get_job(&job.id).unwrap().unwrap();
    assert_eq!(after.next_fire_time, next);
    assert_eq!(after.status, JobStatus::Enabled);
    let records = s
        .query_execution_history(&HistoryQuery::for_job(job.id.clone()))
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.outcome == Some(ExecutionOutcome::Success)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_schedulers_share_a_database_without_double_firing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");
    let path = path.to_str().unwrap();

    let fires: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(TaskRegistry::new());
    let sink = Arc::clone(&fires);
    registry.register_fn("record", move |ctx: JobContext| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(ctx.fire_time);
            Ok(())
        }
    });

    let open = || Arc::new(JobStore::open(path, Duration::from_secs(5)).unwrap());
    let first = scheduler(open(), Arc::clone(&registry));
    let second = scheduler(open(), Arc::clone(&registry));
    let job = first
        .add_job(JobDefinition::new("tick", TargetRef::new("record"), TriggerSpec::cron(EVERY_SECOND)))
        .unwrap();

    first.start().await.unwrap();
    second.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();

    let fires = fires.lock().unwrap();
    let unique: HashSet<_> = fires.iter().collect();
    assert!(!fires.is_empty());
    assert_eq!(unique.len(), fires.len(), "a fire time ran twice: {fires:?}");
    assert!(first.get_job(&job.id).unwrap().is_some());
}

#[tokio::test]
async fn invalid_trigger_is_rejected_at_write_time() {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let s = scheduler(Arc::clone(&store), Arc::new(TaskRegistry::new()));

    let err = s
        .add_job(JobDefinition::new("feb30", TargetRef::new("x"), TriggerSpec::cron("0 0 30 2 *")))
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRIGGER");
    assert!(s.list_jobs(&Default::default()).unwrap().is_empty());

    let missing = s.edit_job(
        &JobId::from("nope"),
        JobDefinition::new("x", TargetRef::new("x"), TriggerSpec::cron("* * * * *")),
    );
    assert!(matches!(missing, Err(SchedulerError::JobNotFound { .. })));
}

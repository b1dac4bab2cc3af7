use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::JobStore;
use crate::types::ExecutionOutcome;

/// Lifecycle of one firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted,
    Started,
    Completed,
    Failed { error: String },
    Missed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub fire_time: DateTime<Utc>,
    /// When the event was published.
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        instance_id: InstanceId,
        fire_time: DateTime<Utc>,
        kind: JobEventKind,
    ) -> Self {
        Self {
            job_id,
            instance_id,
            fire_time,
            at: Utc::now(),
            kind,
        }
    }

    /// True for the events that close a firing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::Completed | JobEventKind::Failed { .. } | JobEventKind::Missed { .. }
        )
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<JobEvent>,
}

/// Fan-out of job events to bounded subscriber channels.
///
/// Delivery is best effort: a subscriber whose channel stays full for longer
/// than the send timeout misses that event. Subscribers whose receiver has
/// been dropped are pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    send_timeout: Duration,
}

impl EventBus {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            send_timeout,
        }
    }

    pub fn subscribe(&self, name: impl Into<String>, buffer: usize) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let name = name.into();
        debug!(subscriber = %name, "event subscriber added");
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(Subscriber { name, tx });
        rx
    }

    /// Drop the subscriber registered as `name`; its receiver drains and ends.
    pub fn unsubscribe(&self, name: &str) {
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .retain(|s| s.name != name);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus poisoned").len()
    }

    /// Deliver `event` to every subscriber, waiting at most the send timeout on each.
    pub async fn publish(&self, event: JobEvent) {
        // Snapshot senders so the lock is not held across awaits.
        let targets: Vec<(String, mpsc::Sender<JobEvent>)> = {
            let mut subs = self.subscribers.lock().expect("event bus poisoned");
            subs.retain(|s| !s.tx.is_closed());
            subs.iter().map(|s| (s.name.clone(), s.tx.clone())).collect()
        };

        for (name, tx) in targets {
            match tx.send_timeout(event.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(
                        subscriber = %name,
                        job_id = %event.job_id,
                        instance_id = %event.instance_id,
                        "slow event subscriber skipped"
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(subscriber = %name, "event subscriber gone");
                }
            }
        }
    }
}

/// Writes one `JobExecutionRecord` per firing from the event stream.
pub struct AuditRecorder;

impl AuditRecorder {
    /// Consume `rx` until every sender is dropped, persisting each event.
    ///
    /// Store errors are logged; the recorder keeps going.
    pub fn spawn(store: Arc<JobStore>, mut rx: mpsc::Receiver<JobEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let store = Arc::clone(&store);
                let result =
                    tokio::task::spawn_blocking(move || Self::record(&store, &event)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("audit write failed: {e}"),
                    Err(e) => error!("audit task failed: {e}"),
                }
            }
            debug!("audit recorder stopped");
        })
    }

    fn record(store: &JobStore, event: &JobEvent) -> crate::error::Result<()> {
        debug!(
            job_id = %event.job_id,
            instance_id = %event.instance_id,
            fire_time = %event.fire_time,
            kind = ?event.kind,
            "audit event"
        );
        match &event.kind {
            JobEventKind::Submitted => {
                store.open_record(&event.job_id, &event.instance_id, event.fire_time)
            }
            JobEventKind::Started => store
                .mark_started(&event.instance_id, event.at)
                .map(|_| ()),
            JobEventKind::Completed => store
                .finalize_record(
                    &event.job_id,
                    &event.instance_id,
                    event.fire_time,
                    ExecutionOutcome::Success,
                    None,
                    event.at,
                    None,
                )
                .map(|_| ()),
            JobEventKind::Failed { error } => store
                .finalize_record(
                    &event.job_id,
                    &event.instance_id,
                    event.fire_time,
                    ExecutionOutcome::Failure,
                    None,
                    event.at,
                    Some(error),
                )
                .map(|_| ()),
            JobEventKind::Missed { reason } => store
                .finalize_record(
                    &event.job_id,
                    &event.instance_id,
                    event.fire_time,
                    ExecutionOutcome::Missed,
                    None,
                    event.at,
                    Some(reason),
                )
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryQuery;

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent::new(JobId::from("j"), InstanceId::new(), Utc::now(), kind)
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(Duration::from_millis(50));
        let mut a = bus.subscribe("a", 4);
        let mut b = bus.subscribe("b", 4);

        bus.publish(event(JobEventKind::Submitted)).await;

        assert_eq!(a.recv().await.unwrap().kind, JobEventKind::Submitted);
        assert_eq!(b.recv().await.unwrap().kind, JobEventKind::Submitted);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(Duration::from_millis(20));
        let _full = bus.subscribe("full", 1);
        let mut healthy = bus.subscribe("healthy", 8);

        let started = std::time::Instant::now();
        for _ in 0..3 {
            bus.publish(event(JobEventKind::Started)).await;
        }
        // two publishes time out on the full channel; nowhere near a blocking wait
        assert!(started.elapsed() < Duration::from_secs(1));

        for _ in 0..3 {
            assert!(healthy.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(Duration::from_millis(20));
        let rx = bus.subscribe("gone", 1);
        drop(rx);
        bus.publish(event(JobEventKind::Completed)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recorder_writes_one_record_per_firing() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let bus = EventBus::new(Duration::from_millis(50));
        let recorder = AuditRecorder::spawn(Arc::clone(&store), bus.subscribe("audit", 16));

        let job_id = JobId::from("j");
        let instance = InstanceId::new();
        let fire = Utc::now();
        for kind in [
            JobEventKind::Submitted,
            JobEventKind::Started,
            JobEventKind::Failed {
                error: "boom".into(),
            },
        ] {
            bus.publish(JobEvent::new(job_id.clone(), instance.clone(), fire, kind))
                .await;
        }
        bus.publish(JobEvent::new(
            job_id.clone(),
            InstanceId::new(),
            fire,
            JobEventKind::Missed {
                reason: "scheduler offline".into(),
            },
        ))
        .await;

        drop(bus);
        recorder.await.unwrap();

        let records = store.list_records(&HistoryQuery::for_job(job_id)).unwrap();
        assert_eq!(records.len(), 2);
        let failed = records.iter().find(|r| r.instance_id == instance).unwrap();
        assert_eq!(failed.outcome, Some(ExecutionOutcome::Failure));
        assert!(failed.start_time.is_some());
        assert_eq!(failed.error_detail.as_deref(), Some("boom"));
        assert!(records
            .iter()
            .any(|r| r.outcome == Some(ExecutionOutcome::Missed)));
    }
}

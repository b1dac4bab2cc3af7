//! `keel-scheduler`: persistent cron/date job scheduler on tokio and SQLite.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table ([`store::JobStore`]). A single timer
//! loop per process keeps a min-heap of next fire times, sleeps until the
//! earliest is due, claims the firing through a compare-and-swap on the row's
//! `version` ([`store::JobStore::reserve_and_advance`]) and hands the job to a
//! bounded worker pool ([`dispatcher::ExecutionDispatcher`]). Lifecycle events
//! flow over an [`events::EventBus`] into the `job_execution_records` audit
//! table. Several processes may share one database; the CAS makes sure each
//! firing runs once.
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                               |
//! |------------|---------------------------------------------------------|
//! | `Cron`     | 5/6/7-field cron expression evaluated in UTC            |
//! | `Date`     | Single fire at an absolute UTC instant                  |
//! | `Combined` | Earliest fire time of any sub-trigger                   |

pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod trigger;
pub mod types;

pub use dispatcher::ExecutionDispatcher;
pub use engine::{Scheduler, SchedulerState};
pub use error::{Result, SchedulerError, TriggerError};
pub use events::{AuditRecorder, EventBus, JobEvent, JobEventKind};
pub use registry::{JobContext, JobHandler, TaskRegistry};
pub use store::{JobStore, Reservation};
pub use types::{
    ExecutionOutcome, HistoryQuery, Job, JobDefinition, JobExecutionRecord, JobFilter, JobStatus,
    JobSummary, MisfirePolicy, TargetRef, TriggerSpec,
};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId};
use serde::{Deserialize, Serialize};

/// Defines when a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire on every instant matching a 5/6/7-field cron expression (UTC).
    Cron { expression: String },

    /// Fire exactly once at the given UTC instant.
    Date { at: DateTime<Utc> },

    /// Fire whenever any sub-trigger fires (OR).
    Combined { triggers: Vec<TriggerSpec> },
}

impl TriggerSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        TriggerSpec::Cron {
            expression: expression.into(),
        }
    }

    pub fn date(at: DateTime<Utc>) -> Self {
        TriggerSpec::Date { at }
    }

    pub fn any_of(triggers: Vec<TriggerSpec>) -> Self {
        TriggerSpec::Combined { triggers }
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Cron { expression } => write!(f, "cron[{expression}]"),
            TriggerSpec::Date { at } => write!(f, "date[{}]", at.to_rfc3339()),
            TriggerSpec::Combined { triggers } => {
                write!(f, "or[")?;
                for (i, t) in triggers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// How missed and overlapping firings are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisfirePolicy {
    /// Collapse a backlog of missed firings into one catch-up firing.
    #[serde(default)]
    pub coalesce: bool,
    /// Upper bound on concurrently running instances of this job.
    #[serde(default = "one")]
    pub max_instances: u32,
}

fn one() -> u32 {
    1
}

impl Default for MisfirePolicy {
    fn default() -> Self {
        Self {
            coalesce: false,
            max_instances: 1,
        }
    }
}

/// Administrative state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Scheduled; `next_fire_time` is kept current.
    Enabled,
    /// Temporarily not firing; resumable.
    Paused,
    /// Switched off, either by an operator or because its trigger broke.
    Disabled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Enabled => "enabled",
            JobStatus::Paused => "paused",
            JobStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(JobStatus::Enabled),
            "paused" => Ok(JobStatus::Paused),
            "disabled" => Ok(JobStatus::Disabled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Opaque reference to a job body, resolved against the task registry at fire time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    /// Registry key of the handler, e.g. `"report.daily"`.
    pub task: String,
    /// Positional arguments forwarded untouched to the handler.
    #[serde(default)]
    pub args: Vec<String>,
    /// Keyword arguments forwarded untouched to the handler.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl TargetRef {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.task, self.args.join(","))
    }
}

/// Caller-supplied definition used by `add` and `edit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub target: TargetRef,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    /// Hard timeout for one execution of the body.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Operator performing the write; lands in created_by / updated_by.
    #[serde(default)]
    pub actor: Option<String>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_status() -> JobStatus {
    JobStatus::Enabled
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, target: TargetRef, trigger: TriggerSpec) -> Self {
        Self {
            name: name.into(),
            group: default_group(),
            target,
            trigger,
            misfire_policy: MisfirePolicy::default(),
            status: JobStatus::Enabled,
            timeout_ms: None,
            actor: None,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub group: String,
    pub target: TargetRef,
    pub trigger: TriggerSpec,
    pub misfire_policy: MisfirePolicy,
    pub status: JobStatus,
    /// `None` means the job will not fire again (paused, disabled or exhausted).
    pub next_fire_time: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    /// Bumped on every write; the CAS token for reservations.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl Job {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            group: self.group.clone(),
            target: self.target.to_string(),
            trigger: self.trigger.to_string(),
            status: self.status,
            next_fire_time: self.next_fire_time,
        }
    }
}

/// Listing row returned to the admin layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub group: String,
    pub target: String,
    pub trigger: String,
    pub status: JobStatus,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Filter for `list_jobs`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub name_contains: Option<String>,
    pub group: Option<String>,
    pub status: Option<JobStatus>,
}

/// Final result of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Missed,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
            ExecutionOutcome::Missed => "missed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionOutcome::Success),
            "failure" => Ok(ExecutionOutcome::Failure),
            "missed" => Ok(ExecutionOutcome::Missed),
            other => Err(format!("unknown execution outcome: {other}")),
        }
    }
}

/// One row per firing attempt.
///
/// Created when the firing is dispatched (`outcome` still `None`) and
/// finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub id: i64,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub fire_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Option<ExecutionOutcome>,
    pub error_detail: Option<String>,
}

/// Filter for execution history queries, newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub job_id: Option<JobId>,
    pub outcome: Option<ExecutionOutcome>,
    /// Inclusive lower bound on `fire_time`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `fire_time`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}

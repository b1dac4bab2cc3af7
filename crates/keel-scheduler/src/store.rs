use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, JobId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::db::{from_db_time, init_db, to_db_time};
use crate::error::{Result, SchedulerError};
use crate::trigger;
use crate::types::{
    ExecutionOutcome, HistoryQuery, Job, JobDefinition, JobExecutionRecord, JobFilter, JobStatus,
    TriggerSpec,
};

const JOB_COLUMNS: &str = "id, name, job_group, target_ref, trigger_spec, misfire_policy, status,
     next_fire_time, timeout_ms, version, created_at, updated_at, created_by, updated_by";

const RECORD_COLUMNS: &str =
    "id, job_id, instance_id, fire_time, start_time, end_time, outcome, error_detail";

/// Result of [`JobStore::reserve_and_advance`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// This caller owns the firing at `fire_time`. `job` carries the advanced
    /// `next_fire_time` (and `Disabled` status if the trigger broke).
    Reserved { job: Job, fire_time: DateTime<Utc> },
    /// Another instance (or an edit) moved the job on; do not execute.
    AlreadyReserved { next_fire_time: Option<DateTime<Utc>> },
    /// The expected fire time has not arrived yet.
    NotDue { next_fire_time: DateTime<Utc> },
    /// Paused, disabled or exhausted.
    Inactive,
    NotFound,
}

/// Durable job definitions, fire-time bookkeeping and execution records.
///
/// Wraps a single SQLite connection in a `Mutex`. Several stores may be
/// opened on the same database file; they coordinate only through the
/// `version` column.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("job store connection poisoned")
    }

    // --- jobs ----------------------------------------------------------------

    /// Validate and persist a new job. Nothing is written if the trigger is invalid.
    #[instrument(skip(self, def), fields(name = %def.name))]
    pub fn add(&self, def: JobDefinition, now: DateTime<Utc>) -> Result<Job> {
        let next = initial_fire_time(&def.trigger, def.status, now)?;
        let job = Job {
            id: JobId::new(),
            name: def.name,
            group: def.group,
            target: def.target,
            trigger: def.trigger,
            misfire_policy: def.misfire_policy,
            status: def.status,
            next_fire_time: next,
            timeout_ms: def.timeout_ms,
            version: 0,
            created_at: now,
            updated_at: now,
            created_by: def.actor.clone(),
            updated_by: def.actor,
        };

        self.conn().execute(
            "INSERT INTO jobs
             (id, name, job_group, target_ref, trigger_spec, misfire_policy, status,
              next_fire_time, timeout_ms, version, created_at, updated_at, created_by, updated_by)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,0,?10,?10,?11,?11)",
            rusqlite::params![
                job.id.as_str(),
                job.name,
                job.group,
                serde_json::to_string(&job.target)?,
                serde_json::to_string(&job.trigger)?,
                serde_json::to_string(&job.misfire_policy)?,
                job.status.to_string(),
                job.next_fire_time.map(to_db_time),
                job.timeout_ms.map(|ms| ms as i64),
                to_db_time(now),
                job.created_by,
            ],
        )?;

        info!(job_id = %job.id, next_fire_time = ?job.next_fire_time, "job added");
        Ok(job)
    }

    /// Replace a job's definition, recomputing `next_fire_time` in the same write.
    #[instrument(skip(self, def), fields(job_id = %id))]
    pub fn edit(&self, id: &JobId, def: JobDefinition, now: DateTime<Utc>) -> Result<Job> {
        let next = initial_fire_time(&def.trigger, def.status, now)?;

        let n = self.conn().execute(
            "UPDATE jobs SET name=?1, job_group=?2, target_ref=?3, trigger_spec=?4,
                    misfire_policy=?5, status=?6, next_fire_time=?7, timeout_ms=?8,
                    version=version+1, updated_at=?9, updated_by=?10
             WHERE id=?11",
            rusqlite::params![
                def.name,
                def.group,
                serde_json::to_string(&def.target)?,
                serde_json::to_string(&def.trigger)?,
                serde_json::to_string(&def.misfire_policy)?,
                def.status.to_string(),
                next.map(to_db_time),
                def.timeout_ms.map(|ms| ms as i64),
                to_db_time(now),
                def.actor,
                id.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(next_fire_time = ?next, "job edited");
        self.require(id)
    }

    /// Change a job's status, recomputing `next_fire_time` atomically.
    ///
    /// Enabling computes the next fire time from `now`; any other status
    /// clears it.
    #[instrument(skip(self), fields(job_id = %id, %status))]
    pub fn set_status(
        &self,
        id: &JobId,
        status: JobStatus,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let trigger_json: Option<String> = tx
            .query_row(
                "SELECT trigger_spec FROM jobs WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(trigger_json) = trigger_json else {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        };
        let spec: TriggerSpec = serde_json::from_str(&trigger_json)?;
        let next = initial_fire_time(&spec, status, now)?;

        tx.execute(
            "UPDATE jobs SET status=?1, next_fire_time=?2, version=version+1,
                    updated_at=?3, updated_by=COALESCE(?4, updated_by)
             WHERE id=?5",
            rusqlite::params![
                status.to_string(),
                next.map(to_db_time),
                to_db_time(now),
                actor,
                id.as_str()
            ],
        )?;
        tx.commit()?;
        drop(conn);

        info!(next_fire_time = ?next, "job status changed");
        self.require(id)
    }

    /// Delete a job. `JobNotFound` if it was already gone.
    ///
    /// Returning `Ok` tells the caller to cancel any pending timer entry.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn remove(&self, id: &JobId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!("job removed");
        Ok(())
    }

    /// Delete several jobs in one transaction; returns the ids that did not exist.
    pub fn remove_many(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut missing = Vec::new();
        for id in ids {
            if tx.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])? == 0 {
                missing.push(id.clone());
            }
        }
        tx.commit()?;
        info!(removed = ids.len() - missing.len(), "jobs removed");
        Ok(missing)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let job = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn require(&self, id: &JobId) -> Result<Job> {
        self.get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// Jobs matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1");
        let mut params: Vec<String> = Vec::new();
        if let Some(name) = &filter.name_contains {
            params.push(name.clone());
            sql.push_str(&format!(" AND instr(name, ?{}) > 0", params.len()));
        }
        if let Some(group) = &filter.group {
            params.push(group.clone());
            sql.push_str(&format!(" AND job_group = ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(status.to_string());
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY created_at, id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_job)?;
        Ok(collect_valid(rows))
    }

    pub fn list_enabled(&self) -> Result<Vec<Job>> {
        self.list(&JobFilter {
            status: Some(JobStatus::Enabled),
            ..JobFilter::default()
        })
    }

    /// Claim the firing of `id` scheduled at `due` and advance its schedule.
    ///
    /// Reads the job, checks that its `next_fire_time` is still `due` and that
    /// `due <= now`, computes the following fire time, and writes it back only
    /// if the row's `version` is unchanged. Exactly one of several concurrent
    /// callers (across connections or processes) gets `Reserved`.
    ///
    /// With `coalesce` the schedule advances from `now`, skipping any backlog;
    /// otherwise it advances from `due` so each occurrence fires in turn.
    /// A trigger that can no longer be evaluated disables the job.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn reserve_and_advance(
        &self,
        id: &JobId,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let Some(mut job) = self.get(id)? else {
            return Ok(Reservation::NotFound);
        };
        if job.status != JobStatus::Enabled {
            return Ok(Reservation::Inactive);
        }
        let Some(fire_time) = job.next_fire_time else {
            return Ok(Reservation::Inactive);
        };
        if fire_time != due {
            return Ok(Reservation::AlreadyReserved {
                next_fire_time: Some(fire_time),
            });
        }
        if fire_time > now {
            return Ok(Reservation::NotDue {
                next_fire_time: fire_time,
            });
        }

        let base = if job.misfire_policy.coalesce {
            now.max(fire_time)
        } else {
            fire_time
        };
        let (next, status) = match trigger::next_fire_time(&job.trigger, base) {
            Ok(next) => (next, JobStatus::Enabled),
            Err(e) => {
                warn!(error = %e, "trigger can no longer be evaluated; disabling job");
                (None, JobStatus::Disabled)
            }
        };

        let n = self.conn().execute(
            "UPDATE jobs SET next_fire_time=?1, status=?2, version=version+1
             WHERE id=?3 AND version=?4",
            rusqlite::params![
                next.map(to_db_time),
                status.to_string(),
                id.as_str(),
                job.version
            ],
        )?;
        if n == 0 {
            debug!("reservation lost the compare-and-swap");
            return Ok(Reservation::AlreadyReserved {
                next_fire_time: None,
            });
        }

        job.next_fire_time = next;
        job.status = status;
        job.version += 1;
        Ok(Reservation::Reserved { job, fire_time })
    }

    /// Compare-and-swap write of the schedule fields, used by recovery.
    ///
    /// Returns `false` if the row changed (or vanished) since `expected_version`.
    pub fn reschedule(
        &self,
        id: &JobId,
        expected_version: i64,
        next: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE jobs SET next_fire_time=?1, status=?2, version=version+1
             WHERE id=?3 AND version=?4",
            rusqlite::params![
                next.map(to_db_time),
                status.to_string(),
                id.as_str(),
                expected_version
            ],
        )?;
        Ok(n == 1)
    }

    // --- execution records -----------------------------------------------------

    /// Open a record for a dispatched firing; `outcome` stays NULL until finalized.
    pub fn open_record(
        &self,
        job_id: &JobId,
        instance_id: &InstanceId,
        fire_time: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO job_execution_records (job_id, instance_id, fire_time)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![job_id.as_str(), instance_id.as_str(), to_db_time(fire_time)],
        )?;
        Ok(())
    }

    pub fn mark_started(&self, instance_id: &InstanceId, at: DateTime<Utc>) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE job_execution_records SET start_time = ?1
             WHERE instance_id = ?2 AND outcome IS NULL",
            rusqlite::params![to_db_time(at), instance_id.as_str()],
        )?;
        Ok(n == 1)
    }

    /// Finalize the record for `instance_id`, creating it if it was never opened.
    ///
    /// A record is finalized at most once; later calls are no-ops and return `false`.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_record(
        &self,
        job_id: &JobId,
        instance_id: &InstanceId,
        fire_time: DateTime<Utc>,
        outcome: ExecutionOutcome,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        error_detail: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE job_execution_records
             SET outcome = ?1, end_time = ?2, error_detail = ?3,
                 start_time = COALESCE(start_time, ?4)
             WHERE instance_id = ?5 AND outcome IS NULL",
            rusqlite::params![
                outcome.to_string(),
                to_db_time(end_time),
                error_detail,
                start_time.map(to_db_time),
                instance_id.as_str()
            ],
        )?;
        if n == 1 {
            return Ok(true);
        }
        let n = conn.execute(
            "INSERT OR IGNORE INTO job_execution_records
             (job_id, instance_id, fire_time, start_time, end_time, outcome, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                job_id.as_str(),
                instance_id.as_str(),
                to_db_time(fire_time),
                start_time.map(to_db_time),
                to_db_time(end_time),
                outcome.to_string(),
                error_detail
            ],
        )?;
        Ok(n == 1)
    }

    /// Execution records matching `query`, newest fire time first.
    pub fn list_records(&self, query: &HistoryQuery) -> Result<Vec<JobExecutionRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM job_execution_records WHERE 1=1");
        let mut params: Vec<String> = Vec::new();
        if let Some(job_id) = &query.job_id {
            params.push(job_id.to_string());
            sql.push_str(&format!(" AND job_id = ?{}", params.len()));
        }
        if let Some(outcome) = query.outcome {
            params.push(outcome.to_string());
            sql.push_str(&format!(" AND outcome = ?{}", params.len()));
        }
        if let Some(from) = query.from {
            params.push(to_db_time(from));
            sql.push_str(&format!(" AND fire_time >= ?{}", params.len()));
        }
        if let Some(to) = query.to {
            params.push(to_db_time(to));
            sql.push_str(&format!(" AND fire_time < ?{}", params.len()));
        }
        sql.push_str(" ORDER BY fire_time DESC, id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?;
        Ok(collect_valid(rows))
    }

    /// Delete specific execution records by row id; returns how many went.
    pub fn delete_records(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx.execute("DELETE FROM job_execution_records WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete finalized records, optionally limited to one job and/or to fire
    /// times before `before`. Open records are kept.
    pub fn purge_records(
        &self,
        job_id: Option<&JobId>,
        before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM job_execution_records
             WHERE outcome IS NOT NULL
               AND (?1 IS NULL OR job_id = ?1)
               AND (?2 IS NULL OR fire_time < ?2)",
            rusqlite::params![job_id.map(|id| id.as_str()), before.map(to_db_time)],
        )?;
        info!(deleted = n, "execution history purged");
        Ok(n)
    }
}

/// Next fire time for a freshly written definition; validates the trigger.
fn initial_fire_time(
    spec: &TriggerSpec,
    status: JobStatus,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    trigger::validate(spec)?;
    if status != JobStatus::Enabled {
        return Ok(None);
    }
    Ok(trigger::next_fire_time(spec, now)?)
}

/// Keep well-formed rows, logging the ones that fail to decode.
fn collect_valid<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Vec<T> {
    rows.filter_map(|r| match r {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "skipping undecodable row");
            None
        }
    })
    .collect()
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    from_db_time(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| from_db_time(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Map a SQLite row (in `JOB_COLUMNS` order) to a `Job`.
fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(6)?;
    Ok(Job {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        group: row.get(2)?,
        target: json_col(row, 3)?,
        trigger: json_col(row, 4)?,
        misfire_policy: json_col(row, 5)?,
        status: status.parse().map_err(|e: String| conversion_error(6, e))?,
        next_fire_time: opt_time_col(row, 7)?,
        timeout_ms: row.get::<_, Option<i64>>(8)?.map(|ms| ms as u64),
        version: row.get(9)?,
        created_at: time_col(row, 10)?,
        updated_at: time_col(row, 11)?,
        created_by: row.get(12)?,
        updated_by: row.get(13)?,
    })
}

/// Map a SQLite row (in `RECORD_COLUMNS` order) to a `JobExecutionRecord`.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobExecutionRecord> {
    let outcome: Option<String> = row.get(6)?;
    Ok(JobExecutionRecord {
        id: row.get(0)?,
        job_id: JobId(row.get(1)?),
        instance_id: InstanceId(row.get(2)?),
        fire_time: time_col(row, 3)?,
        start_time: opt_time_col(row, 4)?,
        end_time: opt_time_col(row, 5)?,
        outcome: outcome
            .map(|s| s.parse().map_err(|e: String| conversion_error(6, e)))
            .transpose()?,
        error_detail: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use chrono::TimeZone;

    use super::*;
    use crate::types::{MisfirePolicy, TargetRef};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn every_minute() -> JobDefinition {
        JobDefinition::new(
            "tick",
            TargetRef::new("demo.echo"),
            TriggerSpec::cron("* * * * *"),
        )
    }

    #[test]
    fn add_computes_next_fire_time() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute().actor("admin"), at(10, 0, 30)).unwrap();
        assert_eq!(job.next_fire_time, Some(at(10, 1, 0)));
        assert_eq!(job.version, 0);

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.next_fire_time, Some(at(10, 1, 0)));
        assert_eq!(loaded.created_by.as_deref(), Some("admin"));
        assert_eq!(loaded.target, TargetRef::new("demo.echo"));
    }

    #[test]
    fn invalid_trigger_is_not_persisted() {
        let store = JobStore::open_in_memory().unwrap();
        let def = JobDefinition::new("bad", TargetRef::new("x"), TriggerSpec::cron("99 * * * *"));
        let err = store.add(def, at(10, 0, 0)).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRIGGER");

        let feb30 = JobDefinition::new("feb30", TargetRef::new("x"), TriggerSpec::cron("0 0 30 2 *"));
        assert!(matches!(
            store.add(feb30, at(10, 0, 0)),
            Err(SchedulerError::InvalidTrigger(_))
        ));
        assert!(store.list(&JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn paused_job_has_no_next_fire_time() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store
            .add(every_minute().status(JobStatus::Paused), at(10, 0, 0))
            .unwrap();
        assert_eq!(job.next_fire_time, None);
        assert!(store.list_enabled().unwrap().is_empty());
    }

    #[test]
    fn edit_recomputes_and_bumps_version() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 0)).unwrap();

        let def = JobDefinition::new("hourly", TargetRef::new("demo.echo"), TriggerSpec::cron("0 * * * *"));
        let edited = store.edit(&job.id, def, at(10, 5, 0)).unwrap();
        assert_eq!(edited.name, "hourly");
        assert_eq!(edited.next_fire_time, Some(at(11, 0, 0)));
        assert_eq!(edited.version, 1);

        let missing = store.edit(&JobId::from("nope"), every_minute(), at(10, 5, 0));
        assert!(matches!(missing, Err(SchedulerError::JobNotFound { .. })));
    }

    #[test]
    fn edit_with_invalid_trigger_leaves_row_untouched() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 0)).unwrap();
        let bad = JobDefinition::new("bad", TargetRef::new("x"), TriggerSpec::cron("nope"));
        assert!(store.edit(&job.id, bad, at(10, 1, 0)).is_err());
        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.name, "tick");
        assert_eq!(loaded.version, 0);
    }

    #[test]
    fn set_status_clears_and_restores_next_fire_time() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 0)).unwrap();

        let paused = store
            .set_status(&job.id, JobStatus::Paused, Some("ops"), at(10, 0, 10))
            .unwrap();
        assert_eq!(paused.next_fire_time, None);
        assert_eq!(paused.updated_by.as_deref(), Some("ops"));

        let resumed = store
            .set_status(&job.id, JobStatus::Enabled, None, at(10, 7, 10))
            .unwrap();
        assert_eq!(resumed.next_fire_time, Some(at(10, 8, 0)));
        assert_eq!(resumed.updated_by.as_deref(), Some("ops"));
    }

    #[test]
    fn remove_twice() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 0)).unwrap();
        assert!(store.remove(&job.id).is_ok());
        assert!(matches!(
            store.remove(&job.id),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[test]
    fn remove_many_reports_missing() {
        let store = JobStore::open_in_memory().unwrap();
        let a = store.add(every_minute(), at(10, 0, 0)).unwrap();
        let ghost = JobId::from("ghost");
        let missing = store.remove_many(&[a.id.clone(), ghost.clone()]).unwrap();
        assert_eq!(missing, vec![ghost]);
        assert!(store.get(&a.id).unwrap().is_none());
    }

    #[test]
    fn list_filters_by_name_group_and_status() {
        let store = JobStore::open_in_memory().unwrap();
        store.add(every_minute().group("reports"), at(10, 0, 0)).unwrap();
        let other = JobDefinition::new("cleanup", TargetRef::new("x"), TriggerSpec::cron("0 0 * * *"))
            .status(JobStatus::Paused);
        store.add(other, at(10, 0, 0)).unwrap();

        let by_name = store
            .list(&JobFilter {
                name_contains: Some("clean".into()),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name, "cleanup");

        let by_group = store
            .list(&JobFilter {
                group: Some("reports".into()),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(by_group.len(), 1);

        assert_eq!(store.list_enabled().unwrap().len(), 1);
    }

    #[test]
    fn reserve_advances_schedule() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 30)).unwrap();
        let due = at(10, 1, 0);

        assert!(matches!(
            store.reserve_and_advance(&job.id, due, at(10, 0, 59)).unwrap(),
            Reservation::NotDue { .. }
        ));

        match store.reserve_and_advance(&job.id, due, at(10, 1, 0)).unwrap() {
            Reservation::Reserved { job, fire_time } => {
                assert_eq!(fire_time, due);
                assert_eq!(job.next_fire_time, Some(at(10, 2, 0)));
            }
            other => panic!("expected reservation, got {other:?}"),
        }

        // the same firing cannot be claimed again
        assert!(matches!(
            store.reserve_and_advance(&job.id, due, at(10, 1, 0)).unwrap(),
            Reservation::AlreadyReserved { .. }
        ));
    }

    #[test]
    fn reserve_without_coalesce_walks_the_backlog() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 30)).unwrap();
        match store.reserve_and_advance(&job.id, at(10, 1, 0), at(10, 5, 0)).unwrap() {
            Reservation::Reserved { job, .. } => assert_eq!(job.next_fire_time, Some(at(10, 2, 0))),
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[test]
    fn reserve_with_coalesce_skips_the_backlog() {
        let store = JobStore::open_in_memory().unwrap();
        let def = every_minute().misfire_policy(MisfirePolicy {
            coalesce: true,
            max_instances: 1,
        });
        let job = store.add(def, at(10, 0, 30)).unwrap();
        match store.reserve_and_advance(&job.id, at(10, 1, 0), at(10, 5, 0)).unwrap() {
            Reservation::Reserved { job, .. } => assert_eq!(job.next_fire_time, Some(at(10, 6, 0))),
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[test]
    fn one_shot_reservation_exhausts_job() {
        let store = JobStore::open_in_memory().unwrap();
        let def = JobDefinition::new("once", TargetRef::new("x"), TriggerSpec::date(at(11, 0, 0)));
        let job = store.add(def, at(10, 0, 0)).unwrap();
        match store.reserve_and_advance(&job.id, at(11, 0, 0), at(11, 0, 0)).unwrap() {
            Reservation::Reserved { job, .. } => assert_eq!(job.next_fire_time, None),
            other => panic!("expected reservation, got {other:?}"),
        }
        assert!(matches!(
            store.reserve_and_advance(&job.id, at(11, 0, 0), at(11, 0, 1)).unwrap(),
            Reservation::Inactive
        ));
    }

    #[test]
    fn sub_millisecond_date_reserves_exactly_once() {
        let store = JobStore::open_in_memory().unwrap();
        let fire = at(11, 0, 0) + chrono::Duration::nanoseconds(300_123_456);
        let def = JobDefinition::new("once", TargetRef::new("x"), TriggerSpec::date(fire));
        let job = store.add(def, at(10, 0, 0)).unwrap();
        assert_eq!(job.next_fire_time, Some(fire));
        assert_eq!(store.get(&job.id).unwrap().unwrap().next_fire_time, Some(fire));

        let now = fire + chrono::Duration::milliseconds(5);
        match store.reserve_and_advance(&job.id, fire, now).unwrap() {
            Reservation::Reserved { job, fire_time } => {
                assert_eq!(fire_time, fire);
                assert_eq!(job.next_fire_time, None);
            }
            other => panic!("expected reservation, got {other:?}"),
        }
        assert!(matches!(
            store.reserve_and_advance(&job.id, fire, now).unwrap(),
            Reservation::Inactive
        ));
    }

    #[test]
    fn unsatisfiable_trigger_at_fire_time_disables_job() {
        let store = JobStore::open_in_memory().unwrap();
        let broken = store.add(every_minute(), at(10, 0, 30)).unwrap();
        let healthy = store.add(every_minute(), at(10, 0, 30)).unwrap();
        // Feb 30 never happens; the row went bad after it was scheduled
        store
            .conn()
            .execute(
                "UPDATE jobs SET trigger_spec = ?1 WHERE id = ?2",
                rusqlite::params![
                    r#"{"kind":"cron","expression":"0 0 30 2 *"}"#,
                    broken.id.as_str()
                ],
            )
            .unwrap();

        match store.reserve_and_advance(&broken.id, at(10, 1, 0), at(10, 1, 0)).unwrap() {
            Reservation::Reserved { job, fire_time } => {
                assert_eq!(fire_time, at(10, 1, 0));
                assert_eq!(job.status, JobStatus::Disabled);
                assert_eq!(job.next_fire_time, None);
            }
            other => panic!("expected reservation, got {other:?}"),
        }
        let stored = store.get(&broken.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Disabled);
        assert_eq!(stored.next_fire_time, None);

        match store.reserve_and_advance(&healthy.id, at(10, 1, 0), at(10, 1, 0)).unwrap() {
            Reservation::Reserved { job, .. } => {
                assert_eq!(job.status, JobStatus::Enabled);
                assert_eq!(job.next_fire_time, Some(at(10, 2, 0)));
            }
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[test]
    fn reserve_missing_job() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(matches!(
            store
                .reserve_and_advance(&JobId::from("gone"), at(10, 0, 0), at(10, 0, 0))
                .unwrap(),
            Reservation::NotFound
        ));
    }

    #[test]
    fn concurrent_reservations_on_shared_store() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let job = store.add(every_minute(), at(10, 0, 30)).unwrap();
        let due = at(10, 1, 0);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let id = job.id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.reserve_and_advance(&id, due, at(10, 1, 0)).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let reserved = results
            .iter()
            .filter(|r| matches!(r, Reservation::Reserved { .. }))
            .count();
        let lost = results
            .iter()
            .filter(|r| matches!(r, Reservation::AlreadyReserved { .. }))
            .count();
        assert_eq!(reserved, 1);
        assert_eq!(lost, 7);
    }

    #[test]
    fn concurrent_reservations_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.db");
        let path = path.to_str().unwrap().to_string();
        let timeout = Duration::from_secs(5);

        let first = JobStore::open(&path, timeout).unwrap();
        let job = first.add(every_minute(), at(10, 0, 30)).unwrap();
        let second = JobStore::open(&path, timeout).unwrap();
        let due = at(10, 1, 0);
        let barrier = Barrier::new(2);

        let (a, b) = std::thread::scope(|s| {
            let ha = s.spawn(|| {
                barrier.wait();
                first.reserve_and_advance(&job.id, due, at(10, 1, 0)).unwrap()
            });
            let hb = s.spawn(|| {
                barrier.wait();
                second.reserve_and_advance(&job.id, due, at(10, 1, 0)).unwrap()
            });
            (ha.join().unwrap(), hb.join().unwrap())
        });

        let reserved = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Reservation::Reserved { .. }))
            .count();
        assert_eq!(reserved, 1, "results: {a:?} / {b:?}");
        assert_eq!(
            first.get(&job.id).unwrap().unwrap().next_fire_time,
            Some(at(10, 2, 0))
        );
    }

    #[test]
    fn records_are_finalized_once() {
        let store = JobStore::open_in_memory().unwrap();
        let job = store.add(every_minute(), at(10, 0, 0)).unwrap();
        let instance = InstanceId::new();

        store.open_record(&job.id, &instance, at(10, 1, 0)).unwrap();
        assert!(store.mark_started(&instance, at(10, 1, 1)).unwrap());
        assert!(store
            .finalize_record(&job.id, &instance, at(10, 1, 0), ExecutionOutcome::Failure, None, at(10, 1, 2), Some("boom"))
            .unwrap());
        assert!(!store
            .finalize_record(&job.id, &instance, at(10, 1, 0), ExecutionOutcome::Success, None, at(10, 1, 3), None)
            .unwrap());

        let records = store.list_records(&HistoryQuery::for_job(job.id.clone())).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Some(ExecutionOutcome::Failure));
        assert_eq!(records[0].start_time, Some(at(10, 1, 1)));
        assert_eq!(records[0].error_detail.as_deref(), Some("boom"));
    }

    #[test]
    fn finalize_without_open_inserts_row() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = JobId::from("j");
        let instance = InstanceId::new();
        assert!(store
            .finalize_record(&job_id, &instance, at(9, 0, 0), ExecutionOutcome::Missed, None, at(10, 0, 0), Some("offline"))
            .unwrap());
        let records = store.list_records(&HistoryQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Some(ExecutionOutcome::Missed));
        assert_eq!(records[0].start_time, None);
    }

    #[test]
    fn history_query_and_purge() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = JobId::from("j");
        for (i, outcome) in [ExecutionOutcome::Success, ExecutionOutcome::Failure, ExecutionOutcome::Success]
            .into_iter()
            .enumerate()
        {
            let fire = at(10, i as u32, 0);
            store
                .finalize_record(&job_id, &InstanceId::new(), fire, outcome, Some(fire), fire, None)
                .unwrap();
        }
        // an open record survives purges
        store.open_record(&job_id, &InstanceId::new(), at(10, 9, 0)).unwrap();

        let failures = store
            .list_records(&HistoryQuery {
                outcome: Some(ExecutionOutcome::Failure),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(failures.len(), 1);

        let window = store
            .list_records(&HistoryQuery::for_job(job_id.clone()).between(at(10, 1, 0), at(10, 3, 0)))
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].fire_time, at(10, 2, 0), "newest first");

        assert_eq!(store.purge_records(Some(&job_id), Some(at(10, 1, 0))).unwrap(), 1);
        assert_eq!(store.purge_records(None, None).unwrap(), 2);
        assert_eq!(store.list_records(&HistoryQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn delete_records_by_id() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = JobId::from("j");
        store.open_record(&job_id, &InstanceId::new(), at(10, 0, 0)).unwrap();
        let id = store.list_records(&HistoryQuery::default()).unwrap()[0].id;
        assert_eq!(store.delete_records(&[id, id + 100]).unwrap(), 1);
    }
}

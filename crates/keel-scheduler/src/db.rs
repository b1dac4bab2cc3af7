use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `job_execution_records` tables (idempotent) and
/// the indexes backing the startup scan and history queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            job_group       TEXT    NOT NULL DEFAULT 'default',
            target_ref      TEXT    NOT NULL,   -- JSON-encoded TargetRef
            trigger_spec    TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            misfire_policy  TEXT    NOT NULL,   -- JSON-encoded MisfirePolicy
            status          TEXT    NOT NULL DEFAULT 'enabled',
            next_fire_time  TEXT,               -- RFC 3339 UTC or NULL
            timeout_ms      INTEGER,            -- NULL means no hard timeout
            version         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL,
            created_by      TEXT,
            updated_by      TEXT
        ) STRICT;

        -- Startup scan: SELECT … WHERE status = 'enabled'
        CREATE INDEX IF NOT EXISTS idx_jobs_status_next ON jobs (status, next_fire_time);

        CREATE TABLE IF NOT EXISTS job_execution_records (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id        TEXT    NOT NULL,           -- jobs.id; history outlives removal
            instance_id   TEXT    NOT NULL UNIQUE,
            fire_time     TEXT    NOT NULL,
            start_time    TEXT,
            end_time      TEXT,
            outcome       TEXT,               -- NULL until finalized
            error_detail  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_records_job_fire
            ON job_execution_records (job_id, fire_time);
        ",
    )?;
    Ok(())
}

/// Canonical text form of an instant. Fixed width, so lexical order is time
/// order, and lossless: a stored `next_fire_time` compares equal to the
/// instant it was computed from.
pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn from_db_time(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

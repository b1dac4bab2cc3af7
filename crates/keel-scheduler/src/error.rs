use thiserror::Error;

/// Errors produced while parsing or evaluating a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// The cron field syntax could not be parsed.
    #[error("Invalid cron expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// No instant matches within the search horizon (e.g. `0 0 30 2 *`).
    #[error("Cron expression `{expression}` never fires within the search horizon")]
    Unsatisfiable { expression: String },

    /// A combined trigger needs at least one sub-trigger.
    #[error("Combined trigger has no sub-triggers")]
    EmptyCombined,
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Rejected at write time; nothing was persisted.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job's target reference has no handler in the task registry.
    #[error("Unknown target: {target}")]
    UnknownTarget { target: String },

    /// The worker pool and its wait queue are both full.
    #[error("Worker pool exhausted")]
    PoolExhausted,

    /// The job already runs `max_instances` instances.
    #[error("Job {id} reached its max_instances limit")]
    MaxInstancesReached { id: String },

    /// The job body returned an error, panicked or timed out.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lifecycle method was called in the wrong state.
    #[error("Invalid scheduler state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    #[error("Scheduler is not running")]
    NotRunning,
}

impl SchedulerError {
    /// Short error code string for the admin layer.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidTrigger(_) => "INVALID_TRIGGER",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            SchedulerError::PoolExhausted => "POOL_EXHAUSTED",
            SchedulerError::MaxInstancesReached { .. } => "MAX_INSTANCES_REACHED",
            SchedulerError::ExecutionFailure(_) => "EXECUTION_FAILURE",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::InvalidState { .. } => "INVALID_STATE",
            SchedulerError::NotRunning => "NOT_RUNNING",
        }
    }

    /// Store errors worth retrying with backoff (locked or unreachable database).
    pub fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode;
        match self {
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::OutOfMemory
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

use uuid::Uuid;

/// Error type a job's own future may return.
///
/// Job errors never cross the scheduler API; they are surfaced only through
/// the job's after-error hook and the tracing log.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Schedule parameters rejected at creation time. The job was never
    /// admitted to the registry.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Cron expression rejected at creation time.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    /// Scheduler builder parameters rejected at build time.
    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// A registry request did not complete within the configured request
    /// timeout. The request may or may not have been applied; re-query to
    /// confirm.
    #[error("scheduler request timed out")]
    RequestTimeout,

    /// The scheduler core task is gone (every handle was dropped).
    #[error("scheduler has shut down")]
    Shutdown,

    /// Stop exceeded the configured drain timeout. The still-running
    /// executions are abandoned; their completions are applied later if the
    /// job still exists.
    #[error("stop timed out with {0} execution(s) still running")]
    DrainTimeout(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

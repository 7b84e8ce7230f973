//! Distributed election gate.
//!
//! When several scheduler instances share the same job definitions, an
//! [`Elector`] decides which instance runs a given due instant. The check
//! happens on the execution task, so a slow election backend never stalls
//! the scheduler core.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::JobError;

/// Per-execution leadership check.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Return `true` to run the due instant on this instance, `false` to
    /// skip it. An error is treated as a skip and reported through the
    /// job's after-error hook.
    async fn elect(&self, job_id: Uuid) -> Result<bool, JobError>;
}

/// Always elects this instance. Used when no elector is configured.
pub struct NoopElector;

#[async_trait]
impl Elector for NoopElector {
    async fn elect(&self, _job_id: Uuid) -> Result<bool, JobError> {
        Ok(true)
    }
}

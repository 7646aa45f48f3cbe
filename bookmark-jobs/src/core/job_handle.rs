use crate::core::job::JobStatus;
use crate::core::Xid;
use async_trait::async_trait;
use bytes::Bytes;

use crate::core::store::QueueError;

/// A claimed job. Whoever holds the handle owns the job until one of the finalizing methods is
/// called. For an example implementation look at `bookmark_jobs_sqlite` crate.
#[async_trait]
pub trait JobHandle: Send + Sync {
    // Get job id
    fn id(&self) -> Xid;
    // Get Job type
    fn job_type(&self) -> &str;
    // Get job payload.
    fn payload(&self) -> Bytes;
    // How many times the job has been invoked, this claim included.
    fn attempts(&self) -> u32;
    // Retries allowed after the first attempt.
    fn max_retries(&self) -> u32;
    // Mark the job as completed successfully.
    async fn complete(mut self) -> Result<(), QueueError>;
    // Record a retryable failure. Returns `Pending` if the job will run again, `Failed` otherwise.
    async fn fail(mut self, error: &str) -> Result<JobStatus, QueueError>;
    // Move the job straight to `failed`, ignoring the remaining retry budget.
    async fn dead_queue(mut self, error: &str) -> Result<(), QueueError>;
}

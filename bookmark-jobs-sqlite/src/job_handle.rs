use crate::store::SqliteJobStore;
use async_trait::async_trait;
use bookmark_jobs::core::job::{Job, JobStatus, Outcome};
use bookmark_jobs::core::job_handle::JobHandle;
use bookmark_jobs::core::store::{JobStore, QueueError};
use bookmark_jobs::core::{Bytes, Xid};

/// A job claimed from `bj_jobs`. The row stays `running` until one of the finalizing methods
/// succeeds.
pub struct SqliteJobHandle {
    store: SqliteJobStore,
    job: Job,
}

#[async_trait]
impl JobHandle for SqliteJobHandle {
    fn id(&self) -> Xid {
        self.job.id
    }

    fn job_type(&self) -> &str {
        &self.job.job_type
    }

    fn payload(&self) -> Bytes {
        self.job.payload.clone()
    }

    fn attempts(&self) -> u32 {
        self.job.attempts
    }

    fn max_retries(&self) -> u32 {
        self.job.max_retries
    }

    async fn complete(mut self) -> Result<(), QueueError> {
        self.store.finalize(self.job.id, Outcome::Completed).await?;
        Ok(())
    }

    async fn fail(mut self, error: &str) -> Result<JobStatus, QueueError> {
        self.store
            .finalize(self.job.id, Outcome::retryable(error))
            .await
    }

    async fn dead_queue(mut self, error: &str) -> Result<(), QueueError> {
        let status = self.store.finalize(self.job.id, Outcome::fatal(error)).await?;
        tracing::debug!(jid = %self.job.id.to_string(), %status, "Job moved to failed");
        Ok(())
    }
}

impl SqliteJobHandle {
    pub(crate) fn new(job: Job, store: SqliteJobStore) -> Self {
        Self { store, job }
    }
}

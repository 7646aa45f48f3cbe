use crate::core::job::{Job, JobDescriptor, JobFilter, JobStatus, Outcome};
use crate::core::job_handle::JobHandle;
use crate::core::store::{JobStore, QueueError};
use crate::core::{new_xid, Xid};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};

/// A `JobStore` that lives in process memory. Same claim-once semantics as the relational
/// store, but only within one process and nothing survives a restart. Handy for tests and for
/// embedding the queue where durability doesn't matter.
#[derive(Clone, Debug, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Job>>, QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Persistence(anyhow::anyhow!("Lock is poisoned")))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    type JobHandle = MemoryJobHandle;

    async fn insert_batch(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<Xid>, QueueError> {
        for descriptor in &jobs {
            descriptor.validate()?;
        }
        let now = Utc::now();
        let mut inner = self.lock()?;
        let mut ids = Vec::with_capacity(jobs.len());
        for descriptor in jobs {
            let id = new_xid();
            inner.push(Job {
                id,
                job_type: descriptor.job_type,
                payload: descriptor.payload,
                status: JobStatus::Pending,
                attempts: 0,
                max_retries: descriptor.max_retries.unwrap_or(0),
                error: None,
                owner_id: descriptor.owner_id,
                created_at: now,
                updated_at: now,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn claim_batch(&self, limit: u32) -> Result<Vec<MemoryJobHandle>, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let claimed = inner
            .iter_mut()
            .filter(|job| job.status.can_transition_to(JobStatus::Running))
            .take(limit as usize)
            .map(|job| {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.updated_at = now;
                MemoryJobHandle {
                    store: self.clone(),
                    job: job.clone(),
                }
            })
            .collect();
        Ok(claimed)
    }

    async fn finalize(&self, jid: Xid, outcome: Outcome) -> Result<JobStatus, QueueError> {
        let mut inner = self.lock()?;
        let job = inner
            .iter_mut()
            .find(|job| job.id == jid)
            .ok_or(QueueError::JobNotFound(jid))?;
        let next = outcome.next_status(job.attempts, job.max_retries);
        if !job.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                jid,
                status: job.status,
            });
        }
        if let Outcome::Failed { error, .. } = outcome {
            job.error = Some(error);
        }
        job.status = next;
        job.updated_at = Utc::now();
        Ok(next)
    }

    async fn get(&self, jid: Xid) -> Result<Option<Job>, QueueError> {
        let inner = self.lock()?;
        Ok(inner.iter().find(|job| job.id == jid).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock()?;
        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(inner
            .iter()
            .filter(|job| filter.matches(job))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let inner = self.lock()?;
        Ok(inner
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .count() as u64)
    }
}

/// Handle to a job claimed from a [`MemoryJobStore`].
pub struct MemoryJobHandle {
    store: MemoryJobStore,
    job: Job,
}

#[async_trait]
impl JobHandle for MemoryJobHandle {
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
        self.store.finalize(self.job.id, Outcome::fatal(error)).await?;
        Ok(())
    }
}

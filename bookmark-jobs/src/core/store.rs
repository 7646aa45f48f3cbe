use async_trait::async_trait;
use thiserror::Error;

use crate::core::job::{Job, JobDescriptor, JobFilter, JobStatus, Outcome};
use crate::core::job_handle::JobHandle;
use crate::core::{Duration, Xid};

/// Durable record of job state. The store is the only source of truth: in-process guards only
/// avoid redundant polling, the store is what keeps two workers from running the same job.
///
/// ### Claim-once
///
/// `claim_batch` must be atomic with respect to concurrent callers, including callers in other
/// processes. A job returned by one call is never returned by another until it has been
/// finalized back to `pending`.
#[async_trait]
pub trait JobStore: Send + Sync {
    type JobHandle: JobHandle + 'static;

    /// Insert all jobs as `pending` with zero attempts, or none of them. Ids are returned in
    /// input order.
    async fn insert_batch(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<Xid>, QueueError>;

    /// Move up to `limit` pending jobs to `running`, counting an attempt for each.
    async fn claim_batch(&self, limit: u32) -> Result<Vec<Self::JobHandle>, QueueError>;

    /// Record the outcome of a running job. Returns the status the job ended up in.
    async fn finalize(&self, jid: Xid, outcome: Outcome) -> Result<JobStatus, QueueError>;

    async fn get(&self, jid: Xid) -> Result<Option<Job>, QueueError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError>;

    /// How many jobs are waiting to be claimed.
    async fn pending_count(&self) -> Result<u64, QueueError>;
}

/// Errors related to store operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// A descriptor was rejected before anything was written.
    #[error("Invalid job descriptor: {0}")]
    Validation(String),
    /// Encountered an error when tried to serialize payload.
    #[error("Failed to serialize job payload")]
    EncodeError {
        #[from]
        source: bincode::error::EncodeError,
    },
    /// Encountered an error when tried to deserialize payload.
    #[error("Failed to deserialize job payload")]
    DecodeError {
        #[from]
        source: bincode::error::DecodeError,
    },
    #[error("Interval must be greater than zero: {0:?}")]
    InvalidInterval(Duration),
    #[error("Job by that ID does not exist: {0}")]
    JobNotFound(Xid),
    #[error("Job {jid} is {status}, can't record an outcome for it")]
    InvalidTransition { jid: Xid, status: JobStatus },
    /// Storage failed to claim, insert or finalize.
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl QueueError {
    /// Producer-side errors: nothing has been persisted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::Validation(_) | QueueError::EncodeError { .. }
        )
    }
}

use crate::core::job_processor::JobProcessor;
use crate::core::store::QueueError;
use crate::core::{DateTime, Xid};
use bincode::{Decode, Encode};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Where a job is in its lifecycle.
///
/// Allowed transitions:
///
/// ```text
/// pending ──claim──▶ running ──success──▶ done
///    ▲                  │
///    └──retry scheduled─┤
///                       └──retries exhausted / non-retryable──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// `done` and `failed` jobs are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Done) | (Running, Pending) | (Running, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A persisted unit of work as seen by readers of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Xid,
    pub job_type: String,
    pub payload: Bytes,
    pub status: JobStatus,
    /// Handler invocations so far. Incremented when the job is claimed.
    pub attempts: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Last failure message.
    pub error: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Job {
    /// Decode the payload with the same bincode configuration the producers use.
    pub fn decode_payload<P: Decode>(&self) -> Result<P, QueueError> {
        let (payload, _) =
            bincode::decode_from_slice(self.payload.as_ref(), bincode::config::standard())?;
        Ok(payload)
    }
}

/// What a producer hands to the queue. Nothing is persisted until the whole batch validates.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub job_type: String,
    pub payload: Bytes,
    /// `None` means "use the registered handler's default".
    pub max_retries: Option<u32>,
    pub owner_id: Option<String>,
}

impl JobDescriptor {
    /// Descriptor with an already encoded payload.
    pub fn new(job_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            max_retries: None,
            owner_id: None,
        }
    }

    /// Descriptor for a typed job processor. Fails if the payload cannot be encoded.
    pub fn for_job<J>(payload: &J::Payload) -> Result<Self, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let payload = bincode::encode_to_vec(payload, bincode::config::standard())?;
        Ok(Self::new(J::name(), payload))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Checks that do not need to know which handlers exist.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::Validation("job type must not be blank".into()));
        }
        Ok(())
    }
}

/// Read-side filter for `JobStore::list`. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub owner_id: Option<String>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| s == job.status)
            && self.job_type.as_deref().map_or(true, |t| t == job.job_type)
            && self
                .owner_id
                .as_deref()
                .map_or(true, |o| job.owner_id.as_deref() == Some(o))
    }
}

/// Result of one handler invocation, as recorded by `JobStore::finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed { error: String, retryable: bool },
}

impl Outcome {
    pub fn retryable(error: impl Into<String>) -> Self {
        Outcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Outcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }

    /// Status a running job ends up in, given how many attempts it has used. A job gets
    /// `max_retries + 1` attempts in total.
    pub fn next_status(&self, attempts: u32, max_retries: u32) -> JobStatus {
        match self {
            Outcome::Completed => JobStatus::Done,
            Outcome::Failed {
                retryable: true, ..
            } if attempts <= max_retries => JobStatus::Pending,
            Outcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

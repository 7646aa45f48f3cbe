use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job::JobStatus;
use crate::core::job_handle::JobHandle;
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::store::QueueError;
use bincode::{self, Decode, Encode};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tracing::instrument;

/// Matches job type to job processor implementation.
/// This type requires that your jobs implement `Encode` + `Decode` from bincode trait. Those traits are re-exported in prelude.
///
/// Build it once at startup, then hand it to `JobRunner` / `JobService`. Both take ownership, so
/// registrations can't change while jobs are running.
///
/// ## Example
/// ```rust
/// use bookmark_jobs::prelude::{JobProcessor, HandlerRegistry, Encode, Decode, Xid};
/// use async_trait::async_trait;
/// struct MyJob;
/// #[derive(Encode, Decode)]
/// struct MyJobPayload(u8, String);
///
/// #[async_trait::async_trait]
/// impl JobProcessor for MyJob {
///     type Payload = MyJobPayload;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "my_job"
///     }
///
///     async fn handle(&self, jid: Xid, payload: Self::Payload) -> Result<(), Self::Error> {
///         // ..do work
///         Ok(())
///     }
/// }
///
/// let registry = {
///     let mut r = HandlerRegistry::default();
///     r.register(MyJob);
///     r
/// };
/// assert!(registry.contains("my_job"));
///```
#[derive(Default)]
pub struct HandlerRegistry {
    jobs: HashMap<&'static str, BoxedJobHandler>,
}

impl HandlerRegistry {
    /// Register a job handler. If job by that name already present, it will get replaced.
    pub fn register<J>(&mut self, job: J)
    where
        J: JobProcessor + 'static,
        J::Payload: Decode + Encode,
        J::Error: Into<JobError>,
    {
        let name = J::name();
        let boxed = WrappedJobHandler::new(job).boxed();
        if self.jobs.insert(name, boxed).is_some() {
            tracing::warn!(job_type = name, "Replacing already registered job handler");
        }
    }

    pub fn resolve(&self, job_type: &str) -> Result<&BoxedJobHandler, RunnerError> {
        self.jobs
            .get(job_type)
            .ok_or_else(|| RunnerError::UnknownJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs.contains_key(job_type)
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.jobs.keys().copied().collect()
    }

    /// Retry budget the handler asks for when the producer didn't set one.
    pub fn default_max_retries(&self, job_type: &str) -> Option<u32> {
        self.jobs.get(job_type).map(|h| h.max_retries())
    }

    /// Process a claimed job handle: run its handler once and record the outcome. Returns the
    /// status the job ended up in.
    ///
    /// Handler failures never surface as `Err`, they are written to the job. An unknown job type
    /// is a configuration problem, so the job fails right away without using its retry budget.
    /// `Err` means the outcome could not be recorded and the job is still `running`.
    #[instrument(skip_all, err, fields(job_type = %job_handle.job_type(), jid = %job_handle.id().to_string(), attempts = job_handle.attempts()))]
    pub async fn process<H: JobHandle>(&self, job_handle: H) -> Result<JobStatus, RunnerError> {
        let handler = match self.resolve(job_handle.job_type()) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!("{}", e);
                job_handle.dead_queue(&e.to_string()).await?;
                return Ok(JobStatus::Failed);
            }
        };

        let result = AssertUnwindSafe(handler.handle(job_handle.id(), job_handle.payload()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic))));

        match result {
            Ok(_) => {
                job_handle.complete().await?;
                Ok(JobStatus::Done)
            }
            Err(e) if e.is_retryable() => {
                tracing::error!("Error during job processing: {}", e);
                let status = job_handle.fail(&e.to_string()).await?;
                if status == JobStatus::Failed {
                    tracing::warn!("Retries exhausted, job failed");
                }
                Ok(status)
            }
            Err(e) => {
                tracing::error!("Non-retryable error during job processing: {}", e);
                job_handle.dead_queue(&e.to_string()).await?;
                Ok(JobStatus::Failed)
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Errors returned by the registry.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("No handler registered for job type: {0}")]
    UnknownJobType(String),
    #[error(transparent)]
    QueueError(#[from] QueueError),
}

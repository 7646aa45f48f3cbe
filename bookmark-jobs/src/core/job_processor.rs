use crate::core::Xid;
use async_trait::async_trait;
use std::convert::Infallible;
use thiserror::Error;

/// A job-handler interface. Your Payload should implement `bincode::{Decode, Encode}` if you're
/// planning to use it with the registry and stores from this crate.
///
/// Handlers must be idempotent: the same job can be invoked again after a retryable failure or
/// after a crash between running the handler and recording the outcome. Write results with
/// upserts, never appends.
///
/// Any retrying a handler does internally (e.g. backing off on a flaky HTTP request) is its own
/// business; the queue only counts invocations of `handle`.
///
/// ## Example
/// ```rust
/// use bookmark_jobs::prelude::{JobProcessor, Encode, Decode, Xid};
/// use async_trait::async_trait;
/// struct MyJob;
///
/// impl MyJob {
///     async fn do_work(&self) -> anyhow::Result<()> {
///         // ..do some work
///         Ok(())
///     }
/// }
///
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
///         self.do_work().await
///     }
/// }
/// ```
/// ## Services
/// If your job processor requires external services (i.e. database client, REST client, etc.), add
/// them directly as your struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// What is the input to this handler. If you want to use `HandlerRegistry`, then this must implement `bincode::Decode` and `bincode::Encode`.
    type Payload: Send;
    /// What error is returned
    type Error: Send;
    /// Run the job, passing payload to it.
    async fn handle(&self, jid: Xid, payload: Self::Payload) -> Result<(), Self::Error>;

    /// How many times job should be retried when the producer did not say otherwise.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Job type, used to differentiate between different jobs in the queue.
    fn name() -> &'static str
    where
        Self: Sized;
}

/// Error types returned by job processor that wraps your job processor.
///
/// Plain `anyhow::Error`s are treated as transient. Use [`JobError::fatal`] for input that will
/// never succeed.
#[derive(Error, Debug)]
pub enum JobError {
    /// Encountered an error when tried to deserialize payload. Retrying won't help.
    #[error("Failed to deserialize job payload")]
    DecodeError {
        #[from]
        source: bincode::error::DecodeError,
    },

    /// Non-retryable failure reported by the handler.
    #[error("{0}")]
    Fatal(anyhow::Error),

    /// The handler panicked.
    #[error("Job handler panicked: {0}")]
    Panicked(String),

    /// Error originated in inner-job implementation
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),
}

impl JobError {
    pub fn fatal<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        JobError::Fatal(error.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_) | JobError::Panicked(_))
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        assert!(JobError::from(anyhow::anyhow!("timeout")).is_retryable());
        assert!(JobError::Panicked("boom".into()).is_retryable());
        assert!(!JobError::fatal(anyhow::anyhow!("malformed url")).is_retryable());
        assert_eq!(
            "malformed url",
            JobError::fatal(anyhow::anyhow!("malformed url")).to_string()
        );
    }
}

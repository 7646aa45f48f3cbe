use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::Xid;
use async_trait::async_trait;
use bincode::{config::Configuration, Decode, Encode};
use bytes::Bytes;
use tracing::instrument;

/// What the registry stores per job type: a handler that takes the raw payload bytes of a
/// claimed job.
pub type BoxedJobHandler = Box<dyn JobProcessor<Payload = Bytes, Error = JobError>>;

/// Adapts a typed [`JobProcessor`] to [`BoxedJobHandler`].
///
/// The stored bytes are decoded with the same bincode configuration `JobDescriptor::for_job`
/// encodes with. Bytes that don't decode into `J::Payload` give `JobError::DecodeError`, which is
/// not retryable: the registry moves such a job straight to `failed`, because the same bytes
/// will fail the same way on every attempt. Errors from the typed handler keep the
/// classification the handler gave them.
///
/// `HandlerRegistry::register` does the wrapping; there is rarely a reason to build one by hand.
pub struct WrappedJobHandler<J: JobProcessor> {
    handler: J,
    config: Configuration,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: Decode + Encode,
    J::Error: Into<JobError>,
{
    pub fn new(handler: J) -> Self {
        Self {
            handler,
            config: bincode::config::standard(),
        }
    }

    pub fn boxed(self) -> BoxedJobHandler {
        Box::new(self)
    }

    fn decode(&self, bytes: &[u8]) -> Result<J::Payload, JobError> {
        let (payload, read) = bincode::decode_from_slice(bytes, self.config)?;
        if read < bytes.len() {
            tracing::warn!(read, len = bytes.len(), "Ignoring trailing payload bytes");
        }
        Ok(payload)
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: Decode + Encode,
    J::Error: Into<JobError>,
{
    type Payload = Bytes;
    type Error = JobError;

    #[instrument(skip_all, err, fields(jid = %jid.to_string(), job_type = %Self::name()))]
    async fn handle(&self, jid: Xid, payload: Bytes) -> Result<(), JobError> {
        let payload = self.decode(payload.as_ref())?;
        self.handler.handle(jid, payload).await.map_err(Into::into)
    }

    fn max_retries(&self) -> u32 {
        self.handler.max_retries()
    }

    fn name() -> &'static str {
        J::name()
    }
}

impl<J> From<J> for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: Decode + Encode,
    J::Error: Into<JobError>,
{
    fn from(handler: J) -> Self {
        Self::new(handler)
    }
}

//! Producer-facing API: validate and persist jobs, look them up afterwards.
use crate::core::job::{Job, JobDescriptor, JobFilter};
use crate::core::job_processor::JobProcessor;
use crate::core::store::{JobStore, QueueError};
use crate::core::Xid;
use crate::registry::handler_registry::HandlerRegistry;
use bincode::Encode;
use std::sync::Arc;
use tracing::instrument;

pub struct JobService<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
}

impl<S: JobStore> Clone for JobService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: JobStore> JobService<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Persist a batch of jobs. Every descriptor is checked before anything is written, so either
    /// all jobs are created or none. Ids come back in input order.
    #[instrument(skip_all, err, fields(count = jobs.len()))]
    pub async fn enqueue_batch(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<Xid>, QueueError> {
        let jobs = jobs
            .into_iter()
            .enumerate()
            .map(|(i, descriptor)| self.prepare(descriptor).map_err(|e| at_index(i, e)))
            .collect::<Result<Vec<_>, _>>()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.store.insert_batch(jobs).await
    }

    pub async fn enqueue(&self, job: JobDescriptor) -> Result<Xid, QueueError> {
        let mut ids = self.enqueue_batch(vec![job]).await?;
        ids.pop()
            .ok_or_else(|| QueueError::Persistence(anyhow::anyhow!("Store returned no id")))
    }

    /// Enqueue a typed job for the given owner, using the handler's default retry budget.
    pub async fn enqueue_job<J>(
        &self,
        payload: &J::Payload,
        owner_id: Option<&str>,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let mut descriptor = JobDescriptor::for_job::<J>(payload)?;
        descriptor.owner_id = owner_id.map(str::to_string);
        self.enqueue(descriptor).await
    }

    pub async fn get(&self, jid: Xid) -> Result<Option<Job>, QueueError> {
        self.store.get(jid).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.store.list(filter).await
    }

    fn prepare(&self, mut descriptor: JobDescriptor) -> Result<JobDescriptor, QueueError> {
        descriptor.validate()?;
        let default_retries = self
            .registry
            .default_max_retries(&descriptor.job_type)
            .ok_or_else(|| {
                QueueError::Validation(format!(
                    "no handler registered for job type '{}'",
                    descriptor.job_type
                ))
            })?;
        descriptor.max_retries.get_or_insert(default_retries);
        Ok(descriptor)
    }
}

fn at_index(index: usize, error: QueueError) -> QueueError {
    match error {
        QueueError::Validation(reason) => QueueError::Validation(format!("job #{index}: {reason}")),
        other => other,
    }
}

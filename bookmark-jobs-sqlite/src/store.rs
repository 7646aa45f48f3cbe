use crate::job_handle::SqliteJobHandle;
use crate::types::JobRow;
use anyhow::Context;
use async_trait::async_trait;
use bookmark_jobs::core::job::{Job, JobDescriptor, JobFilter, JobStatus, Outcome};
use bookmark_jobs::core::store::{JobStore, QueueError};
use bookmark_jobs::core::{new_xid, Utc, Xid};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

/// An implementation of the JobStore backed by SQLite
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    type JobHandle = SqliteJobHandle;

    #[instrument(skip_all, err, fields(count = jobs.len()))]
    async fn insert_batch(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<Xid>, QueueError> {
        for descriptor in &jobs {
            descriptor.validate()?;
        }
        let now = Utc::now();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction")?;
        for descriptor in jobs {
            let jid = new_xid();
            sqlx::query(
                "INSERT INTO bj_jobs (jid, job_type, payload, max_retries, owner_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            )
            .bind(jid.to_string())
            .bind(&descriptor.job_type)
            .bind(descriptor.payload.as_ref())
            .bind(i64::from(descriptor.max_retries.unwrap_or(0)))
            .bind(&descriptor.owner_id)
            .bind(now)
            .execute(&mut tx)
            .await
            .context("Failed to add job to the queue")?;
            ids.push(jid);
        }
        tx.commit()
            .await
            .context("Failed to commit job batch")?;
        Ok(ids)
    }

    #[instrument(skip_all, err, fields(limit = limit))]
    async fn claim_batch(&self, limit: u32) -> Result<Vec<SqliteJobHandle>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut rows = sqlx::query_as::<_, JobRow>(
            "UPDATE bj_jobs SET status = 'running', attempts = attempts + 1, updated_at = ?1 \
             WHERE status = 'pending' AND jid IN \
             (SELECT jid FROM bj_jobs WHERE status = 'pending' ORDER BY seq LIMIT ?2) \
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to check out jobs from the queue")?;

        // RETURNING doesn't promise any order.
        rows.sort_by_key(|row| row.seq);
        Ok(rows
            .into_iter()
            .map(|row| SqliteJobHandle::new(row.into(), self.clone()))
            .collect())
    }

    #[instrument(skip_all, err, fields(jid = %jid.to_string()))]
    async fn finalize(&self, jid: Xid, outcome: Outcome) -> Result<JobStatus, QueueError> {
        let jid_string = jid.to_string();
        let (completed, retryable, error) = match outcome {
            Outcome::Completed => (true, false, None),
            Outcome::Failed { error, retryable } => (false, retryable, Some(error)),
        };
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE bj_jobs SET \
             status = CASE \
                 WHEN ?1 THEN 'done' \
                 WHEN ?2 AND attempts < max_retries + 1 THEN 'pending' \
                 ELSE 'failed' END, \
             error = COALESCE(?3, error), \
             updated_at = ?4 \
             WHERE jid = ?5 AND status = 'running' \
             RETURNING status",
        )
        .bind(completed)
        .bind(retryable)
        .bind(error)
        .bind(Utc::now())
        .bind(&jid_string)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record job outcome")?;

        match status {
            Some(status) => parse_status(&status),
            None => match self.get(jid).await? {
                Some(job) => Err(QueueError::InvalidTransition {
                    jid,
                    status: job.status,
                }),
                None => Err(QueueError::JobNotFound(jid)),
            },
        }
    }

    #[instrument(skip_all, err, fields(jid = %jid.to_string()))]
    async fn get(&self, jid: Xid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM bj_jobs WHERE jid = ?1")
            .bind(jid.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load job")?;
        Ok(row.map(Job::from))
    }

    #[instrument(skip_all, err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM bj_jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(job_type) = &filter.job_type {
            builder.push(" AND job_type = ");
            builder.push_bind(job_type.clone());
        }
        if let Some(owner_id) = &filter.owner_id {
            builder.push(" AND owner_id = ");
            builder.push_bind(owner_id.clone());
        }
        builder.push(" ORDER BY seq");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(limit));
        }
        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list jobs")?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bj_jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .context("Failed to count pending jobs")?;
        Ok(count as u64)
    }
}

fn parse_status(status: &str) -> Result<JobStatus, QueueError> {
    JobStatus::from_str(status)
        .context("Unexpected status in bj_jobs")
        .map_err(QueueError::from)
}

use bookmark_jobs::core::job::{Job, JobStatus};
use bookmark_jobs::core::{Bytes, DateTime, Xid};
use sqlx::sqlite::SqliteRow;
use sqlx::{Error, FromRow, Row};
use std::str::FromStr;

#[derive(Debug)]
pub(crate) struct JobRow {
    pub seq: i64,
    pub job: Job,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, Error> {
        let seq = row.try_get("seq")?;
        let id = row
            .try_get("jid")
            .map(Xid::from_str)?
            .map_err(|xid_err| Error::Decode(Box::new(xid_err)))?;
        let status = row
            .try_get("status")
            .map(JobStatus::from_str)?
            .map_err(|status_err| Error::Decode(Box::new(status_err)))?;
        let payload = row.try_get::<Vec<u8>, _>("payload").map(Bytes::from)?;
        let created_at: DateTime = row.try_get("created_at")?;
        let updated_at: DateTime = row.try_get("updated_at")?;
        Ok(Self {
            seq,
            job: Job {
                id,
                job_type: row.try_get("job_type")?,
                payload,
                status,
                attempts: row.try_get("attempts")?,
                max_retries: row.try_get("max_retries")?,
                error: row.try_get("error")?,
                owner_id: row.try_get("owner_id")?,
                created_at,
                updated_at,
            },
        })
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        row.job
    }
}

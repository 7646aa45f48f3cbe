#![doc = include_str!("../README.md")]

pub mod job_handle;
pub mod store;
mod types;

pub use store::SqliteJobStore;
use anyhow::Context;
use bookmark_jobs::core::store::QueueError;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub static MIGRATOR: Migrator = sqlx::migrate!();

pub const DATABASE_URL_VAR: &str = "BOOKMARK_JOBS_DATABASE_URL";

/// Open (creating if needed) a database in WAL mode and bring its schema up to date. WAL plus a
/// busy timeout lets several processes share one queue file.
pub async fn connect(url: &str) -> Result<SqlitePool, QueueError> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url: {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .context("Failed to open job database")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run job database migrations")?;
    Ok(pool)
}

#[cfg(test)]
mod drain_test;

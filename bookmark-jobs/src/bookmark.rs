//! The `fetch-bookmark-metadata` job: fetch a bookmarked page's title, description and favicon,
//! then store them on the bookmark.
//!
//! Fetching and persisting are collaborators supplied by the application. Network-level retries
//! belong to the fetcher (see [`RetryingFetcher`]); they never show up in the job's `attempts`.
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::Xid;
use async_trait::async_trait;
use bincode::{Decode, Encode};
use std::time::Duration;
use thiserror::Error;

pub const FETCH_BOOKMARK_METADATA: &str = "fetch-bookmark-metadata";

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct FetchMetadataPayload {
    pub url: String,
    pub bookmark_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebsiteMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub favicon_url: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx. Worth trying again later.
    #[error("Transient fetch failure: {0}")]
    Transient(String),
    /// 404, unparsable page, unsupported content. Will never succeed.
    #[error("Permanent fetch failure: {0}")]
    Permanent(String),
}

impl From<FetchError> for JobError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Transient(_) => JobError::Retryable(e.into()),
            FetchError::Permanent(_) => JobError::fatal(e),
        }
    }
}

#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<WebsiteMetadata, FetchError>;
}

/// Writes fetched metadata onto a bookmark. Must be an upsert: the same job may run more than
/// once.
#[async_trait]
pub trait BookmarkUpdater: Send + Sync {
    async fn upsert_metadata(
        &self,
        bookmark_id: &str,
        user_id: &str,
        metadata: WebsiteMetadata,
    ) -> anyhow::Result<()>;
}

pub struct FetchBookmarkMetadata<F, U> {
    fetcher: F,
    updater: U,
    max_retries: u32,
}

impl<F, U> FetchBookmarkMetadata<F, U>
where
    F: MetadataFetcher,
    U: BookmarkUpdater,
{
    pub fn new(fetcher: F, updater: U) -> Self {
        Self {
            fetcher,
            updater,
            max_retries: 2,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl<F, U> JobProcessor for FetchBookmarkMetadata<F, U>
where
    F: MetadataFetcher,
    U: BookmarkUpdater,
{
    type Payload = FetchMetadataPayload;
    type Error = JobError;

    async fn handle(&self, _jid: Xid, payload: Self::Payload) -> Result<(), Self::Error> {
        if !(payload.url.starts_with("http://") || payload.url.starts_with("https://")) {
            return Err(JobError::fatal(anyhow::anyhow!(
                "Not an http(s) url: {:?}",
                payload.url
            )));
        }
        let metadata = self.fetcher.fetch(&payload.url).await?;
        self.updater
            .upsert_metadata(&payload.bookmark_id, &payload.user_id, metadata)
            .await?;
        Ok(())
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn name() -> &'static str {
        FETCH_BOOKMARK_METADATA
    }
}

/// Wraps a fetcher with its own backoff loop for transient failures. This is the handler-level
/// retry: all of it happens inside a single job attempt.
pub struct RetryingFetcher<F> {
    inner: F,
    tries: u32,
    base_delay: Duration,
}

impl<F: MetadataFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, tries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            tries: tries.max(1),
            base_delay,
        }
    }
}

#[async_trait]
impl<F: MetadataFetcher> MetadataFetcher for RetryingFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<WebsiteMetadata, FetchError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match self.inner.fetch(url).await {
                Err(FetchError::Transient(reason)) if attempt < self.tries => {
                    tracing::debug!(url, attempt, %reason, "Transient fetch failure, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

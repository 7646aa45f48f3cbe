use crate::store::SqliteJobStore;
use crate::test::{make_pool, setup_logger};
use async_trait::async_trait;
use bookmark_jobs::bookmark::{
    BookmarkUpdater, FetchBookmarkMetadata, FetchError, FetchMetadataPayload, MetadataFetcher,
    WebsiteMetadata, FETCH_BOOKMARK_METADATA,
};
use bookmark_jobs::core::job::{JobDescriptor, JobFilter, JobStatus};
use bookmark_jobs::core::job_processor::JobProcessor;
use bookmark_jobs::core::store::JobStore;
use bookmark_jobs::core::{new_xid, Xid};
use bookmark_jobs::prelude::{HandlerRegistry, JobRunner, JobService, RunnerConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct Bookmarks {
    rows: Arc<Mutex<HashMap<String, WebsiteMetadata>>>,
    writes: Arc<AtomicU32>,
    /// Report an error after writing, this many times.
    fail_after_write: Arc<AtomicU32>,
}

impl Bookmarks {
    fn snapshot(&self) -> HashMap<String, WebsiteMetadata> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl BookmarkUpdater for Bookmarks {
    async fn upsert_metadata(
        &self,
        bookmark_id: &str,
        _user_id: &str,
        metadata: WebsiteMetadata,
    ) -> anyhow::Result<()> {
        self.rows
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock is poisoned"))?
            .insert(bookmark_id.to_string(), metadata);
        self.writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_after_write.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_after_write.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset after write");
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Upstream {
    Up,
    Flaky,
    Gone,
}

/// Stand-in for the network. Tracks how many fetches run at once.
#[derive(Clone)]
struct FakeWeb {
    upstream: Upstream,
    latency: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeWeb {
    fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            latency: Duration::from_millis(5),
            active: Default::default(),
            peak: Default::default(),
            calls: Default::default(),
        }
    }
}

#[async_trait]
impl MetadataFetcher for FakeWeb {
    async fn fetch(&self, url: &str) -> Result<WebsiteMetadata, FetchError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        tokio::time::sleep(self.latency).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        match self.upstream {
            Upstream::Up => Ok(WebsiteMetadata {
                title: Some(format!("Title of {url}")),
                description: Some("A page".to_string()),
                favicon_url: Some(format!("{url}/favicon.ico")),
            }),
            Upstream::Flaky => Err(FetchError::Transient("timed out".to_string())),
            Upstream::Gone => Err(FetchError::Permanent("404".to_string())),
        }
    }
}

fn fetch_job(n: usize, max_retries: u32) -> JobDescriptor {
    let payload = FetchMetadataPayload {
        url: format!("https://example.com/{n}"),
        bookmark_id: format!("b{n}"),
        user_id: "u1".to_string(),
    };
    JobDescriptor::for_job::<FetchBookmarkMetadata<FakeWeb, Bookmarks>>(&payload)
        .unwrap()
        .with_max_retries(max_retries)
        .with_owner("u1")
}

fn runner_with(
    store: SqliteJobStore,
    web: FakeWeb,
    bookmarks: Bookmarks,
    config: RunnerConfig,
) -> JobRunner<SqliteJobStore> {
    let mut registry = HandlerRegistry::default();
    registry.register(FetchBookmarkMetadata::new(web, bookmarks));
    JobRunner::new(store, registry, config)
}

async fn job(runner: &JobRunner<SqliteJobStore>, jid: Xid) -> bookmark_jobs::core::job::Job {
    runner.store().get(jid).await.unwrap().unwrap()
}

#[tokio::test]
async fn failing_fetch_with_no_retries_fails_after_one_cycle() {
    setup_logger();
    let store = SqliteJobStore::with_pool(make_pool().await);
    let runner = runner_with(
        store,
        FakeWeb::new(Upstream::Flaky),
        Bookmarks::default(),
        RunnerConfig::default(),
    );
    let payload = FetchMetadataPayload {
        url: "https://example.com".to_string(),
        bookmark_id: "b1".to_string(),
        user_id: "u1".to_string(),
    };
    let descriptor = JobDescriptor::for_job::<FetchBookmarkMetadata<FakeWeb, Bookmarks>>(&payload)
        .unwrap()
        .with_max_retries(0);
    assert_eq!(FETCH_BOOKMARK_METADATA, descriptor.job_type);
    let ids = runner.store().insert_batch(vec![descriptor]).await.unwrap();

    let cycle = runner.drain_cycle().await.unwrap().unwrap();
    assert_eq!(1, cycle.failed);

    let job = job(&runner, ids[0]).await;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(1, job.attempts);
    assert!(job.error.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_jobs_two_workers() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let web = FakeWeb::new(Upstream::Up);
    let bookmarks = Bookmarks::default();
    let runner = runner_with(store, web.clone(), bookmarks.clone(), RunnerConfig::new(3, 2));
    let ids = runner
        .store()
        .insert_batch((0..10).map(|n| fetch_job(n, 0)).collect())
        .await
        .unwrap();

    let summary = runner.ensure_running().unwrap().await.unwrap();
    assert_eq!(10, summary.completed);
    assert_eq!(4, summary.cycles);
    assert!(web.peak.load(Ordering::SeqCst) <= 2);

    for jid in ids {
        assert_eq!(JobStatus::Done, job(&runner, jid).await.status);
    }
    let rows = bookmarks.snapshot();
    assert_eq!(10, rows.len());
    assert_eq!(
        Some("Title of https://example.com/7"),
        rows["b7"].title.as_deref()
    );
}

#[tokio::test]
async fn retryable_failure_exhausts_budget() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let web = FakeWeb::new(Upstream::Flaky);
    let runner = runner_with(store, web.clone(), Bookmarks::default(), RunnerConfig::default());
    let ids = runner
        .store()
        .insert_batch(vec![fetch_job(1, 2)])
        .await
        .unwrap();

    runner.drain().await;
    let job = job(&runner, ids[0]).await;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(3, job.attempts);
    assert_eq!(3, web.calls.lock().unwrap()["https://example.com/1"]);
}

#[tokio::test]
async fn handler_internal_retries_are_not_job_attempts() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let web = FakeWeb::new(Upstream::Flaky);
    let mut registry = HandlerRegistry::default();
    registry.register(FetchBookmarkMetadata::new(
        bookmark_jobs::bookmark::RetryingFetcher::new(web.clone(), 4, Duration::from_millis(1)),
        Bookmarks::default(),
    ));
    let runner = JobRunner::new(store, registry, RunnerConfig::default());
    let ids = runner
        .store()
        .insert_batch(vec![fetch_job(1, 1)])
        .await
        .unwrap();

    runner.drain().await;
    let job = job(&runner, ids[0]).await;
    assert_eq!(JobStatus::Failed, job.status);
    // Two invocations, four fetches each.
    assert_eq!(2, job.attempts);
    assert_eq!(8, web.calls.lock().unwrap()["https://example.com/1"]);
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let runner = runner_with(
        store,
        FakeWeb::new(Upstream::Gone),
        Bookmarks::default(),
        RunnerConfig::default(),
    );
    let ids = runner
        .store()
        .insert_batch(vec![fetch_job(1, 5)])
        .await
        .unwrap();

    let summary = runner.drain().await;
    assert_eq!(1, summary.failed);
    let job = job(&runner, ids[0]).await;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(1, job.attempts);
}

#[tokio::test]
async fn unknown_job_type_fails_immediately() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let runner = runner_with(
        store,
        FakeWeb::new(Upstream::Up),
        Bookmarks::default(),
        RunnerConfig::default(),
    );
    let ids = runner
        .store()
        .insert_batch(vec![
            JobDescriptor::new("fetch-favicon", vec![]).with_max_retries(3),
            fetch_job(1, 0),
        ])
        .await
        .unwrap();

    let summary = runner.drain().await;
    assert_eq!(1, summary.failed);
    assert_eq!(1, summary.completed);
    let job = job(&runner, ids[0]).await;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(1, job.attempts);
    assert!(job.error.unwrap().contains("fetch-favicon"));
}

#[tokio::test]
async fn rerunning_the_handler_leaves_the_same_state() {
    let web = FakeWeb::new(Upstream::Up);
    let payload = FetchMetadataPayload {
        url: "https://example.com".to_string(),
        bookmark_id: "b1".to_string(),
        user_id: "u1".to_string(),
    };

    let once = Bookmarks::default();
    let handler = FetchBookmarkMetadata::new(web.clone(), once.clone());
    handler.handle(new_xid(), payload.clone()).await.unwrap();

    let twice = Bookmarks::default();
    let handler = FetchBookmarkMetadata::new(web.clone(), twice.clone());
    handler.handle(new_xid(), payload.clone()).await.unwrap();
    handler.handle(new_xid(), payload).await.unwrap();

    assert_eq!(once.snapshot(), twice.snapshot());
}

#[tokio::test]
async fn retry_after_partial_success_is_harmless() {
    let store = SqliteJobStore::with_pool(make_pool().await);
    let bookmarks = Bookmarks::default();
    bookmarks.fail_after_write.store(1, Ordering::SeqCst);
    let runner = runner_with(
        store,
        FakeWeb::new(Upstream::Up),
        bookmarks.clone(),
        RunnerConfig::default(),
    );
    let ids = runner
        .store()
        .insert_batch(vec![fetch_job(1, 1)])
        .await
        .unwrap();

    let summary = runner.drain().await;
    assert_eq!(1, summary.retried);
    assert_eq!(1, summary.completed);
    assert_eq!(2, job(&runner, ids[0]).await.attempts);
    assert_eq!(2, bookmarks.writes.load(Ordering::SeqCst));
    assert_eq!(1, bookmarks.snapshot().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_and_concurrent_triggers() {
    setup_logger();
    let store = Arc::new(SqliteJobStore::with_pool(make_pool().await));
    let web = FakeWeb::new(Upstream::Up);
    let registry = {
        let mut r = HandlerRegistry::default();
        r.register(FetchBookmarkMetadata::new(web.clone(), Bookmarks::default()));
        Arc::new(r)
    };
    let service = JobService::new(store.clone(), registry.clone());
    let runner = JobRunner::with_shared(store, registry, RunnerConfig::new(4, 3));

    let ids = service
        .enqueue_batch((0..30).map(|n| fetch_job(n, 0)).collect())
        .await
        .unwrap();
    assert_eq!(30, ids.len());

    let triggers: Vec<_> = (0..12)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.ensure_running() })
        })
        .collect();
    let mut completed = 0;
    for trigger in triggers {
        if let Some(drain) = trigger.await.unwrap() {
            completed += drain.await.unwrap().completed;
        }
    }
    assert_eq!(30, completed);

    let calls = web.calls.lock().unwrap().clone();
    assert_eq!(30, calls.len());
    assert!(calls.values().all(|&n| n == 1));

    let done = service
        .list(&JobFilter::default().owner("u1").status(JobStatus::Done))
        .await
        .unwrap();
    assert_eq!(30, done.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_processes_share_one_database() {
    setup_logger();
    let path = std::env::temp_dir().join(format!("bookmark-jobs-{}.db", new_xid()));
    let url = format!("sqlite://{}", path.display());
    let web = FakeWeb::new(Upstream::Up);

    // Separate pools stand in for separate processes.
    let first = runner_with(
        SqliteJobStore::with_pool(crate::connect(&url).await.unwrap()),
        web.clone(),
        Bookmarks::default(),
        RunnerConfig::new(3, 2),
    );
    let second = runner_with(
        SqliteJobStore::with_pool(crate::connect(&url).await.unwrap()),
        web.clone(),
        Bookmarks::default(),
        RunnerConfig::new(3, 2),
    );
    first
        .store()
        .insert_batch((0..24).map(|n| fetch_job(n, 0)).collect())
        .await
        .unwrap();

    let a = first.ensure_running().unwrap();
    let b = second.ensure_running().unwrap();
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(24, a.completed + b.completed);

    let calls = web.calls.lock().unwrap().clone();
    assert_eq!(24, calls.len());
    assert!(calls.values().all(|&n| n == 1));

    first.store().pool().close().await;
    second.store().pool().close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

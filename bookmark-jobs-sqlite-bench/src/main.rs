use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bincode::{Decode, Encode};
use bookmark_jobs::core::job::{JobDescriptor, JobFilter, JobStatus};
use bookmark_jobs::core::job_processor::{JobError, JobProcessor};
use bookmark_jobs::core::{Utc, Xid};
use bookmark_jobs::prelude::{HandlerRegistry, JobRunner, JobService, RunnerConfig};
use bookmark_jobs_sqlite::{SqliteJobStore, DATABASE_URL_VAR};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::filter::LevelFilter;

const ENQUEUE_CHUNK: usize = 100;

struct JobResult {
    pub duration_millis: i64,
    pub jid: Xid,
}

#[derive(Decode, Encode)]
struct BenchJobPayload {
    pub started_at_millis: i64,
    pub url: String,
}

struct BenchJob {
    tx: UnboundedSender<JobResult>,
    count: Arc<AtomicUsize>,
    latency: std::time::Duration,
}

#[async_trait]
impl JobProcessor for BenchJob {
    type Payload = BenchJobPayload;
    type Error = JobError;

    async fn handle(&self, jid: Xid, payload: Self::Payload) -> Result<(), Self::Error> {
        let _count = self.count.fetch_add(1, Ordering::SeqCst);
        // Pretend to fetch the page.
        tokio::time::sleep(self.latency).await;
        let duration_millis = Utc::now().timestamp_millis() - payload.started_at_millis;
        self.tx
            .unbounded_send(JobResult {
                duration_millis,
                jid,
            })
            .map_err(|_| anyhow!("Failed to send results for {}", payload.url))?;
        Ok(())
    }

    fn name() -> &'static str
    where
        Self: Sized,
    {
        "bench_job"
    }
}

fn arg<T: FromStr>(n: usize, default: T) -> anyhow::Result<T> {
    match std::env::args().nth(n) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("Argument #{} is not a valid number: {}", n, raw)),
        None => Ok(default),
    }
}

async fn open_store() -> anyhow::Result<SqliteJobStore> {
    let url = std::env::var(DATABASE_URL_VAR).unwrap_or_else(|_| {
        let file = format!("bookmark-jobs-bench-{}.db", bookmark_jobs::core::new_xid());
        let path = std::env::temp_dir().join(file);
        format!("sqlite://{}", path.display())
    });
    println!("Database: {}", url);
    let pool = bookmark_jobs_sqlite::connect(&url).await?;
    Ok(SqliteJobStore::with_pool(pool))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::WARN)
        .init();

    let count: usize = arg(1, 10_000)?;
    let latency_millis: u64 = arg(2, 5)?;
    if count == 0 {
        return Err(anyhow!("Nothing to do with zero jobs"));
    }
    let config = RunnerConfig::from_env();
    println!(
        "Jobs: {}, batch size: {}, max workers: {}",
        count, config.batch_size, config.max_workers
    );

    let (tx, rx) = unbounded::<JobResult>();
    let store = Arc::new(open_store().await?);

    let processed = Arc::new(AtomicUsize::new(0));
    let registry = {
        let mut r = HandlerRegistry::default();
        r.register(BenchJob {
            tx,
            count: processed.clone(),
            latency: std::time::Duration::from_millis(latency_millis),
        });
        Arc::new(r)
    };
    let service = JobService::new(store.clone(), registry.clone());
    let runner = JobRunner::with_shared(store, registry, config);

    let started = Instant::now();
    // Enqueue like an import would: a chunk at a time, poking the runner after each.
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(ENQUEUE_CHUNK);
        let jobs = (0..chunk)
            .map(|i| {
                JobDescriptor::for_job::<BenchJob>(&BenchJobPayload {
                    started_at_millis: Utc::now().timestamp_millis(),
                    url: format!("https://example.com/{}", count - remaining + i),
                })
                .map(|d| d.with_max_retries(0).with_owner("bench"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        service
            .enqueue_batch(jobs)
            .await
            .context("Failed to enqueue jobs")?;
        runner.ensure_running();
        remaining -= chunk;
    }

    let mut results = rx.take(count).collect::<Vec<JobResult>>().await;
    if results.len() < count {
        return Err(anyhow!("Only {} of {} jobs reported back", results.len(), count));
    }

    let seen_ids = { results.iter().map(|r| r.jid).collect::<HashSet<Xid>>() };

    if seen_ids.len() < results.len() {
        eprintln!("Got some duplicates yo");
    }

    let total_duration = started.elapsed();
    results.sort_by_key(|r| r.duration_millis);
    let throughput = count as f64 / total_duration.as_secs_f64();
    let (min, max, median, pct) = (
        results[0].duration_millis,
        results[count - 1].duration_millis,
        results[count / 2].duration_millis,
        results[(count * 19) / 20].duration_millis,
    );

    println!("Processed: {} jobs", processed.load(Ordering::SeqCst));
    println!("min: {}ms", min);
    println!("max: {}ms", max);
    println!("median: {}ms", median);
    println!("95th percentile: {}ms", pct);
    println!("throughput: {}/s", throughput);

    // Handlers report before their outcome is recorded.
    while runner.is_running() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let jobs = service.list(&JobFilter::default().owner("bench")).await?;
    for status in [JobStatus::Done, JobStatus::Failed] {
        let n = jobs.iter().filter(|job| job.status == status).count();
        println!("{}: {}", status, n);
    }
    let unfinished = jobs.iter().filter(|job| !job.status.is_terminal()).count();
    if unfinished > 0 {
        eprintln!("{} jobs never finished", unfinished);
    }
    Ok(())
}

//! Shared harness for the engine integration tests: an in-memory store, a
//! scripted crawler and a small worker pool.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use warmfront_core::crawl::{CacheStatus, CrawlOutcome, CrawlRequest, TimingBreakdown};
use warmfront_core::error::CrawlFailure;
use warmfront_core::model::Job;
use warmfront_engine::crawler::Crawler;
use warmfront_engine::governor::{GovernorConfig, RateGovernor};
use warmfront_engine::manager::JobManager;
use warmfront_engine::source::{StaticSource, UrlSource};
use warmfront_engine::{PoolConfig, PoolDeps, PoolHandle, start_pool};
use warmfront_store::memory::MemoryStore;
use warmfront_store::queue::{ResultQueue, ResultQueueConfig};
use warmfront_store::Store;

/// One scripted crawl response.
#[derive(Debug, Clone)]
pub enum Script {
    /// 200 with a cache miss.
    Success,
    /// 200 carrying links for `find_links` jobs.
    SuccessWithLinks(Vec<String>),
    /// Completed exchange with this upstream status.
    Status(u16),
    /// Transport-level failure (retryable).
    Transport,
}

/// Crawler that replays per-URL scripts; unscripted URLs succeed.
pub struct FakeCrawler {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    delay: Duration,
}

impl FakeCrawler {
    pub fn ok() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(5))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            delay,
        })
    }

    /// Queue scripted responses for a URL; replayed in order, then the URL
    /// falls back to plain success.
    pub fn script(&self, url: &str, responses: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }
}

pub fn success_outcome(status: u16, links: Vec<String>) -> CrawlOutcome {
    CrawlOutcome {
        status_code: status,
        response_time_ms: 12,
        cache_status: CacheStatus::Miss,
        timing: TimingBreakdown {
            ttfb_ms: Some(8),
            transfer_ms: Some(4),
            ..TimingBreakdown::default()
        },
        content_length: Some(2048),
        content_type: Some("text/html".to_string()),
        headers: BTreeMap::new(),
        redirect_url: None,
        second: None,
        discovered_links: links,
    }
}

#[async_trait]
impl Crawler for FakeCrawler {
    async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlOutcome, CrawlFailure> {
        tokio::time::sleep(self.delay).await;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Success);
        match script {
            Script::Success => Ok(success_outcome(200, Vec::new())),
            Script::SuccessWithLinks(links) => {
                let links = if request.find_links { links } else { Vec::new() };
                Ok(success_outcome(200, links))
            }
            Script::Status(status) => Ok(success_outcome(status, Vec::new())),
            Script::Transport => Err(CrawlFailure::transport("connection reset by peer")),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<JobManager>,
    pub pool: PoolHandle,
}

/// Pool over a fresh in-memory store with fast test timings.
pub fn start_harness(
    crawler: Arc<dyn Crawler>,
    source: StaticSource,
    workers: usize,
) -> Harness {
    start_harness_on(Arc::new(MemoryStore::new()), crawler, source, workers)
}

pub fn start_harness_on(
    store: Arc<MemoryStore>,
    crawler: Arc<dyn Crawler>,
    source: StaticSource,
    workers: usize,
) -> Harness {
    let store_dyn: Arc<dyn Store> = store.clone();
    let (queue, queue_driver) = ResultQueue::start(
        store_dyn.clone(),
        ResultQueueConfig {
            flush_interval: Duration::from_millis(20),
            flush_threshold: 8,
            ..ResultQueueConfig::default()
        },
    );
    let governor = RateGovernor::new(store_dyn.clone(), GovernorConfig::default());
    let source: Arc<dyn UrlSource> = Arc::new(source);
    let manager = JobManager::new(store_dyn.clone(), source);

    let mut config = PoolConfig::new(workers, 1);
    config.claim_backoff = Duration::from_millis(20);
    config.drain_timeout = Duration::from_secs(5);

    let pool = start_pool(
        config,
        PoolDeps {
            store: store_dyn,
            queue,
            queue_driver,
            governor,
            crawler,
            manager: manager.clone(),
        },
    );

    Harness {
        store,
        manager,
        pool,
    }
}

/// Poll the job until the predicate holds; panics after ten seconds.
pub async fn wait_for_job<F>(store: &MemoryStore, job_id: &str, what: &str, pred: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get_job(job_id).await.expect("job exists");
        if pred(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}; job: {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

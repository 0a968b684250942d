//! Public API types for the in-process warmfront worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use warmfront_store::queue::ResultQueueDriver;
use warmfront_store::{ResultQueue, Store};

use crate::crawler::Crawler;
use crate::governor::RateGovernor;
use crate::manager::JobManager;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Outer parallelism (number of workers).
    pub job_workers: usize,
    /// Inner parallelism per worker. Workers and their inner slots are
    /// flattened into `job_workers × concurrency_per_worker` independent
    /// claim loops.
    pub concurrency_per_worker: usize,
    /// How long a loop sleeps after an empty claim before retrying.
    pub claim_backoff: Duration,
    /// Bound on draining in-flight tasks during stop.
    pub drain_timeout: Duration,
}

impl PoolConfig {
    /// Default backoff after an empty claim.
    pub const DEFAULT_CLAIM_BACKOFF: Duration = Duration::from_millis(500);

    /// Default drain bound for graceful stop.
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(180);

    pub fn new(job_workers: usize, concurrency_per_worker: usize) -> Self {
        Self {
            job_workers: job_workers.max(1),
            concurrency_per_worker: concurrency_per_worker.max(1),
            claim_backoff: Self::DEFAULT_CLAIM_BACKOFF,
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Total number of claim loops.
    pub fn capacity(&self) -> usize {
        self.job_workers.max(1) * self.concurrency_per_worker.max(1)
    }
}

/// Collaborators the pool drives.
pub struct PoolDeps {
    pub store: Arc<dyn Store>,
    pub queue: ResultQueue,
    /// The pool owns the flusher and drains it during stop.
    pub queue_driver: ResultQueueDriver,
    pub governor: Arc<RateGovernor>,
    pub crawler: Arc<dyn Crawler>,
    pub manager: Arc<JobManager>,
}

/// A lightweight summary of a claimed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSummary {
    pub task_id: String,
    pub job_id: String,
    /// Fully-qualified URL being warmed.
    pub url: String,
    /// Zero-based attempt number (`retry_count` at claim time).
    pub attempt: i32,
}

/// How a task left a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskDisposition {
    /// Crawl succeeded.
    Completed,
    /// Retryable failure with budget remaining; the store will re-queue it.
    Retrying,
    /// Permanent failure (or the retry budget is exhausted).
    Failed,
}

/// Pool event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PoolEvent {
    /// Pool started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// A worker claimed a task.
    TaskStarted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Task summary.
        task: TaskSummary,
    },
    /// A worker finished a task (the result is on its way through the queue).
    TaskFinished {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Task summary.
        task: TaskSummary,
        /// How the task left the worker.
        disposition: TaskDisposition,
        /// Total response time, when the exchange completed.
        response_time_ms: Option<u64>,
        /// Upstream cache verdict, when the exchange completed.
        cache_status: Option<String>,
        /// Failure message, when it did not.
        error: Option<String>,
    },
    /// A warning from the pool.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the pool.
    Error {
        /// Error message.
        message: String,
    },
    /// Pool stopped (all workers drained, queue flushed).
    Stopped,
}

/// Snapshot of a single claim loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub worker_idx: usize,
    pub task: Option<TaskSummary>,
}

/// Current pool state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub stop_requested: bool,
    pub workers: Vec<WorkerSnapshot>,
    pub tasks_completed: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
}

pub(crate) struct PoolInner {
    pub(crate) event_tx: tokio::sync::broadcast::Sender<PoolEvent>,
    pub(crate) snapshot_rx: tokio::sync::watch::Receiver<PoolSnapshot>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) notify: Notify,
}

impl PoolInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(PoolEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Handle to a running worker pool.
pub struct PoolHandle {
    pub(crate) inner: Arc<PoolInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl PoolHandle {
    /// Subscribe to the pool event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest pool snapshot.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown: finish in-flight tasks, flush the result
    /// queue, stop claiming.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the pool to stop, returning the pool task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("pool task join error: {err}")),
        }
    }
}

/// Start the worker pool.
pub fn start_pool(config: PoolConfig, deps: PoolDeps) -> PoolHandle {
    crate::pool::start_pool(config, deps)
}

/// Cooperative shutdown signal shared by the background loops.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

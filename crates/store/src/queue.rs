//! Batched task-result writer.
//!
//! Workers funnel completion/failure ops through this queue instead of
//! writing to the store directly: per-task writes fan out to a single `jobs`
//! row and would serialise every worker through that row's lock. Coalescing
//! them lets the job-level recomputation run once per batch per job.
//!
//! A single flusher task drains the buffer on a fixed interval or when it
//! exceeds a threshold, whichever comes first, and applies the batch in one
//! transaction. Flush failures retry the whole batch with exponential
//! backoff; ops are never dropped. Backpressure blocks the submitting worker
//! once the channel is full.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::api::{Store, TaskOp};

#[derive(Debug, Clone)]
pub struct ResultQueueConfig {
    /// Bounded ingress capacity; senders block when full.
    pub capacity: usize,
    /// Flush cadence when the threshold is not reached first.
    pub flush_interval: Duration,
    /// Buffer size that triggers an immediate flush.
    pub flush_threshold: usize,
    /// After this many failed attempts the failure is surfaced to the
    /// health counters (retrying continues regardless).
    pub surface_after_attempts: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ResultQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            flush_interval: Duration::from_millis(200),
            flush_threshold: 64,
            surface_after_attempts: 5,
            retry_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Counters sampled by the health monitor.
#[derive(Debug, Default)]
pub struct QueueHealth {
    flush_failures: AtomicU64,
    flushed_ops: AtomicU64,
    depth: AtomicUsize,
}

impl QueueHealth {
    /// Flush attempts that exceeded the surfacing threshold.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    pub fn flushed_ops(&self) -> u64 {
        self.flushed_ops.load(Ordering::Relaxed)
    }

    /// Ops submitted but not yet applied.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

enum QueueMsg {
    Op(TaskOp),
    Shutdown,
}

/// The queue is closed; the op was not accepted.
#[derive(Debug, thiserror::Error)]
#[error("result queue is closed")]
pub struct QueueClosed;

/// Cloneable submission handle.
#[derive(Clone)]
pub struct ResultQueue {
    tx: mpsc::Sender<QueueMsg>,
    health: Arc<QueueHealth>,
}

/// Owns the flusher task; await it after closing the queue.
pub struct ResultQueueDriver {
    handle: JoinHandle<()>,
}

impl ResultQueue {
    pub fn start(
        store: Arc<dyn Store>,
        config: ResultQueueConfig,
    ) -> (ResultQueue, ResultQueueDriver) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let health = Arc::new(QueueHealth::default());
        let handle = tokio::spawn(run_flusher(store, config, rx, health.clone()));
        (ResultQueue { tx, health }, ResultQueueDriver { handle })
    }

    /// Submit one op. Blocks under backpressure when the buffer is full.
    pub async fn submit(&self, op: TaskOp) -> Result<(), QueueClosed> {
        self.health.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(QueueMsg::Op(op)).await.map_err(|_| {
            self.health.depth.fetch_sub(1, Ordering::Relaxed);
            QueueClosed
        })
    }

    pub fn health(&self) -> Arc<QueueHealth> {
        self.health.clone()
    }

    /// Ask the flusher to drain everything submitted so far and exit.
    ///
    /// All submissions must have completed before this is called; ops sent
    /// afterwards are not accepted.
    pub async fn close(&self) {
        let _ = self.tx.send(QueueMsg::Shutdown).await;
    }
}

impl ResultQueueDriver {
    /// Wait for the flusher to finish its final drain.
    pub async fn wait(self) {
        if let Err(err) = self.handle.await {
            error!("result queue flusher join error: {err}");
        }
    }
}

async fn run_flusher(
    store: Arc<dyn Store>,
    config: ResultQueueConfig,
    mut rx: mpsc::Receiver<QueueMsg>,
    health: Arc<QueueHealth>,
) {
    let mut interval = tokio::time::interval(config.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut buf: Vec<TaskOp> = Vec::new();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(QueueMsg::Op(op)) => {
                    buf.push(op);
                    if buf.len() >= config.flush_threshold {
                        flush(&store, &config, &mut buf, &health).await;
                    }
                }
                Some(QueueMsg::Shutdown) | None => {
                    while let Ok(msg) = rx.try_recv() {
                        if let QueueMsg::Op(op) = msg {
                            buf.push(op);
                        }
                    }
                    flush(&store, &config, &mut buf, &health).await;
                    break;
                }
            },
            _ = interval.tick() => {
                if !buf.is_empty() {
                    flush(&store, &config, &mut buf, &health).await;
                }
            }
        }
    }
}

/// Apply the buffered batch, retrying until it lands.
async fn flush(
    store: &Arc<dyn Store>,
    config: &ResultQueueConfig,
    buf: &mut Vec<TaskOp>,
    health: &QueueHealth,
) {
    let ops = std::mem::take(buf);
    if ops.is_empty() {
        return;
    }
    let batch_len = ops.len();

    let mut attempt: u32 = 0;
    loop {
        match store.apply_task_results(ops.clone()).await {
            Ok(outcome) => {
                health.flushed_ops.fetch_add(outcome.applied as u64, Ordering::Relaxed);
                health.depth.fetch_sub(batch_len, Ordering::Relaxed);
                if attempt > 0 {
                    debug!(attempts = attempt + 1, ops = batch_len, "flush succeeded after retries");
                }
                // A task left `running` on these jobs: give each a chance to
                // promote one waiting task now that the counters are current.
                for job_id in &outcome.released_jobs {
                    if let Err(err) = store.promote_waiting_task_for_job(job_id).await {
                        debug!(job_id = %job_id, "post-flush promotion failed: {err}");
                    }
                }
                return;
            }
            Err(err) => {
                attempt += 1;
                let exp = attempt.min(6);
                let backoff = config
                    .retry_backoff
                    .saturating_mul(1u32 << exp)
                    .min(config.max_backoff);
                if attempt == config.surface_after_attempts {
                    health.flush_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        ops = batch_len,
                        attempt, "result batch keeps failing, surfacing to health monitor: {err}"
                    );
                } else {
                    warn!(
                        ops = batch_len,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "result batch flush failed, retrying: {err}"
                    );
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

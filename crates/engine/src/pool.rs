//! Worker pool runtime: spawns the claim loops, relays their events, and
//! drives the graceful-stop drain.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use warmfront_store::ResultQueue;
use warmfront_store::queue::ResultQueueDriver;

use crate::api::{
    PoolConfig, PoolDeps, PoolEvent, PoolHandle, PoolInner, PoolSnapshot, TaskDisposition,
    TaskSummary, WorkerSnapshot,
};
use crate::worker::{WorkerContext, WorkerEvent, run_worker};

pub(crate) fn start_pool(config: PoolConfig, deps: PoolDeps) -> PoolHandle {
    let (event_tx, _) = broadcast::channel::<PoolEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());

    let inner = Arc::new(PoolInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let join = tokio::spawn(run_pool(inner.clone(), snapshot_tx, config, deps));
    PoolHandle { inner, join }
}

struct PoolRuntime {
    config: PoolConfig,
    queue: ResultQueue,
    queue_driver: Option<ResultQueueDriver>,

    workers: Vec<Option<TaskSummary>>,
    internal_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    worker_join: JoinSet<()>,

    tasks_completed: u64,
    tasks_retried: u64,
    tasks_failed: u64,

    snapshot_tx: watch::Sender<PoolSnapshot>,
    inner: Arc<PoolInner>,
}

impl PoolRuntime {
    fn build_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            stop_requested: self.inner.should_stop(),
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(idx, task)| WorkerSnapshot {
                    worker_idx: idx,
                    task: task.clone(),
                })
                .collect(),
            tasks_completed: self.tasks_completed,
            tasks_retried: self.tasks_retried,
            tasks_failed: self.tasks_failed,
        }
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_snapshot());
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::TaskStarted { worker_idx, task } => {
                if let Some(slot) = self.workers.get_mut(worker_idx) {
                    *slot = Some(task.clone());
                }
                self.emit(PoolEvent::TaskStarted { worker_idx, task });
                self.push_snapshot();
            }
            WorkerEvent::TaskFinished {
                worker_idx,
                task,
                disposition,
                response_time_ms,
                cache_status,
                error,
            } => {
                if let Some(slot) = self.workers.get_mut(worker_idx) {
                    *slot = None;
                }
                match disposition {
                    TaskDisposition::Completed => self.tasks_completed += 1,
                    TaskDisposition::Retrying => self.tasks_retried += 1,
                    TaskDisposition::Failed => self.tasks_failed += 1,
                }
                self.emit(PoolEvent::TaskFinished {
                    worker_idx,
                    task,
                    disposition,
                    response_time_ms,
                    cache_status,
                    error,
                });
                self.push_snapshot();
            }
            WorkerEvent::Warning { message } => {
                warn!("{message}");
                self.emit(PoolEvent::Warning { message });
            }
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(PoolEvent::Started);
        self.push_snapshot();
        info!(
            workers = self.workers.len(),
            "worker pool started"
        );

        let mut result: anyhow::Result<()> = Ok(());

        loop {
            if self.inner.should_stop() {
                break;
            }
            tokio::select! {
                ev = self.internal_rx.recv() => {
                    match ev {
                        Some(ev) => self.handle_event(ev),
                        None => {
                            if !self.inner.should_stop() {
                                result = Err(anyhow::anyhow!("all worker loops exited unexpectedly"));
                            }
                            break;
                        }
                    }
                }
                _ = self.inner.notify.notified() => {}
                res = self.worker_join.join_next(), if !self.worker_join.is_empty() => {
                    match res {
                        Some(Ok(())) if self.inner.should_stop() => {}
                        Some(Ok(())) => {
                            result = Err(anyhow::anyhow!("worker loop exited unexpectedly"));
                            break;
                        }
                        Some(Err(err)) => {
                            result = Err(anyhow::anyhow!("worker loop join error: {err:#}"));
                            break;
                        }
                        None => {}
                    }
                }
            }
        }

        if let Err(err) = &result {
            self.emit(PoolEvent::Error {
                message: format!("pool error: {err:#}"),
            });
            self.inner.request_stop();
        }

        // Drain in-flight tasks, bounded. Abandoned rows stay `running` and
        // are recovered by the health monitor on the next start.
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut events_open = true;
        while !self.worker_join.is_empty() {
            tokio::select! {
                ev = self.internal_rx.recv(), if events_open => {
                    match ev {
                        Some(ev) => self.handle_event(ev),
                        None => events_open = false,
                    }
                }
                res = self.worker_join.join_next() => {
                    if let Some(Err(err)) = res {
                        warn!("worker loop join error during drain: {err:#}");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let abandoned = self.workers.iter().filter(|w| w.is_some()).count();
                    self.emit(PoolEvent::Warning {
                        message: format!(
                            "drain timeout reached; abandoning {abandoned} in-flight task(s)"
                        ),
                    });
                    self.worker_join.abort_all();
                    while self.worker_join.join_next().await.is_some() {}
                    break;
                }
            }
        }
        while let Ok(ev) = self.internal_rx.try_recv() {
            self.handle_event(ev);
        }

        // The queue must be fully flushed before the store shuts down.
        self.queue.close().await;
        if let Some(queue_driver) = self.queue_driver.take() {
            queue_driver.wait().await;
        }

        info!(
            completed = self.tasks_completed,
            retried = self.tasks_retried,
            failed = self.tasks_failed,
            "worker pool stopped"
        );
        self.emit(PoolEvent::Stopped);
        self.push_snapshot();
        result
    }
}

async fn run_pool(
    inner: Arc<PoolInner>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    config: PoolConfig,
    deps: PoolDeps,
) -> anyhow::Result<()> {
    let capacity = config.capacity();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut worker_join = JoinSet::new();

    for idx in 0..capacity {
        worker_join.spawn(run_worker(WorkerContext {
            idx,
            store: deps.store.clone(),
            queue: deps.queue.clone(),
            governor: deps.governor.clone(),
            crawler: deps.crawler.clone(),
            manager: deps.manager.clone(),
            events: internal_tx.clone(),
            inner: inner.clone(),
            claim_backoff: config.claim_backoff,
        }));
    }
    drop(internal_tx);

    let runtime = PoolRuntime {
        workers: (0..capacity).map(|_| None).collect(),
        internal_rx,
        worker_join,
        tasks_completed: 0,
        tasks_retried: 0,
        tasks_failed: 0,
        queue: deps.queue,
        queue_driver: Some(deps.queue_driver),
        config,
        snapshot_tx,
        inner,
    };
    runtime.run().await
}

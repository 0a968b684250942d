//! A single claim loop: claim → pace → crawl → report.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use warmfront_core::crawl::{CrawlOutcome, CrawlRequest};
use warmfront_core::error::CrawlFailure;
use warmfront_core::model::MAX_TASK_RETRIES;
use warmfront_store::{ClaimedTask, ResultQueue, Store, TaskOp};

use crate::api::{PoolInner, TaskDisposition, TaskSummary};
use crate::crawler::Crawler;
use crate::governor::{PaceSignal, RateGovernor};
use crate::manager::JobManager;

pub(crate) enum WorkerEvent {
    TaskStarted {
        worker_idx: usize,
        task: TaskSummary,
    },
    TaskFinished {
        worker_idx: usize,
        task: TaskSummary,
        disposition: TaskDisposition,
        response_time_ms: Option<u64>,
        cache_status: Option<String>,
        error: Option<String>,
    },
    Warning {
        message: String,
    },
}

pub(crate) struct WorkerContext {
    pub(crate) idx: usize,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) queue: ResultQueue,
    pub(crate) governor: Arc<RateGovernor>,
    pub(crate) crawler: Arc<dyn Crawler>,
    pub(crate) manager: Arc<JobManager>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) inner: Arc<PoolInner>,
    pub(crate) claim_backoff: Duration,
}

pub(crate) async fn run_worker(ctx: WorkerContext) {
    loop {
        if ctx.inner.should_stop() {
            break;
        }
        match ctx.store.claim_next_task().await {
            Ok(Some(claimed)) => process_task(&ctx, claimed).await,
            Ok(None) => idle_backoff(&ctx).await,
            Err(err) => {
                if err.is_retryable() {
                    debug!(worker = ctx.idx, "claim hit a transient store error: {err}");
                } else {
                    let _ = ctx.events.send(WorkerEvent::Warning {
                        message: format!("worker {} claim failed: {err}", ctx.idx + 1),
                    });
                }
                idle_backoff(&ctx).await;
            }
        }
    }
}

/// Sleep with jitter after an empty claim, waking early on stop.
async fn idle_backoff(ctx: &WorkerContext) {
    let wait = ctx.claim_backoff + ctx.claim_backoff.mul_f64(rand::random::<f64>());
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = ctx.inner.notify.notified() => {}
    }
}

async fn process_task(ctx: &WorkerContext, claimed: ClaimedTask) {
    let summary = TaskSummary {
        task_id: claimed.task.id.clone(),
        job_id: claimed.task.job_id.clone(),
        url: claimed.url(),
        attempt: claimed.task.retry_count,
    };
    let _ = ctx.events.send(WorkerEvent::TaskStarted {
        worker_idx: ctx.idx,
        task: summary.clone(),
    });

    ctx.governor.acquire(claimed.domain_id).await;

    let request = CrawlRequest {
        task_id: claimed.task.id.clone(),
        job_id: claimed.task.job_id.clone(),
        url: summary.url.clone(),
        find_links: claimed.find_links,
    };
    let crawl = AssertUnwindSafe(ctx.crawler.crawl(&request))
        .catch_unwind()
        .await;

    let report = match crawl {
        Err(panic) => {
            let message = format!("worker panicked during crawl: {}", panic_message(&panic));
            TaskReport::failed(&claimed, message, true)
        }
        Ok(Err(failure)) => {
            if failure.kind.is_throttle_signal() {
                ctx.governor
                    .record(claimed.domain_id, PaceSignal::Throttled)
                    .await;
            }
            TaskReport::failed(&claimed, failure.message.clone(), failure.retryable())
        }
        Ok(Ok(outcome)) => match outcome.failure() {
            Some(failure) => {
                if failure.kind.is_throttle_signal() {
                    ctx.governor
                        .record(claimed.domain_id, PaceSignal::Throttled)
                        .await;
                }
                TaskReport::failed_with_response(&claimed, &outcome, failure)
            }
            None => {
                ctx.governor
                    .record(
                        claimed.domain_id,
                        PaceSignal::Success {
                            response_time_ms: outcome.response_time_ms,
                        },
                    )
                    .await;
                if request.find_links && !outcome.discovered_links.is_empty() {
                    let links = outcome.discovered_links.clone();
                    if let Err(err) = ctx.manager.ingest_discovered(&request.job_id, links).await {
                        let _ = ctx.events.send(WorkerEvent::Warning {
                            message: format!(
                                "link ingestion failed for job {}: {err}",
                                request.job_id
                            ),
                        });
                    }
                }
                TaskReport::completed(outcome)
            }
        },
    };

    let TaskReport {
        op,
        disposition,
        response_time_ms,
        cache_status,
        error,
    } = report;
    let op = match op {
        ReportOp::Complete(outcome) => TaskOp::Complete {
            task_id: claimed.task.id.clone(),
            outcome,
        },
        ReportOp::Fail { error, retryable } => TaskOp::Fail {
            task_id: claimed.task.id.clone(),
            error,
            retryable,
        },
    };
    if ctx.queue.submit(op).await.is_err() {
        let _ = ctx.events.send(WorkerEvent::Warning {
            message: format!(
                "result queue closed; task {} will be recovered by the health monitor",
                claimed.task.id
            ),
        });
    }

    let _ = ctx.events.send(WorkerEvent::TaskFinished {
        worker_idx: ctx.idx,
        task: summary,
        disposition,
        response_time_ms,
        cache_status,
        error,
    });
}

enum ReportOp {
    Complete(Box<CrawlOutcome>),
    Fail { error: String, retryable: bool },
}

struct TaskReport {
    op: ReportOp,
    disposition: TaskDisposition,
    response_time_ms: Option<u64>,
    cache_status: Option<String>,
    error: Option<String>,
}

impl TaskReport {
    fn completed(outcome: CrawlOutcome) -> Self {
        Self {
            disposition: TaskDisposition::Completed,
            response_time_ms: Some(outcome.response_time_ms),
            cache_status: Some(outcome.cache_status.as_str().to_string()),
            error: None,
            op: ReportOp::Complete(Box::new(outcome)),
        }
    }

    fn failed(claimed: &ClaimedTask, message: String, retryable: bool) -> Self {
        Self {
            op: ReportOp::Fail {
                error: message.clone(),
                retryable,
            },
            disposition: disposition_for(claimed, retryable),
            response_time_ms: None,
            cache_status: None,
            error: Some(message),
        }
    }

    /// Upstream error status: the exchange completed, so keep the measured
    /// response fields alongside the failure.
    fn failed_with_response(claimed: &ClaimedTask, outcome: &CrawlOutcome, failure: CrawlFailure) -> Self {
        Self {
            op: ReportOp::Fail {
                error: failure.message.clone(),
                retryable: failure.retryable(),
            },
            disposition: disposition_for(claimed, failure.retryable()),
            response_time_ms: Some(outcome.response_time_ms),
            cache_status: Some(outcome.cache_status.as_str().to_string()),
            error: Some(failure.message),
        }
    }
}

fn disposition_for(claimed: &ClaimedTask, retryable: bool) -> TaskDisposition {
    if retryable && claimed.task.retry_count < MAX_TASK_RETRIES {
        TaskDisposition::Retrying
    } else {
        TaskDisposition::Failed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

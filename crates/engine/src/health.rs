//! Stuck-job and stuck-task detection.
//!
//! Two cadences: a fast finalise tick that catches jobs whose counters
//! reached terminal progress while the status write lagged, and a slow scan
//! that reports jobs and tasks stuck in `running` and resets tasks past the
//! recovery threshold.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use warmfront_store::Store;
use warmfront_store::queue::QueueHealth;

use crate::api::Shutdown;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub finalize_tick: Duration,
    pub stuck_tick: Duration,
    /// A running job with zero progress older than this is stuck.
    pub stuck_job_threshold: Duration,
    /// A running task older than this is stuck.
    pub stuck_task_threshold: Duration,
    pub job_sample_limit: usize,
    pub task_sample_limit: usize,
    /// Reset stuck tasks to `pending` once they are older than this.
    pub reset_task_threshold: Duration,
    pub reset_batch: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            finalize_tick: Duration::from_secs(30),
            stuck_tick: Duration::from_secs(300),
            stuck_job_threshold: Duration::from_secs(300),
            stuck_task_threshold: Duration::from_secs(180),
            job_sample_limit: 10,
            task_sample_limit: 20,
            reset_task_threshold: Duration::from_secs(600),
            reset_batch: 50,
        }
    }
}

pub async fn run_health_monitor(
    store: Arc<dyn Store>,
    queue_health: Arc<QueueHealth>,
    config: HealthConfig,
    shutdown: Shutdown,
) {
    let mut finalize = tokio::time::interval(config.finalize_tick);
    finalize.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stuck = tokio::time::interval(config.stuck_tick);
    stuck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut seen_flush_failures = 0u64;

    loop {
        tokio::select! {
            _ = finalize.tick() => {
                finalize_tick(&store, &queue_health, &mut seen_flush_failures).await;
            }
            _ = stuck.tick() => {
                stuck_tick(&store, &config).await;
            }
            _ = shutdown.wait() => break,
        }
    }
    info!("health monitor stopped");
}

async fn finalize_tick(
    store: &Arc<dyn Store>,
    queue_health: &QueueHealth,
    seen_flush_failures: &mut u64,
) {
    match store.finalize_lagging_jobs().await {
        Ok(finalized) if !finalized.is_empty() => {
            warn!(
                jobs = finalized.len(),
                sample = ?finalized.first(),
                "finalised jobs whose progress writes lagged"
            );
            // Lag implies counter drift is possible; recount from ground truth.
            for job_id in &finalized {
                if let Err(err) = store.recalculate_job_stats(job_id).await {
                    warn!(job_id = %job_id, "post-finalise recalculation failed: {err}");
                }
            }
        }
        Ok(_) => {}
        Err(err) => warn!("finalise pass failed: {err}"),
    }

    let failures = queue_health.flush_failures();
    if failures > *seen_flush_failures {
        warn!(
            total = failures,
            depth = queue_health.depth(),
            "result queue is failing to flush"
        );
        *seen_flush_failures = failures;
    }
}

async fn stuck_tick(store: &Arc<dyn Store>, config: &HealthConfig) {
    match store
        .scan_stuck_jobs(config.stuck_job_threshold, config.job_sample_limit)
        .await
    {
        Ok(scan) if scan.total > 0 => {
            let sample_ids: Vec<&str> = scan.samples.iter().map(|j| j.id.as_str()).collect();
            warn!(
                total = scan.total,
                samples = ?sample_ids,
                "jobs running with zero progress past threshold"
            );
        }
        Ok(_) => {}
        Err(err) => warn!("stuck-job scan failed: {err}"),
    }

    match store
        .scan_stuck_tasks(config.stuck_task_threshold, config.task_sample_limit)
        .await
    {
        Ok(scan) if scan.total > 0 => {
            let sample_ids: Vec<&str> = scan.samples.iter().map(|t| t.id.as_str()).collect();
            warn!(
                total = scan.total,
                samples = ?sample_ids,
                "tasks stuck in running past threshold"
            );
        }
        Ok(_) => {}
        Err(err) => warn!("stuck-task scan failed: {err}"),
    }

    match store
        .reset_stuck_tasks(config.reset_task_threshold, config.reset_batch)
        .await
    {
        Ok(0) => {}
        Ok(reset) => info!(reset, "stuck tasks re-queued"),
        Err(err) => warn!("stuck-task reset failed: {err}"),
    }
}

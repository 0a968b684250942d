//! Recurring-schedule materialisation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use warmfront_store::Store;

use crate::api::Shutdown;
use crate::manager::JobManager;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Max schedules materialised per tick.
    pub batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            batch: 20,
        }
    }
}

/// Tick loop: read due schedules and create a job from each, unless one
/// started recently enough that running again would overlap.
pub async fn run_scheduler_loop(
    store: Arc<dyn Store>,
    manager: Arc<JobManager>,
    config: SchedulerConfig,
    shutdown: Shutdown,
) {
    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = run_tick(&store, &manager, config.batch).await {
                    warn!("scheduler tick failed: {err}");
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    info!("scheduler loop stopped");
}

async fn run_tick(
    store: &Arc<dyn Store>,
    manager: &Arc<JobManager>,
    batch: usize,
) -> Result<(), warmfront_store::StoreError> {
    let due = store.get_schedulers_ready_to_run(batch).await?;
    for scheduler in due {
        let interval = scheduler.interval();

        // A job that started within half an interval is still "this run";
        // skip and push the schedule forward instead of doubling up.
        if let Some(last) = store.get_last_job_start_for_scheduler(&scheduler.id).await? {
            if Utc::now() - last < interval / 2 {
                store
                    .update_scheduler_next_run(&scheduler.id, scheduler.next_run_at + interval)
                    .await?;
                info!(
                    scheduler_id = %scheduler.id,
                    "recent job found, skipping this run"
                );
                continue;
            }
        }

        let job = manager.create_job(scheduler.options_for_run()).await?;
        store
            .update_scheduler_next_run(&scheduler.id, Utc::now() + interval)
            .await?;
        info!(
            scheduler_id = %scheduler.id,
            job_id = %job.id,
            domain = %scheduler.domain,
            "schedule materialised"
        );
    }
    Ok(())
}

//! Daily-quota sweep: clear expired blocks and wake the orgs' waiting tasks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use warmfront_store::Store;

use crate::api::Shutdown;

#[derive(Debug, Clone)]
pub struct QuotaSweepConfig {
    pub tick: Duration,
    /// Max tasks promoted per organisation per sweep.
    pub promote_limit: usize,
}

impl Default for QuotaSweepConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            promote_limit: 500,
        }
    }
}

pub async fn run_quota_sweep(store: Arc<dyn Store>, config: QuotaSweepConfig, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => sweep(&store, config.promote_limit).await,
            _ = shutdown.wait() => break,
        }
    }
    info!("quota sweep stopped");
}

async fn sweep(store: &Arc<dyn Store>, promote_limit: usize) {
    let unblocked = match store.clear_expired_quota_blocks().await {
        Ok(orgs) => orgs,
        Err(err) => {
            warn!("clearing expired quota blocks failed: {err}");
            return;
        }
    };

    for org_id in unblocked {
        match store
            .promote_waiting_tasks_for_org(&org_id, promote_limit)
            .await
        {
            Ok(promoted) => {
                info!(org_id = %org_id, promoted, "quota reset, waiting tasks promoted");
            }
            Err(err) => warn!(org_id = %org_id, "post-reset promotion failed: {err}"),
        }
    }
}

//! Daily-quota enforcement: blocking at the limit, the midnight sweep, and
//! post-reset promotion.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use warmfront_core::model::{JobOptions, JobStatus};
use warmfront_engine::Shutdown;
use warmfront_engine::quota::{QuotaSweepConfig, run_quota_sweep};
use warmfront_store::Store;
use warmfront_store::memory::MemoryStore;

use common::{FakeCrawler, start_harness_on, wait_for_job};
use warmfront_engine::source::StaticSource;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quota_blocks_at_limit_and_resumes_after_reset() {
    let store = Arc::new(MemoryStore::new());
    store.seed_plan("starter", 5);
    store.seed_org("org-1", "starter");

    let urls: Vec<String> = (0..10)
        .map(|i| format!("https://example.com/page-{i}"))
        .collect();
    let harness = start_harness_on(
        store.clone(),
        FakeCrawler::ok(),
        StaticSource::with_urls(urls),
        3,
    );

    let mut options = JobOptions::new("example.com");
    options.org_id = Some("org-1".to_string());
    let job = harness.manager.create_job(options).await.unwrap();

    // The first five tasks complete, then the org is blocked and the rest
    // sit in waiting.
    let blocked = wait_for_job(&harness.store, &job.id, "quota exhaustion", |j| {
        j.counters.completed == 5
    })
    .await;
    assert_eq!(blocked.status, JobStatus::Running);

    let org = store.organisation("org-1").unwrap();
    let until = org.quota_exhausted_until.expect("org is quota-blocked");
    assert!(until > Utc::now());
    assert_eq!(store.usage_for("org-1", Utc::now().date_naive()), 5);

    // Nothing else may run while the block holds.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let still = store.get_job(&job.id).await.unwrap();
    assert_eq!(still.counters.completed, 5);
    assert_eq!(still.counters.waiting, 5);
    assert_eq!(still.counters.running, 0);

    // Simulated UTC midnight: the block has expired and usage reset.
    store.set_quota_exhausted_until("org-1", Some(Utc::now() - chrono::Duration::seconds(1)));
    store.reset_daily_usage("org-1");

    let shutdown = Shutdown::new();
    let sweep = tokio::spawn(run_quota_sweep(
        store.clone() as Arc<dyn Store>,
        QuotaSweepConfig {
            tick: Duration::from_millis(20),
            promote_limit: 100,
        },
        shutdown.clone(),
    ));

    let done = wait_for_job(&harness.store, &job.id, "post-reset completion", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.completed, 10);
    // The second batch of five exhausts the fresh day's budget again.
    assert_eq!(store.usage_for("org-1", Utc::now().date_naive()), 5);

    shutdown.request();
    sweep.await.unwrap();
    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

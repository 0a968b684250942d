//! Postgres round-trip checks. These need a live scratch database (the
//! claim path is global, so leftover rows from other runs interfere) and
//! are gated behind `--ignored`:
//!
//! ```text
//! DATABASE_URL=postgres://… cargo test -p warmfront-store -- --ignored
//! ```

use warmfront_core::model::{self, JobOptions, JobStatus, SourceKind, TaskStatus};
use warmfront_store::pg::{PgStore, PgStoreConfig};
use warmfront_store::{EnqueueEntry, Store};

async fn connect() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for pg tests");
    let store = PgStore::connect(&PgStoreConfig::new(url))
        .await
        .expect("connect");
    store.migrate().await.expect("migrate");
    store
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn claim_complete_round_trip() {
    let store = connect().await;

    // Unique domain per run keeps reruns independent.
    let domain = format!("pg-{}.example.com", model::new_job_id());
    let mut options = JobOptions::new(domain.clone());
    options.concurrency = 1;
    let job = store.create_job(&options).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let paths = vec!["/a".to_string(), "/b".to_string()];
    let pages = store.get_or_create_pages(job.domain_id, &paths).await.unwrap();
    let entries: Vec<EnqueueEntry> = pages
        .into_iter()
        .zip(paths)
        .map(|(page_id, path)| EnqueueEntry::new(page_id, path, SourceKind::Sitemap))
        .collect();
    let outcome = store.enqueue_tasks(&job.id, &entries).await.unwrap();
    assert_eq!(outcome.inserted, 2);

    // Re-enqueueing is a no-op.
    let seeded = store.get_job(&job.id).await.unwrap();
    assert_eq!(seeded.counters.total, 2);
    assert_eq!(seeded.counters.pending, 1);
    assert_eq!(seeded.counters.waiting, 1);

    // concurrency = 1: one claim succeeds, the second finds nothing.
    let first = store.claim_next_task().await.unwrap();
    let first = first.expect("one task is claimable");
    assert_eq!(first.domain, domain);
    assert_eq!(first.task.status, TaskStatus::Running);

    store
        .complete_task(
            &first.task.id,
            warmfront_core::crawl::CrawlOutcome {
                status_code: 200,
                response_time_ms: 10,
                cache_status: warmfront_core::crawl::CacheStatus::Miss,
                timing: warmfront_core::crawl::TimingBreakdown::default(),
                content_length: Some(100),
                content_type: Some("text/html".to_string()),
                headers: Default::default(),
                redirect_url: None,
                second: None,
                discovered_links: Vec::new(),
            },
        )
        .await
        .unwrap();

    let after = store.get_job(&job.id).await.unwrap();
    assert_eq!(after.counters.completed, 1);
    assert_eq!(after.counters.running, 0);
    assert!(after.counters.is_conserved());

    // Promote the waiting task, finish it, and the job completes.
    assert!(store.promote_waiting_task_for_job(&job.id).await.unwrap());
    let second = store.claim_next_task().await.unwrap().expect("promoted task");
    store
        .fail_task(&second.task.id, "upstream status 404", false)
        .await
        .unwrap();

    let done = store.get_job(&job.id).await.unwrap();
    assert!(done.status.is_terminal());
    assert_eq!(done.counters.completed + done.counters.failed, 2);

    store.close().await;
}

//! Recovery paths: stuck-task detection and reset, lagging-job finalisation
//! and empty URL sources.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use warmfront_core::model::{JobOptions, JobStatus, TaskStatus};
use warmfront_engine::Shutdown;
use warmfront_engine::health::{HealthConfig, run_health_monitor};
use warmfront_engine::manager::JobManager;
use warmfront_engine::source::{StaticSource, UrlSource};
use warmfront_store::memory::MemoryStore;
use warmfront_store::queue::QueueHealth;
use warmfront_store::{EnqueueEntry, Store};

use common::{FakeCrawler, start_harness_on, wait_for_job};
use warmfront_core::model::SourceKind;

async fn seeded_job(store: &Arc<MemoryStore>, paths: &[&str]) -> warmfront_core::model::Job {
    let job = store
        .create_job(&JobOptions::new("example.com"))
        .await
        .unwrap();
    let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
    let pages = store
        .get_or_create_pages(job.domain_id, &paths)
        .await
        .unwrap();
    let entries: Vec<EnqueueEntry> = pages
        .into_iter()
        .zip(paths)
        .map(|(page_id, path)| EnqueueEntry::new(page_id, path, SourceKind::Sitemap))
        .collect();
    store.enqueue_tasks(&job.id, &entries).await.unwrap();
    store.get_job(&job.id).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_task_is_reset_and_eventually_completes() {
    let store = Arc::new(MemoryStore::new());
    let job = seeded_job(&store, &["/slow"]).await;

    // A worker claimed the task and then died: running, started long ago,
    // nobody attached.
    let claimed = store.claim_next_task().await.unwrap().unwrap();
    store.backdate_task_started(&claimed.task.id, Utc::now() - chrono::Duration::minutes(30));

    let shutdown = Shutdown::new();
    let monitor = tokio::spawn(run_health_monitor(
        store.clone() as Arc<dyn Store>,
        Arc::new(QueueHealth::default()),
        HealthConfig {
            finalize_tick: Duration::from_millis(20),
            stuck_tick: Duration::from_millis(20),
            stuck_task_threshold: Duration::from_secs(180),
            reset_task_threshold: Duration::from_secs(600),
            ..HealthConfig::default()
        },
        shutdown.clone(),
    ));

    // The monitor detects the stuck task and re-queues it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.task(&claimed.task.id).unwrap();
        if task.status == TaskStatus::Pending {
            assert_eq!(task.retry_count, 1);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stuck task was never reset: {task:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.request();
    monitor.await.unwrap();

    // With workers attached again, the re-queued task completes.
    let harness = start_harness_on(store.clone(), FakeCrawler::ok(), StaticSource::default(), 2);
    let done = wait_for_job(&store, &job.id, "recovered job completion", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.completed, 1);

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_progress_jobs_show_up_in_the_stuck_scan() {
    let store = Arc::new(MemoryStore::new());
    let job = seeded_job(&store, &["/never-finishes"]).await;

    // Claim flips the job to running; no completion ever arrives.
    let _claimed = store.claim_next_task().await.unwrap().unwrap();
    store.backdate_job_started(&job.id, Utc::now() - chrono::Duration::minutes(30));

    let scan = store
        .scan_stuck_jobs(Duration::from_secs(300), 10)
        .await
        .unwrap();
    assert_eq!(scan.total, 1);
    assert_eq!(scan.samples[0].id, job.id);

    // A healthy job with progress is not reported.
    let healthy = seeded_job(&store, &["/h"]).await;
    let claimed = store.claim_next_task().await.unwrap().unwrap();
    store
        .complete_task(&claimed.task.id, common::success_outcome(200, Vec::new()))
        .await
        .unwrap();
    let scan = store
        .scan_stuck_jobs(Duration::from_secs(300), 10)
        .await
        .unwrap();
    assert_eq!(scan.total, 1, "only the zero-progress job is stuck");
    assert_ne!(scan.samples[0].id, healthy.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_url_source_completes_the_job_with_a_note() {
    let store = Arc::new(MemoryStore::new());
    let source: Arc<dyn UrlSource> = Arc::new(StaticSource::default());
    let manager = JobManager::new(store.clone() as Arc<dyn Store>, source);

    let job = manager
        .create_job(JobOptions::new("empty.example.com"))
        .await
        .unwrap();

    let done = wait_for_job(&store, &job.id, "empty job completion", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.total, 0);
    assert!(
        done.error_message
            .as_deref()
            .unwrap_or("")
            .contains("no crawlable URLs")
    );
}

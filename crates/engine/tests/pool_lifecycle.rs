//! End-to-end pool behaviour against the in-memory store: tiny jobs,
//! concurrency caps, retries and mid-flight cancellation.

mod common;

use std::time::Duration;

use warmfront_core::model::{JobOptions, JobStatus, NotificationKind, TaskStatus};
use warmfront_engine::PoolEvent;
use warmfront_engine::source::StaticSource;
use warmfront_store::Store;

use common::{FakeCrawler, Script, start_harness, wait_for_job};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tiny_job_completes_within_its_concurrency_cap() {
    let crawler = FakeCrawler::with_delay(Duration::from_millis(40));
    let source = StaticSource::with_urls([
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
    ]);
    let harness = start_harness(crawler, source, 4);
    let mut events = harness.pool.subscribe();

    let mut options = JobOptions::new("example.com");
    options.concurrency = 2;
    let job = harness.manager.create_job(options).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let done = wait_for_job(&harness.store, &job.id, "job completion", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.total, 3);
    assert_eq!(done.counters.completed, 3);
    assert_eq!(done.progress(), 100.0);
    assert!(done.counters.is_conserved());
    assert!(done.completed_at.is_some());

    // The event stream must never show more than two of this job's tasks
    // in flight at once. Give the pool loop a moment to relay the tail of
    // the stream before draining it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut in_flight = 0i32;
    let mut max_in_flight = 0i32;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::TaskStarted { ref task, .. } if task.job_id == job.id => {
                in_flight += 1;
                max_in_flight = max_in_flight.max(in_flight);
            }
            PoolEvent::TaskFinished { ref task, .. } if task.job_id == job.id => {
                in_flight -= 1;
            }
            _ => {}
        }
    }
    assert!(max_in_flight >= 1);
    assert!(
        max_in_flight <= 2,
        "concurrency cap violated: {max_in_flight} tasks in flight"
    );

    let notifications = harness.store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::JobCompleted);

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retryable_failures_consume_budget_then_succeed() {
    let crawler = FakeCrawler::ok();
    crawler.script(
        "https://example.com/flaky",
        vec![Script::Transport, Script::Transport, Script::Transport],
    );
    let source = StaticSource::with_urls(["https://example.com/flaky"]);
    let harness = start_harness(crawler, source, 2);

    let job = harness
        .manager
        .create_job(JobOptions::new("example.com"))
        .await
        .unwrap();

    let done = wait_for_job(&harness.store, &job.id, "job completion", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.completed, 1);
    assert_eq!(done.counters.failed, 0);

    let tasks = harness.store.list_job_tasks(&job.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].retry_count, 3);

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permanent_upstream_failure_does_not_retry() {
    let crawler = FakeCrawler::ok();
    crawler.script("https://example.com/gone", vec![Script::Status(404)]);
    let source = StaticSource::with_urls(["https://example.com/gone"]);
    let harness = start_harness(crawler, source, 2);

    let job = harness
        .manager
        .create_job(JobOptions::new("example.com"))
        .await
        .unwrap();

    let done = wait_for_job(&harness.store, &job.id, "job to finish", |j| {
        j.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.counters.failed, 1);

    let tasks = harness.store.list_job_tasks(&job.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].retry_count, 0);
    assert!(tasks[0].error.as_deref().unwrap_or("").contains("404"));

    let notifications = harness.store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::JobFailed);

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_throttling_retries_and_raises_the_domain_delay() {
    let crawler = FakeCrawler::ok();
    crawler.script("https://example.com/busy", vec![Script::Status(429)]);
    let source = StaticSource::with_urls(["https://example.com/busy"]);
    let harness = start_harness(crawler, source, 2);

    let job = harness
        .manager
        .create_job(JobOptions::new("example.com"))
        .await
        .unwrap();

    let done = wait_for_job(&harness.store, &job.id, "job completion", |j| {
        j.status.is_terminal()
    })
    .await;
    // The 429 was retryable: the second attempt succeeds.
    assert_eq!(done.status, JobStatus::Completed);

    let tasks = harness.store.list_job_tasks(&job.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].retry_count, 1);

    // The throttle signal escalated the domain's learned delay and floor.
    let pacing = harness.store.domain_pacing(done.domain_id).await.unwrap();
    assert!(pacing.adaptive_delay_secs >= 1.0);
    assert!(pacing.floor_secs > 0.0);

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_flight_skips_queued_tasks_and_drains_running_ones() {
    let urls: Vec<String> = (0..40)
        .map(|i| format!("https://example.com/page-{i}"))
        .collect();
    let crawler = FakeCrawler::with_delay(Duration::from_millis(30));
    let source = StaticSource::with_urls(urls);
    let harness = start_harness(crawler, source, 5);

    let mut options = JobOptions::new("example.com");
    options.concurrency = 5;
    let job = harness.manager.create_job(options).await.unwrap();

    // Let roughly a quarter of the job finish before cancelling.
    wait_for_job(&harness.store, &job.id, "partial progress", |j| {
        j.counters.completed >= 10
    })
    .await;
    let cancelled = harness.manager.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // In-flight tasks complete naturally; nothing new starts.
    let settled = wait_for_job(&harness.store, &job.id, "running tasks to drain", |j| {
        j.counters.running == 0
    })
    .await;
    assert_eq!(settled.status, JobStatus::Cancelled);
    assert!(settled.counters.is_conserved());
    assert!(settled.counters.completed >= 10);
    assert!(settled.counters.skipped >= 30);
    assert_eq!(settled.counters.pending, 0);
    assert_eq!(settled.counters.waiting, 0);
    assert_eq!(
        settled.counters.completed + settled.counters.skipped,
        settled.counters.total
    );

    // Terminal status is frozen even though results kept arriving.
    assert!(harness.store.notifications().is_empty());

    harness.pool.request_stop();
    harness.pool.wait().await.unwrap();
}

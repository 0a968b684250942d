//! The `Store` trait: the persistence seam of the orchestration core.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warmfront_core::crawl::CrawlOutcome;
use warmfront_core::model::{Job, JobOptions, Scheduler, SourceKind, Task};

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the caller should back off and retry.
    ///
    /// Connection loss, pool exhaustion and serialization/deadlock rollbacks
    /// are transient; everything else is a programming or data error.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    // 40001 serialization_failure, 40P01 deadlock_detected.
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// One URL to enqueue as a task.
#[derive(Debug, Clone)]
pub struct EnqueueEntry {
    pub page_id: i64,
    /// Request-URI form: path plus query string.
    pub path: String,
    pub source: SourceKind,
    pub source_url: Option<String>,
    pub priority: f64,
    /// Matched an explicit exclusion rule: the row is inserted directly in
    /// `skipped` status so accounting keeps a trace of it.
    pub excluded: bool,
}

impl EnqueueEntry {
    pub fn new(page_id: i64, path: impl Into<String>, source: SourceKind) -> Self {
        Self {
            page_id,
            path: path.into(),
            source,
            source_url: None,
            priority: source.base_priority(),
            excluded: false,
        }
    }
}

/// What happened to a batch of enqueue entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Countable task rows created (`pending` or `waiting`).
    pub inserted: usize,
    /// Rows created directly in `skipped` status for excluded paths.
    pub excluded: usize,
    /// Entries dropped as `(job, page)` duplicates.
    pub duplicate: usize,
    /// Entries refused because the job's `max_pages` cap was reached.
    pub capped: usize,
}

impl EnqueueOutcome {
    /// Entries that produced no countable task.
    pub fn skipped(&self) -> usize {
        self.excluded + self.duplicate + self.capped
    }
}

/// A task handed to a worker by the atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub domain_id: i64,
    pub domain: String,
    pub org_id: Option<String>,
    pub find_links: bool,
}

impl ClaimedTask {
    /// Fully-qualified URL for the crawl.
    pub fn url(&self) -> String {
        format!("https://{}{}", self.domain, self.task.path)
    }
}

/// A task-result write funnelled through the batching queue.
#[derive(Debug, Clone)]
pub enum TaskOp {
    Complete {
        task_id: String,
        outcome: Box<CrawlOutcome>,
    },
    Fail {
        task_id: String,
        error: String,
        retryable: bool,
    },
}

impl TaskOp {
    pub fn task_id(&self) -> &str {
        match self {
            TaskOp::Complete { task_id, .. } | TaskOp::Fail { task_id, .. } => task_id,
        }
    }
}

/// Result of applying a batch of task ops in one transaction.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    /// Jobs where a task left `running`: promotion candidates.
    pub released_jobs: Vec<String>,
    /// Jobs that reached a terminal state during this batch.
    pub finished_jobs: Vec<String>,
}

/// Learned pacing state for a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DomainPacing {
    pub adaptive_delay_secs: f64,
    pub floor_secs: f64,
    /// robots.txt `Crawl-delay`, when one was seen.
    pub crawl_delay_secs: Option<f64>,
}

/// Result of a stuck-entity scan: total count plus a bounded sample.
#[derive(Debug, Clone)]
pub struct StuckScan<T> {
    pub total: usize,
    pub samples: Vec<T>,
}

impl<T> StuckScan<T> {
    pub fn empty() -> Self {
        Self {
            total: 0,
            samples: Vec::new(),
        }
    }
}

/// The persistence seam. The database is the task queue: no in-memory queue
/// of tasks exists anywhere above this trait.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Domains and pages.

    async fn get_or_create_domain(&self, name: &str) -> StoreResult<i64>;
    async fn get_or_create_page(&self, domain_id: i64, path: &str) -> StoreResult<i64>;
    /// Bulk variant of [`Store::get_or_create_page`]; ids are returned in
    /// input order.
    async fn get_or_create_pages(&self, domain_id: i64, paths: &[String]) -> StoreResult<Vec<i64>>;
    async fn domain_pacing(&self, domain_id: i64) -> StoreResult<DomainPacing>;
    async fn update_domain_pacing(
        &self,
        domain_id: i64,
        adaptive_delay_secs: f64,
        floor_secs: f64,
    ) -> StoreResult<()>;
    async fn set_domain_crawl_delay(
        &self,
        domain_id: i64,
        crawl_delay_secs: Option<f64>,
    ) -> StoreResult<()>;

    // Jobs.

    async fn create_job(&self, options: &JobOptions) -> StoreResult<Job>;
    async fn get_job(&self, job_id: &str) -> StoreResult<Job>;
    /// Cancel a job: terminal `cancelled`, `pending`/`waiting` tasks flip to
    /// `skipped`, in-flight tasks drain naturally. Idempotent on terminal
    /// jobs.
    async fn cancel_job(&self, job_id: &str) -> StoreResult<Job>;
    async fn set_job_error_message(&self, job_id: &str, message: &str) -> StoreResult<()>;
    /// Finalise the job if every countable task is terminal. Returns whether
    /// a transition happened.
    async fn complete_job_if_done(&self, job_id: &str) -> StoreResult<bool>;
    /// Recount job counters from task ground truth, repairing drift, and
    /// refresh aggregated stats. Holds a per-job advisory lock.
    async fn recalculate_job_stats(&self, job_id: &str) -> StoreResult<Job>;

    // Tasks.

    /// Bulk-insert tasks for a job. Deduplicates on `(job_id, page_id)`,
    /// enforces `max_pages` on every call, computes each task's initial
    /// status (`pending` if the job has capacity and the organisation has
    /// quota, else `waiting`; `skipped` for excluded entries).
    async fn enqueue_tasks(
        &self,
        job_id: &str,
        entries: &[EnqueueEntry],
    ) -> StoreResult<EnqueueOutcome>;

    /// The hot path: atomically claim one `pending` task from a claimable
    /// job whose organisation has quota, flip it to `running`, and bump the
    /// job's running counter. Ordering is `priority_score DESC, created_at
    /// ASC`. Concurrent claimers never contend on the same row.
    async fn claim_next_task(&self) -> StoreResult<Option<ClaimedTask>>;

    /// Apply a batch of task results in a single transaction, tasks before
    /// job-level recomputation. Retryable failures under the retry budget
    /// re-queue the task to `pending`; terminal outcomes advance job
    /// progress and daily usage.
    async fn apply_task_results(&self, ops: Vec<TaskOp>) -> StoreResult<BatchOutcome>;

    /// Best-effort promotion of one `waiting` task to `pending` for this
    /// job, respecting job concurrency and org quota.
    async fn promote_waiting_task_for_job(&self, job_id: &str) -> StoreResult<bool>;

    /// Bulk promotion across an organisation's jobs after a quota reset,
    /// capped by remaining quota and per-job capacity. Returns the number of
    /// tasks promoted.
    async fn promote_waiting_tasks_for_org(&self, org_id: &str, limit: usize)
    -> StoreResult<usize>;

    async fn list_job_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>>;

    // Quota.

    /// Unblock organisations whose `quota_exhausted_until` has passed;
    /// returns their ids for wake-up signalling.
    async fn clear_expired_quota_blocks(&self) -> StoreResult<Vec<String>>;

    // Schedulers.

    async fn get_schedulers_ready_to_run(&self, limit: usize) -> StoreResult<Vec<Scheduler>>;
    async fn update_scheduler_next_run(
        &self,
        scheduler_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn get_last_job_start_for_scheduler(
        &self,
        scheduler_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    // Health.

    /// Jobs at terminal progress still marked `running` (counter-trigger
    /// lag): finalise them. Returns the job ids transitioned.
    async fn finalize_lagging_jobs(&self) -> StoreResult<Vec<String>>;
    async fn scan_stuck_jobs(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Job>>;
    async fn scan_stuck_tasks(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Task>>;
    /// Reset `running` tasks older than the threshold back to `pending`
    /// (or `failed` once the retry budget is exhausted).
    async fn reset_stuck_tasks(
        &self,
        running_threshold: Duration,
        limit: usize,
    ) -> StoreResult<usize>;

    // Convenience single-op wrappers over the batch path.

    async fn complete_task(&self, task_id: &str, outcome: CrawlOutcome) -> StoreResult<()> {
        self.apply_task_results(vec![TaskOp::Complete {
            task_id: task_id.to_string(),
            outcome: Box::new(outcome),
        }])
        .await
        .map(|_| ())
    }

    async fn fail_task(&self, task_id: &str, error: &str, retryable: bool) -> StoreResult<()> {
        self.apply_task_results(vec![TaskOp::Fail {
            task_id: task_id.to_string(),
            error: error.to_string(),
            retryable,
        }])
        .await
        .map(|_| ())
    }
}

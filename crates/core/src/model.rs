//! Core persistent entities: domains, pages, organisations, jobs, tasks and
//! recurring schedules.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseStatusError;

/// Retry budget applied centrally when a task fails with a retryable error.
pub const MAX_TASK_RETRIES: i32 = 3;

/// Mint a new job id.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mint a new task id.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mint a new notification id.
pub fn new_notification_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created; no task has been claimed yet.
    Pending,
    /// At least one task has been claimed.
    Running,
    /// All countable tasks reached a terminal state.
    Completed,
    /// Marked failed by an operator or recovery path.
    Failed,
    /// Cancelled by the caller; remaining tasks were skipped.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal job states are frozen: no later event may change them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseStatusError::job(other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Eligible for claiming.
    Pending,
    /// Parked until job capacity or organisation quota frees up.
    Waiting,
    /// Claimed by a worker.
    Running,
    /// Crawled successfully.
    Completed,
    /// Failed permanently (or exhausted the retry budget).
    Failed,
    /// Excluded by filters or a job cancellation; never crawled.
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(ParseStatusError::task(other)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task's URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Listed in the domain's sitemap.
    Sitemap,
    /// Extracted from a crawled page (`find_links` jobs only).
    Discovered,
    /// Submitted explicitly by the caller.
    Manual,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Sitemap => "sitemap",
            SourceKind::Discovered => "discovered",
            SourceKind::Manual => "manual",
        }
    }

    /// Baseline priority score for tasks of this source.
    ///
    /// Manual URLs outrank sitemap URLs, which outrank links picked up
    /// mid-crawl.
    pub fn base_priority(self) -> f64 {
        match self {
            SourceKind::Manual => 5.0,
            SourceKind::Sitemap => 1.0,
            SourceKind::Discovered => 0.5,
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sitemap" => Ok(SourceKind::Sitemap),
            "discovered" => Ok(SourceKind::Discovered),
            "manual" => Ok(SourceKind::Manual),
            other => Err(ParseStatusError::source(other)),
        }
    }
}

/// Per-job task counters, maintained transactionally with task transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: i64,
    pub pending: i64,
    pub waiting: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    /// Tasks sourced from the sitemap.
    pub sitemap: i64,
    /// Tasks sourced from mid-crawl link discovery.
    pub found: i64,
}

impl JobCounters {
    /// Tasks that count toward progress (everything except skipped).
    pub fn countable(&self) -> i64 {
        self.total - self.skipped
    }

    /// Progress percentage in `0.0..=100.0`; zero when nothing is countable.
    pub fn progress(&self) -> f64 {
        let countable = self.countable();
        if countable <= 0 {
            return 0.0;
        }
        100.0 * (self.completed + self.failed) as f64 / countable as f64
    }

    /// Whether every countable task has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.completed + self.failed >= self.countable()
    }

    /// Counter-conservation check: the per-status counters must sum to the
    /// total when the job is at rest.
    pub fn is_conserved(&self) -> bool {
        self.pending + self.waiting + self.running + self.completed + self.failed + self.skipped
            == self.total
    }
}

/// Options supplied when creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Host name to warm (e.g. `example.com`).
    pub domain: String,
    /// Owning organisation, when the job is tenant-scoped.
    pub org_id: Option<String>,
    /// Max simultaneously running tasks; 0 means unlimited.
    pub concurrency: i32,
    /// Whether links discovered during crawling are enqueued as extra tasks.
    pub find_links: bool,
    /// Hard cap on tasks for this job; 0 means unlimited.
    pub max_pages: i64,
    /// Path prefixes to include (empty = include everything).
    pub include_paths: Vec<String>,
    /// Path prefixes to exclude (wins over include).
    pub exclude_paths: Vec<String>,
    /// Advisory worker count requested for this job.
    pub required_workers: i32,
    /// Recurring schedule that produced this job, if any.
    pub scheduler_id: Option<String>,
    /// Free-form source metadata (e.g. `dashboard`, `schedule`).
    pub source: Option<String>,
}

impl JobOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            org_id: None,
            concurrency: 0,
            find_links: false,
            max_pages: 0,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            required_workers: 0,
            scheduler_id: None,
            source: None,
        }
    }
}

/// One crawl run over a domain.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub domain_id: i64,
    pub domain: String,
    pub org_id: Option<String>,
    pub status: JobStatus,
    pub concurrency: i32,
    pub find_links: bool,
    pub max_pages: i64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: i32,
    pub scheduler_id: Option<String>,
    pub source: Option<String>,
    pub counters: JobCounters,
    /// Job-level anomaly note (e.g. empty URL source). Does not imply failure.
    pub error_message: Option<String>,
    /// Aggregated crawl statistics, folded in when the job completes.
    pub stats: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn progress(&self) -> f64 {
        self.counters.progress()
    }
}

/// One URL processing attempt bound to a job and page.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub page_id: i64,
    /// Request-URI form: path plus query string.
    pub path: String,
    pub status: TaskStatus,
    pub priority_score: f64,
    pub retry_count: i32,
    pub source: SourceKind,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i64>,
    pub cache_status: Option<String>,
    pub second_response_time_ms: Option<i64>,
    pub second_cache_status: Option<String>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub timing: Option<crate::crawl::TimingBreakdown>,
    pub redirect_url: Option<String>,
    pub error: Option<String>,
}

/// Tenant record. Only the quota marker is mutated by the core.
#[derive(Debug, Clone)]
pub struct Organisation {
    pub id: String,
    pub plan_id: String,
    /// Blocked until this instant; cleared by the quota sweep at UTC midnight.
    pub quota_exhausted_until: Option<DateTime<Utc>>,
}

/// Subscription tier.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    /// Pages per UTC day; 0 means unlimited.
    pub daily_page_limit: i64,
}

/// Recurring job template.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub id: String,
    pub domain: String,
    pub org_id: Option<String>,
    /// One of 6, 12, 24 or 48.
    pub interval_hours: i32,
    pub next_run_at: DateTime<Utc>,
    pub is_enabled: bool,
    pub concurrency: i32,
    pub find_links: bool,
    pub max_pages: i64,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: i32,
}

impl Scheduler {
    /// Job options for one materialised run of this schedule.
    pub fn options_for_run(&self) -> JobOptions {
        JobOptions {
            domain: self.domain.clone(),
            org_id: self.org_id.clone(),
            concurrency: self.concurrency,
            find_links: self.find_links,
            max_pages: self.max_pages,
            include_paths: self.include_paths.clone(),
            exclude_paths: self.exclude_paths.clone(),
            required_workers: self.required_workers,
            scheduler_id: Some(self.id.clone()),
            source: Some("schedule".to_string()),
        }
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.interval_hours.max(1) as i64)
    }
}

/// Kind of notification synthesised on a job's terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobCompleted,
    JobFailed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::JobCompleted => "job_completed",
            NotificationKind::JobFailed => "job_failed",
        }
    }
}

/// Notification row produced for an external delivery layer.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub job_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// The UTC calendar date used for daily-usage accounting.
pub fn utc_usage_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// The next UTC midnight strictly after `now`; quota blocks expire here.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or_else(|| now.date_naive());
    tomorrow
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| now.naive_utc())
        .and_utc()
}

//! Postgres `Store` implementation.
//!
//! All state transitions are transactional. The claim path is a single
//! statement using `FOR UPDATE SKIP LOCKED` against the partial index on
//! pending tasks, so concurrent workers never contend on the same row. Job
//! counters are maintained in the same transaction as the task transition
//! they reflect; batch flushes order their writes tasks → daily_usage → jobs
//! to keep lock acquisition consistent across callers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use tracing::debug;

use warmfront_core::crawl::{CrawlOutcome, TimingBreakdown};
use warmfront_core::model::{
    self, Job, JobCounters, JobOptions, JobStatus, NotificationKind, Scheduler, SourceKind, Task,
    TaskStatus, MAX_TASK_RETRIES,
};

use crate::api::{
    BatchOutcome, ClaimedTask, DomainPacing, EnqueueEntry, EnqueueOutcome, Store, StoreError,
    StoreResult, StuckScan, TaskOp,
};

const JOB_COLUMNS: &str = "j.id, j.domain_id, d.name AS domain_name, j.organisation_id, \
     j.status, j.concurrency, j.find_links, j.max_pages, j.include_paths, j.exclude_paths, \
     j.required_workers, j.scheduler_id, j.source, j.total_tasks, j.pending_tasks, \
     j.waiting_tasks, j.running_tasks, j.completed_tasks, j.failed_tasks, j.skipped_tasks, \
     j.sitemap_tasks, j.found_tasks, j.error_message, j.stats, j.created_at, j.started_at, \
     j.completed_at";

const TASK_COLUMNS: &str = "t.id, t.job_id, t.page_id, t.path, t.status, t.priority_score, \
     t.retry_count, t.source, t.source_url, t.created_at, t.started_at, t.completed_at, \
     t.status_code, t.response_time_ms, t.cache_status, t.second_response_time_ms, \
     t.second_cache_status, t.content_length, t.content_type, t.headers, t.dns_ms, \
     t.connect_ms, t.tls_ms, t.ttfb_ms, t.transfer_ms, t.redirect_url, t.error";

/// Connection settings for [`PgStore`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    /// Dedicated pool for the batched result queue, when configured.
    pub queue_database_url: Option<String>,
    pub max_connections: u32,
    pub queue_max_connections: u32,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            queue_database_url: None,
            max_connections: 20,
            queue_max_connections: 4,
        }
    }
}

/// Postgres-backed store; see the module docs.
pub struct PgStore {
    pool: PgPool,
    /// Pool used by `apply_task_results`; a dedicated pool keeps batch
    /// flushes from starving interactive queries.
    queue_pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await?;
        let queue_pool = match &config.queue_database_url {
            Some(url) => {
                PgPoolOptions::new()
                    .max_connections(config.queue_max_connections.max(1))
                    .connect(url)
                    .await?
            }
            None => pool.clone(),
        };
        Ok(Self { pool, queue_pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Invalid(format!("migration failed: {err}")))
    }

    pub async fn close(&self) {
        self.queue_pool.close().await;
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    domain_id: i64,
    domain_name: String,
    organisation_id: Option<String>,
    status: String,
    concurrency: i32,
    find_links: bool,
    max_pages: i64,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
    required_workers: i32,
    scheduler_id: Option<String>,
    source: Option<String>,
    total_tasks: i64,
    pending_tasks: i64,
    waiting_tasks: i64,
    running_tasks: i64,
    completed_tasks: i64,
    failed_tasks: i64,
    skipped_tasks: i64,
    sitemap_tasks: i64,
    found_tasks: i64,
    error_message: Option<String>,
    stats: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> StoreResult<Job> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|err| StoreError::Invalid(format!("job {}: {err}", self.id)))?;
        Ok(Job {
            id: self.id,
            domain_id: self.domain_id,
            domain: self.domain_name,
            org_id: self.organisation_id,
            status,
            concurrency: self.concurrency,
            find_links: self.find_links,
            max_pages: self.max_pages,
            include_paths: self.include_paths,
            exclude_paths: self.exclude_paths,
            required_workers: self.required_workers,
            scheduler_id: self.scheduler_id,
            source: self.source,
            counters: JobCounters {
                total: self.total_tasks,
                pending: self.pending_tasks,
                waiting: self.waiting_tasks,
                running: self.running_tasks,
                completed: self.completed_tasks,
                failed: self.failed_tasks,
                skipped: self.skipped_tasks,
                sitemap: self.sitemap_tasks,
                found: self.found_tasks,
            },
            error_message: self.error_message,
            stats: self.stats,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    job_id: String,
    page_id: i64,
    path: String,
    status: String,
    priority_score: f64,
    retry_count: i32,
    source: String,
    source_url: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    status_code: Option<i32>,
    response_time_ms: Option<i64>,
    cache_status: Option<String>,
    second_response_time_ms: Option<i64>,
    second_cache_status: Option<String>,
    content_length: Option<i64>,
    content_type: Option<String>,
    headers: Option<serde_json::Value>,
    dns_ms: Option<i64>,
    connect_ms: Option<i64>,
    tls_ms: Option<i64>,
    ttfb_ms: Option<i64>,
    transfer_ms: Option<i64>,
    redirect_url: Option<String>,
    error: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|err| StoreError::Invalid(format!("task {}: {err}", self.id)))?;
        let source: SourceKind = self
            .source
            .parse()
            .map_err(|err| StoreError::Invalid(format!("task {}: {err}", self.id)))?;
        let has_timing = self.dns_ms.is_some()
            || self.connect_ms.is_some()
            || self.tls_ms.is_some()
            || self.ttfb_ms.is_some()
            || self.transfer_ms.is_some();
        Ok(Task {
            id: self.id,
            job_id: self.job_id,
            page_id: self.page_id,
            path: self.path,
            status,
            priority_score: self.priority_score,
            retry_count: self.retry_count,
            source,
            source_url: self.source_url,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status_code: self.status_code,
            response_time_ms: self.response_time_ms,
            cache_status: self.cache_status,
            second_response_time_ms: self.second_response_time_ms,
            second_cache_status: self.second_cache_status,
            content_length: self.content_length,
            content_type: self.content_type,
            headers: self.headers,
            timing: has_timing.then(|| TimingBreakdown {
                dns_ms: self.dns_ms.map(|v| v as u64),
                connect_ms: self.connect_ms.map(|v| v as u64),
                tls_ms: self.tls_ms.map(|v| v as u64),
                ttfb_ms: self.ttfb_ms.map(|v| v as u64),
                transfer_ms: self.transfer_ms.map(|v| v as u64),
            }),
            redirect_url: self.redirect_url,
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SchedulerRow {
    id: String,
    domain_name: String,
    organisation_id: Option<String>,
    schedule_interval_hours: i32,
    next_run_at: DateTime<Utc>,
    is_enabled: bool,
    concurrency: i32,
    find_links: bool,
    max_pages: i64,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
    required_workers: i32,
}

impl SchedulerRow {
    fn into_scheduler(self) -> Scheduler {
        Scheduler {
            id: self.id,
            domain: self.domain_name,
            org_id: self.organisation_id,
            interval_hours: self.schedule_interval_hours,
            next_run_at: self.next_run_at,
            is_enabled: self.is_enabled,
            concurrency: self.concurrency,
            find_links: self.find_links,
            max_pages: self.max_pages,
            include_paths: self.include_paths,
            exclude_paths: self.exclude_paths,
            required_workers: self.required_workers,
        }
    }
}

#[derive(Default)]
struct JobDelta {
    running: i64,
    pending: i64,
    completed: i64,
    failed: i64,
}

async fn fetch_job(conn: &mut PgConnection, job_id: &str) -> StoreResult<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs j JOIN domains d ON d.id = j.domain_id WHERE j.id = $1"
    ))
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(JobRow::into_job).transpose()
}

async fn aggregate_stats(conn: &mut PgConnection, job_id: &str) -> StoreResult<serde_json::Value> {
    let (completed, avg_response, cache_hits, avg_second): (i64, i64, i64, i64) =
        sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = 'completed'), \
                    COALESCE(AVG(response_time_ms) FILTER (WHERE status = 'completed'), 0)::BIGINT, \
                    COUNT(*) FILTER (WHERE status = 'completed' AND cache_status = 'hit'), \
                    COALESCE(AVG(second_response_time_ms) \
                             FILTER (WHERE second_response_time_ms IS NOT NULL), 0)::BIGINT \
             FROM tasks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(serde_json::json!({
        "completed": completed,
        "avg_response_time_ms": avg_response,
        "cache_hit_ratio": if completed > 0 { cache_hits as f64 / completed as f64 } else { 0.0 },
        "avg_second_response_time_ms": avg_second,
    }))
}

/// Finalise the job when every countable task is terminal. Returns whether a
/// transition happened. Terminal states are never overwritten (the trigger
/// backstops this as well).
async fn finish_job_if_done(conn: &mut PgConnection, job_id: &str) -> StoreResult<bool> {
    let Some(job) = fetch_job(&mut *conn, job_id).await? else {
        return Ok(false);
    };
    if job.status.is_terminal() || !job.counters.is_done() {
        return Ok(false);
    }

    let stats = aggregate_stats(&mut *conn, job_id).await?;
    let failed_only = job.counters.failed > 0 && job.counters.completed == 0;
    let (status, kind) = if failed_only {
        (JobStatus::Failed, NotificationKind::JobFailed)
    } else {
        (JobStatus::Completed, NotificationKind::JobCompleted)
    };

    let updated = sqlx::query(
        "UPDATE jobs SET status = $2, completed_at = now(), stats = $3 \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(&stats)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Ok(false);
    }

    let message = format!(
        "job {job_id} {status}: {} completed, {} failed, {} skipped",
        job.counters.completed, job.counters.failed, job.counters.skipped
    );
    sqlx::query(
        "INSERT INTO notifications (id, job_id, kind, message) VALUES ($1, $2, $3, $4)",
    )
    .bind(model::new_notification_id())
    .bind(job_id)
    .bind(kind.as_str())
    .bind(&message)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Record terminal outcomes against today's usage and set the quota marker
/// once the plan limit is reached. Idempotent on the marker.
async fn record_usage(conn: &mut PgConnection, org_id: &str, pages: i64) -> StoreResult<()> {
    let used: i64 = sqlx::query_scalar(
        "INSERT INTO daily_usage (organisation_id, usage_date, pages_processed) \
         VALUES ($1, (now() AT TIME ZONE 'utc')::date, $2) \
         ON CONFLICT (organisation_id, usage_date) \
         DO UPDATE SET pages_processed = daily_usage.pages_processed + EXCLUDED.pages_processed \
         RETURNING pages_processed",
    )
    .bind(org_id)
    .bind(pages)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE organisations o \
            SET quota_exhausted_until = \
                (((now() AT TIME ZONE 'utc')::date + 1)::timestamp AT TIME ZONE 'utc') \
           FROM plans p \
          WHERE o.id = $1 AND p.id = o.plan_id \
            AND p.daily_page_limit > 0 AND $2 >= p.daily_page_limit \
            AND (o.quota_exhausted_until IS NULL \
                 OR o.quota_exhausted_until < \
                    (((now() AT TIME ZONE 'utc')::date + 1)::timestamp AT TIME ZONE 'utc'))",
    )
    .bind(org_id)
    .bind(used)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_domain(&self, name: &str) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO domains (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_or_create_page(&self, domain_id: i64, path: &str) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pages (domain_id, path) VALUES ($1, $2) \
             ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path \
             RETURNING id",
        )
        .bind(domain_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_or_create_pages(&self, domain_id: i64, paths: &[String]) -> StoreResult<Vec<i64>> {
        let mut conn = self.pool.acquire().await?;
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO pages (domain_id, path) VALUES ($1, $2) \
                 ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path \
                 RETURNING id",
            )
            .bind(domain_id)
            .bind(path)
            .fetch_one(&mut *conn)
            .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn domain_pacing(&self, domain_id: i64) -> StoreResult<DomainPacing> {
        let row: Option<(f64, f64, Option<f64>)> = sqlx::query_as(
            "SELECT adaptive_delay_seconds, adaptive_delay_floor_seconds, crawl_delay_seconds \
             FROM domains WHERE id = $1",
        )
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?;
        let (adaptive_delay_secs, floor_secs, crawl_delay_secs) =
            row.ok_or_else(|| StoreError::NotFound(format!("domain {domain_id}")))?;
        Ok(DomainPacing {
            adaptive_delay_secs,
            floor_secs,
            crawl_delay_secs,
        })
    }

    async fn update_domain_pacing(
        &self,
        domain_id: i64,
        adaptive_delay_secs: f64,
        floor_secs: f64,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE domains SET adaptive_delay_seconds = $2, adaptive_delay_floor_seconds = $3 \
             WHERE id = $1",
        )
        .bind(domain_id)
        .bind(adaptive_delay_secs)
        .bind(floor_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("domain {domain_id}")));
        }
        Ok(())
    }

    async fn set_domain_crawl_delay(
        &self,
        domain_id: i64,
        crawl_delay_secs: Option<f64>,
    ) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE domains SET crawl_delay_seconds = $2 WHERE id = $1")
            .bind(domain_id)
            .bind(crawl_delay_secs)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("domain {domain_id}")));
        }
        Ok(())
    }

    async fn create_job(&self, options: &JobOptions) -> StoreResult<Job> {
        let domain_id = self.get_or_create_domain(&options.domain).await?;
        let job_id = model::new_job_id();
        sqlx::query(
            "INSERT INTO jobs (id, domain_id, organisation_id, concurrency, find_links, \
                               max_pages, include_paths, exclude_paths, required_workers, \
                               scheduler_id, source) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&job_id)
        .bind(domain_id)
        .bind(&options.org_id)
        .bind(options.concurrency.max(0))
        .bind(options.find_links)
        .bind(options.max_pages.max(0))
        .bind(&options.include_paths)
        .bind(&options.exclude_paths)
        .bind(options.required_workers.max(0))
        .bind(&options.scheduler_id)
        .bind(&options.source)
        .execute(&self.pool)
        .await?;
        self.get_job(&job_id).await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut *conn, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn cancel_job(&self, job_id: &str) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let job = fetch_job(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() {
            tx.commit().await?;
            return Ok(job);
        }

        let from_pending = sqlx::query(
            "UPDATE tasks SET status = 'skipped' WHERE job_id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;
        let from_waiting = sqlx::query(
            "UPDATE tasks SET status = 'skipped' WHERE job_id = $1 AND status = 'waiting'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        sqlx::query(
            "UPDATE jobs \
                SET status = 'cancelled', completed_at = now(), \
                    pending_tasks = pending_tasks - $2, \
                    waiting_tasks = waiting_tasks - $3, \
                    skipped_tasks = skipped_tasks + $2 + $3 \
              WHERE id = $1",
        )
        .bind(job_id)
        .bind(from_pending)
        .bind(from_waiting)
        .execute(&mut *tx)
        .await?;

        let cancelled = fetch_job(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        tx.commit().await?;
        Ok(cancelled)
    }

    async fn set_job_error_message(&self, job_id: &str, message: &str) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE jobs SET error_message = $2 WHERE id = $1")
            .bind(job_id)
            .bind(message)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn complete_job_if_done(&self, job_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let finished = finish_job_if_done(&mut *tx, job_id).await?;
        tx.commit().await?;
        Ok(finished)
    }

    async fn recalculate_job_stats(&self, job_id: &str) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        // Serialise against concurrent recalculations and batch flushes for
        // this job without blocking the claim path.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        if fetch_job(&mut *tx, job_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }

        let counts: (i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COUNT(*) FILTER (WHERE status = 'pending'), \
                    COUNT(*) FILTER (WHERE status = 'waiting'), \
                    COUNT(*) FILTER (WHERE status = 'running'), \
                    COUNT(*) FILTER (WHERE status = 'completed'), \
                    COUNT(*) FILTER (WHERE status = 'failed'), \
                    COUNT(*) FILTER (WHERE status = 'skipped'), \
                    COUNT(*) FILTER (WHERE source = 'sitemap'), \
                    COUNT(*) FILTER (WHERE source = 'discovered') \
             FROM tasks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let stats = aggregate_stats(&mut *tx, job_id).await?;
        sqlx::query(
            "UPDATE jobs SET total_tasks = $2, pending_tasks = $3, waiting_tasks = $4, \
                    running_tasks = $5, completed_tasks = $6, failed_tasks = $7, \
                    skipped_tasks = $8, sitemap_tasks = $9, found_tasks = $10, stats = $11 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(counts.0)
        .bind(counts.1)
        .bind(counts.2)
        .bind(counts.3)
        .bind(counts.4)
        .bind(counts.5)
        .bind(counts.6)
        .bind(counts.7)
        .bind(counts.8)
        .bind(&stats)
        .execute(&mut *tx)
        .await?;

        if counts.0 > 0 {
            finish_job_if_done(&mut *tx, job_id).await?;
        }
        let job = fetch_job(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        tx.commit().await?;
        Ok(job)
    }

    async fn enqueue_tasks(
        &self,
        job_id: &str,
        entries: &[EnqueueEntry],
    ) -> StoreResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs j JOIN domains d ON d.id = j.domain_id \
             WHERE j.id = $1 FOR UPDATE OF j"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(JobRow::into_job)
        .transpose()?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() {
            return Err(StoreError::Conflict(format!("job {job_id} is {}", job.status)));
        }

        // Remaining quota admissions for this batch: tasks beyond the org's
        // remaining daily budget start in `waiting` rather than `pending`.
        let mut quota_slots: i64 = i64::MAX;
        if let Some(org_id) = &job.org_id {
            let row: Option<(bool, i64, i64)> = sqlx::query_as(
                "SELECT (o.quota_exhausted_until IS NOT NULL \
                         AND o.quota_exhausted_until > now()), \
                        p.daily_page_limit, \
                        COALESCE(u.pages_processed, 0) \
                   FROM organisations o \
                   JOIN plans p ON p.id = o.plan_id \
                   LEFT JOIN daily_usage u ON u.organisation_id = o.id \
                        AND u.usage_date = (now() AT TIME ZONE 'utc')::date \
                  WHERE o.id = $1",
            )
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await?;
            match row {
                Some((true, _, _)) => quota_slots = 0,
                Some((false, limit, used)) if limit > 0 => {
                    let admitted = job.counters.pending + job.counters.running;
                    quota_slots = (limit - used - admitted).max(0);
                }
                _ => {}
            }
        }

        let mut countable = job.counters.total - job.counters.skipped;
        let mut admitted = job.counters.running + job.counters.pending;
        let mut delta = JobCounters::default();
        let mut outcome = EnqueueOutcome::default();

        for entry in entries {
            let status = if entry.excluded {
                TaskStatus::Skipped
            } else {
                if job.max_pages > 0 && countable >= job.max_pages {
                    outcome.capped += 1;
                    continue;
                }
                if (job.concurrency <= 0 || admitted < job.concurrency as i64) && quota_slots > 0
                {
                    quota_slots -= 1;
                    TaskStatus::Pending
                } else {
                    TaskStatus::Waiting
                }
            };

            let inserted = sqlx::query(
                "INSERT INTO tasks (id, job_id, page_id, path, status, priority_score, \
                                    source, source_url) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (job_id, page_id) DO NOTHING",
            )
            .bind(model::new_task_id())
            .bind(job_id)
            .bind(entry.page_id)
            .bind(&entry.path)
            .bind(status.as_str())
            .bind(entry.priority)
            .bind(entry.source.as_str())
            .bind(&entry.source_url)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted == 0 {
                outcome.duplicate += 1;
                continue;
            }

            delta.total += 1;
            match status {
                TaskStatus::Pending => {
                    delta.pending += 1;
                    admitted += 1;
                    countable += 1;
                    outcome.inserted += 1;
                }
                TaskStatus::Waiting => {
                    delta.waiting += 1;
                    countable += 1;
                    outcome.inserted += 1;
                }
                TaskStatus::Skipped => {
                    delta.skipped += 1;
                    outcome.excluded += 1;
                }
                _ => unreachable!("initial status is pending, waiting or skipped"),
            }
            match entry.source {
                SourceKind::Sitemap => delta.sitemap += 1,
                SourceKind::Discovered => delta.found += 1,
                SourceKind::Manual => {}
            }
        }

        if delta.total > 0 {
            sqlx::query(
                "UPDATE jobs SET total_tasks = total_tasks + $2, \
                        pending_tasks = pending_tasks + $3, \
                        waiting_tasks = waiting_tasks + $4, \
                        skipped_tasks = skipped_tasks + $5, \
                        sitemap_tasks = sitemap_tasks + $6, \
                        found_tasks = found_tasks + $7 \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(delta.total)
            .bind(delta.pending)
            .bind(delta.waiting)
            .bind(delta.skipped)
            .bind(delta.sitemap)
            .bind(delta.found)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_next_task(&self) -> StoreResult<Option<ClaimedTask>> {
        #[derive(sqlx::FromRow)]
        struct ClaimRow {
            #[sqlx(flatten)]
            task: TaskRow,
            domain_id: i64,
            domain_name: String,
            organisation_id: Option<String>,
            find_links: bool,
        }

        let row = sqlx::query_as::<_, ClaimRow>(&format!(
            "WITH candidate AS ( \
                 SELECT t.id \
                   FROM tasks t \
                   JOIN jobs j ON j.id = t.job_id \
                   LEFT JOIN organisations o ON o.id = j.organisation_id \
                   LEFT JOIN plans p ON p.id = o.plan_id \
                   LEFT JOIN daily_usage u ON u.organisation_id = o.id \
                        AND u.usage_date = (now() AT TIME ZONE 'utc')::date \
                  WHERE t.status = 'pending' \
                    AND j.status IN ('pending', 'running') \
                    AND (j.concurrency <= 0 OR j.running_tasks < j.concurrency) \
                    AND (o.id IS NULL OR o.quota_exhausted_until IS NULL \
                         OR o.quota_exhausted_until <= now()) \
                    AND (o.id IS NULL OR p.id IS NULL OR p.daily_page_limit <= 0 \
                         OR COALESCE(u.pages_processed, 0) < p.daily_page_limit) \
                  ORDER BY t.priority_score DESC, t.created_at ASC \
                  LIMIT 1 \
                  FOR UPDATE OF t SKIP LOCKED \
             ), claimed AS ( \
                 UPDATE tasks t SET status = 'running', started_at = now() \
                   FROM candidate c WHERE t.id = c.id \
                 RETURNING {TASK_COLUMNS} \
             ), bumped AS ( \
                 UPDATE jobs j \
                    SET running_tasks = j.running_tasks + 1, \
                        pending_tasks = j.pending_tasks - 1, \
                        status = CASE WHEN j.status = 'pending' THEN 'running' ELSE j.status END, \
                        started_at = COALESCE(j.started_at, now()) \
                   FROM claimed c WHERE j.id = c.job_id \
                 RETURNING j.id, j.domain_id, j.organisation_id, j.find_links \
             ) \
             SELECT {TASK_COLUMNS}, b.domain_id, d.name AS domain_name, \
                    b.organisation_id, b.find_links \
               FROM claimed t \
               JOIN bumped b ON b.id = t.job_id \
               JOIN domains d ON d.id = b.domain_id"
        ))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ClaimedTask {
            task: row.task.into_task()?,
            domain_id: row.domain_id,
            domain: row.domain_name,
            org_id: row.organisation_id,
            find_links: row.find_links,
        }))
    }

    async fn apply_task_results(&self, ops: Vec<TaskOp>) -> StoreResult<BatchOutcome> {
        if ops.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut tx = self.queue_pool.begin().await?;

        let mut job_deltas: BTreeMap<String, JobDelta> = BTreeMap::new();
        let mut usage: BTreeMap<String, i64> = BTreeMap::new();
        let mut touched: Vec<String> = Vec::new();
        let mut applied = 0usize;

        // Task rows first; job and usage rows after, in sorted order.
        for op in &ops {
            let row: Option<(String, String, i32, Option<String>)> = sqlx::query_as(
                "SELECT t.job_id, t.status, t.retry_count, j.organisation_id \
                   FROM tasks t JOIN jobs j ON j.id = t.job_id \
                  WHERE t.id = $1 FOR UPDATE OF t",
            )
            .bind(op.task_id())
            .fetch_optional(&mut *tx)
            .await?;
            let Some((job_id, status, retry_count, org_id)) = row else {
                debug!(task_id = op.task_id(), "result for unknown task dropped");
                continue;
            };
            if status != "running" {
                continue;
            }

            let delta = job_deltas.entry(job_id.clone()).or_default();
            match op {
                TaskOp::Complete { task_id, outcome } => {
                    apply_completed_row(&mut *tx, task_id, outcome).await?;
                    delta.running -= 1;
                    delta.completed += 1;
                    if let Some(org_id) = org_id {
                        *usage.entry(org_id).or_default() += 1;
                    }
                }
                TaskOp::Fail {
                    task_id,
                    error,
                    retryable,
                } => {
                    if *retryable && retry_count < MAX_TASK_RETRIES {
                        sqlx::query(
                            "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, \
                                    error = $2, started_at = NULL \
                             WHERE id = $1",
                        )
                        .bind(task_id)
                        .bind(error)
                        .execute(&mut *tx)
                        .await?;
                        delta.running -= 1;
                        delta.pending += 1;
                    } else {
                        sqlx::query(
                            "UPDATE tasks SET status = 'failed', completed_at = now(), error = $2 \
                             WHERE id = $1",
                        )
                        .bind(task_id)
                        .bind(error)
                        .execute(&mut *tx)
                        .await?;
                        delta.running -= 1;
                        delta.failed += 1;
                        if let Some(org_id) = org_id {
                            *usage.entry(org_id).or_default() += 1;
                        }
                    }
                }
            }
            applied += 1;
            if !touched.contains(&job_id) {
                touched.push(job_id);
            }
        }

        for (org_id, pages) in &usage {
            record_usage(&mut *tx, org_id, *pages).await?;
        }

        for (job_id, delta) in &job_deltas {
            sqlx::query(
                "UPDATE jobs SET running_tasks = running_tasks + $2, \
                        pending_tasks = pending_tasks + $3, \
                        completed_tasks = completed_tasks + $4, \
                        failed_tasks = failed_tasks + $5 \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(delta.running)
            .bind(delta.pending)
            .bind(delta.completed)
            .bind(delta.failed)
            .execute(&mut *tx)
            .await?;
        }

        let mut outcome = BatchOutcome {
            applied,
            ..BatchOutcome::default()
        };
        for job_id in touched {
            if finish_job_if_done(&mut *tx, &job_id).await? {
                outcome.finished_jobs.push(job_id);
            } else {
                outcome.released_jobs.push(job_id);
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn promote_waiting_task_for_job(&self, job_id: &str) -> StoreResult<bool> {
        let promoted: i64 = sqlx::query_scalar(
            "WITH eligible AS ( \
                 SELECT j.id \
                   FROM jobs j \
                   LEFT JOIN organisations o ON o.id = j.organisation_id \
                   LEFT JOIN plans p ON p.id = o.plan_id \
                   LEFT JOIN daily_usage u ON u.organisation_id = o.id \
                        AND u.usage_date = (now() AT TIME ZONE 'utc')::date \
                  WHERE j.id = $1 \
                    AND j.status IN ('pending', 'running') \
                    AND (j.concurrency <= 0 \
                         OR j.running_tasks + j.pending_tasks < j.concurrency) \
                    AND (o.id IS NULL OR o.quota_exhausted_until IS NULL \
                         OR o.quota_exhausted_until <= now()) \
                    AND (o.id IS NULL OR p.id IS NULL OR p.daily_page_limit <= 0 \
                         OR COALESCE(u.pages_processed, 0) \
                            + j.pending_tasks + j.running_tasks < p.daily_page_limit) \
             ), candidate AS ( \
                 SELECT t.id \
                   FROM tasks t JOIN eligible e ON e.id = t.job_id \
                  WHERE t.status = 'waiting' \
                  ORDER BY t.priority_score DESC, t.created_at ASC \
                  LIMIT 1 \
                  FOR UPDATE OF t SKIP LOCKED \
             ), promoted AS ( \
                 UPDATE tasks t SET status = 'pending' \
                   FROM candidate c WHERE t.id = c.id \
                 RETURNING t.id, t.job_id \
             ), bumped AS ( \
                 UPDATE jobs j \
                    SET pending_tasks = j.pending_tasks + 1, \
                        waiting_tasks = j.waiting_tasks - 1 \
                   FROM promoted p WHERE j.id = p.job_id \
                 RETURNING j.id \
             ) \
             SELECT COUNT(*) FROM promoted",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(promoted > 0)
    }

    async fn promote_waiting_tasks_for_org(
        &self,
        org_id: &str,
        limit: usize,
    ) -> StoreResult<usize> {
        let row: Option<(bool, i64, i64)> = sqlx::query_as(
            "SELECT (o.quota_exhausted_until IS NOT NULL AND o.quota_exhausted_until > now()), \
                    p.daily_page_limit, COALESCE(u.pages_processed, 0) \
               FROM organisations o \
               JOIN plans p ON p.id = o.plan_id \
               LEFT JOIN daily_usage u ON u.organisation_id = o.id \
                    AND u.usage_date = (now() AT TIME ZONE 'utc')::date \
              WHERE o.id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((blocked, daily_limit, used)) = row else {
            return Ok(0);
        };
        if blocked {
            return Ok(0);
        }
        let budget = if daily_limit > 0 {
            limit.min((daily_limit - used).max(0) as usize)
        } else {
            limit
        };

        let job_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs \
              WHERE organisation_id = $1 AND status IN ('pending', 'running') \
                AND waiting_tasks > 0 \
              ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut promoted = 0usize;
        'outer: for job_id in job_ids {
            loop {
                if promoted >= budget {
                    break 'outer;
                }
                if !self.promote_waiting_task_for_job(&job_id).await? {
                    break;
                }
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn list_job_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.job_id = $1 \
             ORDER BY t.created_at ASC, t.id ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn clear_expired_quota_blocks(&self) -> StoreResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE organisations SET quota_exhausted_until = NULL \
              WHERE quota_exhausted_until IS NOT NULL AND quota_exhausted_until <= now() \
             RETURNING id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_schedulers_ready_to_run(&self, limit: usize) -> StoreResult<Vec<Scheduler>> {
        let rows = sqlx::query_as::<_, SchedulerRow>(
            "SELECT id, domain_name, organisation_id, schedule_interval_hours, next_run_at, \
                    is_enabled, concurrency, find_links, max_pages, include_paths, \
                    exclude_paths, required_workers \
               FROM schedulers \
              WHERE is_enabled AND next_run_at <= now() \
              ORDER BY next_run_at ASC \
              LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SchedulerRow::into_scheduler).collect())
    }

    async fn update_scheduler_next_run(
        &self,
        scheduler_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE schedulers SET next_run_at = $2 WHERE id = $1")
            .bind(scheduler_id)
            .bind(next_run_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("scheduler {scheduler_id}")));
        }
        Ok(())
    }

    async fn get_last_job_start_for_scheduler(
        &self,
        scheduler_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(COALESCE(started_at, created_at)) FROM jobs WHERE scheduler_id = $1",
        )
        .bind(scheduler_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn finalize_lagging_jobs(&self) -> StoreResult<Vec<String>> {
        let lagging: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs \
              WHERE status = 'running' AND total_tasks > 0 \
                AND completed_tasks + failed_tasks >= total_tasks - skipped_tasks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut finalized = Vec::new();
        for job_id in lagging {
            let mut tx = self.pool.begin().await?;
            if finish_job_if_done(&mut *tx, &job_id).await? {
                finalized.push(job_id);
            }
            tx.commit().await?;
        }
        Ok(finalized)
    }

    async fn scan_stuck_jobs(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Job>> {
        let secs = running_threshold.as_secs_f64();
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs \
              WHERE status = 'running' AND completed_tasks + failed_tasks = 0 \
                AND started_at < now() - make_interval(secs => $1)",
        )
        .bind(secs)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs j JOIN domains d ON d.id = j.domain_id \
              WHERE j.status = 'running' AND j.completed_tasks + j.failed_tasks = 0 \
                AND j.started_at < now() - make_interval(secs => $1) \
              ORDER BY j.started_at ASC \
              LIMIT $2"
        ))
        .bind(secs)
        .bind(sample_limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(StuckScan {
            total: total as usize,
            samples: rows
                .into_iter()
                .map(JobRow::into_job)
                .collect::<StoreResult<_>>()?,
        })
    }

    async fn scan_stuck_tasks(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Task>> {
        let secs = running_threshold.as_secs_f64();
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks \
              WHERE status = 'running' AND started_at < now() - make_interval(secs => $1)",
        )
        .bind(secs)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
              WHERE t.status = 'running' \
                AND t.started_at < now() - make_interval(secs => $1) \
              ORDER BY t.started_at ASC \
              LIMIT $2"
        ))
        .bind(secs)
        .bind(sample_limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(StuckScan {
            total: total as usize,
            samples: rows
                .into_iter()
                .map(TaskRow::into_task)
                .collect::<StoreResult<_>>()?,
        })
    }

    async fn reset_stuck_tasks(
        &self,
        running_threshold: Duration,
        limit: usize,
    ) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;

        let stuck: Vec<(String, String, i32, Option<String>)> = sqlx::query_as(
            "SELECT t.id, t.job_id, t.retry_count, j.organisation_id \
               FROM tasks t JOIN jobs j ON j.id = t.job_id \
              WHERE t.status = 'running' \
                AND t.started_at < now() - make_interval(secs => $1) \
              ORDER BY t.started_at ASC \
              LIMIT $2 \
              FOR UPDATE OF t SKIP LOCKED",
        )
        .bind(running_threshold.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut job_deltas: BTreeMap<String, JobDelta> = BTreeMap::new();
        let mut usage: BTreeMap<String, i64> = BTreeMap::new();
        let mut reset = 0usize;

        for (task_id, job_id, retry_count, org_id) in &stuck {
            let delta = job_deltas.entry(job_id.clone()).or_default();
            if *retry_count < MAX_TASK_RETRIES {
                sqlx::query(
                    "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, \
                            started_at = NULL, error = 'reset after stuck-task detection' \
                     WHERE id = $1",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                delta.running -= 1;
                delta.pending += 1;
            } else {
                sqlx::query(
                    "UPDATE tasks SET status = 'failed', completed_at = now(), \
                            error = 'stuck in running beyond recovery threshold' \
                     WHERE id = $1",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                delta.running -= 1;
                delta.failed += 1;
                if let Some(org_id) = org_id {
                    *usage.entry(org_id.clone()).or_default() += 1;
                }
            }
            reset += 1;
        }

        for (org_id, pages) in &usage {
            record_usage(&mut *tx, org_id, *pages).await?;
        }
        for (job_id, delta) in &job_deltas {
            sqlx::query(
                "UPDATE jobs SET running_tasks = running_tasks + $2, \
                        pending_tasks = pending_tasks + $3, \
                        failed_tasks = failed_tasks + $4 \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(delta.running)
            .bind(delta.pending)
            .bind(delta.failed)
            .execute(&mut *tx)
            .await?;
        }
        for job_id in job_deltas.keys() {
            finish_job_if_done(&mut *tx, job_id).await?;
        }

        tx.commit().await?;
        Ok(reset)
    }
}

async fn apply_completed_row(
    conn: &mut PgConnection,
    task_id: &str,
    outcome: &CrawlOutcome,
) -> StoreResult<()> {
    let headers = serde_json::to_value(&outcome.headers)
        .map_err(|err| StoreError::Invalid(format!("task {task_id} headers: {err}")))?;
    sqlx::query(
        "UPDATE tasks SET status = 'completed', completed_at = now(), \
                status_code = $2, response_time_ms = $3, cache_status = $4, \
                second_response_time_ms = $5, second_cache_status = $6, \
                content_length = $7, content_type = $8, headers = $9, \
                dns_ms = $10, connect_ms = $11, tls_ms = $12, ttfb_ms = $13, \
                transfer_ms = $14, redirect_url = $15, error = NULL \
         WHERE id = $1",
    )
    .bind(task_id)
    .bind(outcome.status_code as i32)
    .bind(outcome.response_time_ms as i64)
    .bind(outcome.cache_status.as_str())
    .bind(outcome.second.as_ref().map(|s| s.response_time_ms as i64))
    .bind(outcome.second.as_ref().map(|s| s.cache_status.as_str()))
    .bind(outcome.content_length)
    .bind(&outcome.content_type)
    .bind(&headers)
    .bind(outcome.timing.dns_ms.map(|v| v as i64))
    .bind(outcome.timing.connect_ms.map(|v| v as i64))
    .bind(outcome.timing.tls_ms.map(|v| v as i64))
    .bind(outcome.timing.ttfb_ms.map(|v| v as i64))
    .bind(outcome.timing.transfer_ms.map(|v| v as i64))
    .bind(&outcome.redirect_url)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

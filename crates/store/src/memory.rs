//! In-memory `Store` implementation.
//!
//! Implements the same state machine as the Postgres store behind a single
//! mutex: initial-status computation, claim ordering, counter maintenance,
//! quota accounting, promotion and terminal-state freezing all match
//! `pg::PgStore`, so either implementation passes the same test suite. Used
//! by tests and the development profile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use warmfront_core::crawl::CrawlOutcome;
use warmfront_core::model::{
    self, Job, JobCounters, JobOptions, JobStatus, Notification, NotificationKind, Organisation,
    Plan, Scheduler, SourceKind, Task, TaskStatus, MAX_TASK_RETRIES,
};

use crate::api::{
    BatchOutcome, ClaimedTask, DomainPacing, EnqueueEntry, EnqueueOutcome, Store, StoreError,
    StoreResult, StuckScan, TaskOp,
};

#[derive(Default)]
struct MemState {
    domains_by_name: HashMap<String, i64>,
    domains: HashMap<i64, DomainPacing>,
    pages: HashMap<(i64, String), i64>,
    next_domain_id: i64,
    next_page_id: i64,

    orgs: HashMap<String, Organisation>,
    plans: HashMap<String, Plan>,
    usage: HashMap<(String, NaiveDate), i64>,

    jobs: HashMap<String, Job>,
    tasks: BTreeMap<String, Task>,
    job_pages: HashSet<(String, i64)>,

    schedulers: HashMap<String, Scheduler>,
    notifications: Vec<Notification>,
}

impl MemState {
    fn org_quota_ok(&self, org_id: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(org_id) = org_id else { return true };
        let Some(org) = self.orgs.get(org_id) else {
            return true;
        };
        if let Some(until) = org.quota_exhausted_until {
            if until > now {
                return false;
            }
        }
        let Some(plan) = self.plans.get(&org.plan_id) else {
            return true;
        };
        if plan.daily_page_limit <= 0 {
            return true;
        }
        let used = self
            .usage
            .get(&(org.id.clone(), model::utc_usage_date(now)))
            .copied()
            .unwrap_or(0);
        used < plan.daily_page_limit
    }

    /// Admission slots left in the org's daily budget, counting tasks the
    /// org has already admitted (`pending` + `running`) against the limit.
    /// `i64::MAX` when unlimited.
    fn org_quota_slots(&self, org_id: Option<&str>, admitted: i64, now: DateTime<Utc>) -> i64 {
        let Some(org) = org_id.and_then(|id| self.orgs.get(id)) else {
            return i64::MAX;
        };
        if org
            .quota_exhausted_until
            .map(|until| until > now)
            .unwrap_or(false)
        {
            return 0;
        }
        match self.plans.get(&org.plan_id) {
            Some(plan) if plan.daily_page_limit > 0 => {
                let used = self
                    .usage
                    .get(&(org.id.clone(), model::utc_usage_date(now)))
                    .copied()
                    .unwrap_or(0);
                (plan.daily_page_limit - used - admitted).max(0)
            }
            _ => i64::MAX,
        }
    }

    /// Whether the job can admit another `pending` task.
    fn has_admission_capacity(job: &Job) -> bool {
        job.concurrency <= 0
            || job.counters.running + job.counters.pending < job.concurrency as i64
    }

    /// Whether a worker may claim from this job right now.
    fn is_claimable(job: &Job) -> bool {
        matches!(job.status, JobStatus::Pending | JobStatus::Running)
            && (job.concurrency <= 0 || job.counters.running < job.concurrency as i64)
    }

    fn record_terminal_usage(&mut self, org_id: Option<&str>, now: DateTime<Utc>) {
        let Some(org_id) = org_id else { return };
        let date = model::utc_usage_date(now);
        let used = self
            .usage
            .entry((org_id.to_string(), date))
            .and_modify(|v| *v += 1)
            .or_insert(1);
        let used = *used;

        let Some(org) = self.orgs.get_mut(org_id) else {
            return;
        };
        let Some(plan) = self.plans.get(&org.plan_id) else {
            return;
        };
        if plan.daily_page_limit > 0 && used >= plan.daily_page_limit {
            let until = model::next_utc_midnight(now);
            match org.quota_exhausted_until {
                Some(existing) if existing >= until => {}
                _ => org.quota_exhausted_until = Some(until),
            }
        }
    }

    fn aggregate_stats(&self, job_id: &str) -> serde_json::Value {
        let mut completed = 0u64;
        let mut response_sum = 0i64;
        let mut cache_hits = 0u64;
        let mut second_sum = 0i64;
        let mut second_count = 0u64;
        for task in self.tasks.values().filter(|t| t.job_id == job_id) {
            if task.status != TaskStatus::Completed {
                continue;
            }
            completed += 1;
            response_sum += task.response_time_ms.unwrap_or(0);
            if task.cache_status.as_deref() == Some("hit") {
                cache_hits += 1;
            }
            if let Some(ms) = task.second_response_time_ms {
                second_sum += ms;
                second_count += 1;
            }
        }
        serde_json::json!({
            "completed": completed,
            "avg_response_time_ms": if completed > 0 { response_sum / completed as i64 } else { 0 },
            "cache_hit_ratio": if completed > 0 { cache_hits as f64 / completed as f64 } else { 0.0 },
            "avg_second_response_time_ms": if second_count > 0 { second_sum / second_count as i64 } else { 0 },
        })
    }

    /// Finalise the job when every countable task is terminal. Terminal job
    /// states are never overwritten.
    fn finish_job_if_done(&mut self, job_id: &str, now: DateTime<Utc>) -> bool {
        let Some(job) = self.jobs.get(job_id) else {
            return false;
        };
        if job.status.is_terminal() || !job.counters.is_done() {
            return false;
        }

        let stats = self.aggregate_stats(job_id);
        let job = self.jobs.get_mut(job_id).expect("job checked above");
        let failed_only = job.counters.failed > 0 && job.counters.completed == 0;
        job.status = if failed_only {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        job.completed_at = Some(now);
        job.stats = Some(stats);

        let kind = if failed_only {
            NotificationKind::JobFailed
        } else {
            NotificationKind::JobCompleted
        };
        let message = format!(
            "job {job_id} {}: {} completed, {} failed, {} skipped",
            job.status,
            job.counters.completed,
            job.counters.failed,
            job.counters.skipped
        );
        self.notifications.push(Notification {
            id: model::new_notification_id(),
            job_id: job_id.to_string(),
            kind,
            message,
            created_at: now,
        });
        true
    }
}

/// In-memory store; see the module docs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("memory store poisoned")
    }

    // Seeding and inspection helpers for tests and the dev profile.

    pub fn seed_plan(&self, id: &str, daily_page_limit: i64) {
        self.lock().plans.insert(
            id.to_string(),
            Plan {
                id: id.to_string(),
                daily_page_limit,
            },
        );
    }

    pub fn seed_org(&self, id: &str, plan_id: &str) {
        self.lock().orgs.insert(
            id.to_string(),
            Organisation {
                id: id.to_string(),
                plan_id: plan_id.to_string(),
                quota_exhausted_until: None,
            },
        );
    }

    pub fn insert_scheduler(&self, scheduler: Scheduler) {
        self.lock()
            .schedulers
            .insert(scheduler.id.clone(), scheduler);
    }

    pub fn organisation(&self, org_id: &str) -> Option<Organisation> {
        self.lock().orgs.get(org_id).cloned()
    }

    pub fn set_quota_exhausted_until(&self, org_id: &str, until: Option<DateTime<Utc>>) {
        if let Some(org) = self.lock().orgs.get_mut(org_id) {
            org.quota_exhausted_until = until;
        }
    }

    /// Drop all recorded usage for an org (simulated day rollover in tests).
    pub fn reset_daily_usage(&self, org_id: &str) {
        self.lock().usage.retain(|(org, _), _| org != org_id);
    }

    pub fn usage_for(&self, org_id: &str, date: NaiveDate) -> i64 {
        self.lock()
            .usage
            .get(&(org_id.to_string(), date))
            .copied()
            .unwrap_or(0)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Backdate a running task's `started_at` (stuck-task scenarios).
    pub fn backdate_task_started(&self, task_id: &str, started_at: DateTime<Utc>) {
        if let Some(task) = self.lock().tasks.get_mut(task_id) {
            task.started_at = Some(started_at);
        }
    }

    /// Backdate a job's `started_at` (stuck-job scenarios).
    pub fn backdate_job_started(&self, job_id: &str, started_at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(job_id) {
            job.started_at = Some(started_at);
        }
    }
}

fn apply_success(task: &mut Task, outcome: &CrawlOutcome, now: DateTime<Utc>) {
    task.status = TaskStatus::Completed;
    task.completed_at = Some(now);
    task.status_code = Some(outcome.status_code as i32);
    task.response_time_ms = Some(outcome.response_time_ms as i64);
    task.cache_status = Some(outcome.cache_status.as_str().to_string());
    task.content_length = outcome.content_length;
    task.content_type = outcome.content_type.clone();
    task.headers = serde_json::to_value(&outcome.headers).ok();
    task.timing = Some(outcome.timing);
    task.redirect_url = outcome.redirect_url.clone();
    task.error = None;
    if let Some(second) = &outcome.second {
        task.second_response_time_ms = Some(second.response_time_ms as i64);
        task.second_cache_status = Some(second.cache_status.as_str().to_string());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_domain(&self, name: &str) -> StoreResult<i64> {
        let mut state = self.lock();
        if let Some(id) = state.domains_by_name.get(name) {
            return Ok(*id);
        }
        state.next_domain_id += 1;
        let id = state.next_domain_id;
        state.domains_by_name.insert(name.to_string(), id);
        state.domains.insert(id, DomainPacing::default());
        Ok(id)
    }

    async fn get_or_create_page(&self, domain_id: i64, path: &str) -> StoreResult<i64> {
        let mut state = self.lock();
        if !state.domains.contains_key(&domain_id) {
            return Err(StoreError::NotFound(format!("domain {domain_id}")));
        }
        let key = (domain_id, path.to_string());
        if let Some(id) = state.pages.get(&key) {
            return Ok(*id);
        }
        state.next_page_id += 1;
        let id = state.next_page_id;
        state.pages.insert(key, id);
        Ok(id)
    }

    async fn get_or_create_pages(&self, domain_id: i64, paths: &[String]) -> StoreResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            ids.push(self.get_or_create_page(domain_id, path).await?);
        }
        Ok(ids)
    }

    async fn domain_pacing(&self, domain_id: i64) -> StoreResult<DomainPacing> {
        let state = self.lock();
        state
            .domains
            .get(&domain_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("domain {domain_id}")))
    }

    async fn update_domain_pacing(
        &self,
        domain_id: i64,
        adaptive_delay_secs: f64,
        floor_secs: f64,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let pacing = state
            .domains
            .get_mut(&domain_id)
            .ok_or_else(|| StoreError::NotFound(format!("domain {domain_id}")))?;
        pacing.adaptive_delay_secs = adaptive_delay_secs;
        pacing.floor_secs = floor_secs;
        Ok(())
    }

    async fn set_domain_crawl_delay(
        &self,
        domain_id: i64,
        crawl_delay_secs: Option<f64>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let pacing = state
            .domains
            .get_mut(&domain_id)
            .ok_or_else(|| StoreError::NotFound(format!("domain {domain_id}")))?;
        pacing.crawl_delay_secs = crawl_delay_secs;
        Ok(())
    }

    async fn create_job(&self, options: &JobOptions) -> StoreResult<Job> {
        let domain_id = self.get_or_create_domain(&options.domain).await?;
        let now = Utc::now();
        let job = Job {
            id: model::new_job_id(),
            domain_id,
            domain: options.domain.clone(),
            org_id: options.org_id.clone(),
            status: JobStatus::Pending,
            concurrency: options.concurrency.max(0),
            find_links: options.find_links,
            max_pages: options.max_pages.max(0),
            include_paths: options.include_paths.clone(),
            exclude_paths: options.exclude_paths.clone(),
            required_workers: options.required_workers.max(0),
            scheduler_id: options.scheduler_id.clone(),
            source: options.source.clone(),
            counters: JobCounters::default(),
            error_message: None,
            stats: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        self.lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn cancel_job(&self, job_id: &str) -> StoreResult<Job> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get(job_id) else {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        };
        if job.status.is_terminal() {
            return Ok(job.clone());
        }

        let mut newly_skipped = 0i64;
        let mut from_pending = 0i64;
        let mut from_waiting = 0i64;
        for task in state.tasks.values_mut().filter(|t| t.job_id == job_id) {
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Skipped;
                    from_pending += 1;
                    newly_skipped += 1;
                }
                TaskStatus::Waiting => {
                    task.status = TaskStatus::Skipped;
                    from_waiting += 1;
                    newly_skipped += 1;
                }
                _ => {}
            }
        }

        let job = state.jobs.get_mut(job_id).expect("job checked above");
        job.counters.pending -= from_pending;
        job.counters.waiting -= from_waiting;
        job.counters.skipped += newly_skipped;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn set_job_error_message(&self, job_id: &str, message: &str) -> StoreResult<()> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job.error_message = Some(message.to_string());
        Ok(())
    }

    async fn complete_job_if_done(&self, job_id: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        Ok(state.finish_job_if_done(job_id, Utc::now()))
    }

    async fn recalculate_job_stats(&self, job_id: &str) -> StoreResult<Job> {
        let mut state = self.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }

        let mut counters = JobCounters::default();
        for task in state.tasks.values().filter(|t| t.job_id == job_id) {
            counters.total += 1;
            match task.status {
                TaskStatus::Pending => counters.pending += 1,
                TaskStatus::Waiting => counters.waiting += 1,
                TaskStatus::Running => counters.running += 1,
                TaskStatus::Completed => counters.completed += 1,
                TaskStatus::Failed => counters.failed += 1,
                TaskStatus::Skipped => counters.skipped += 1,
            }
            match task.source {
                SourceKind::Sitemap => counters.sitemap += 1,
                SourceKind::Discovered => counters.found += 1,
                SourceKind::Manual => {}
            }
        }

        let stats = state.aggregate_stats(job_id);
        let job = state.jobs.get_mut(job_id).expect("job checked above");
        job.counters = counters;
        job.stats = Some(stats);
        if job.counters.total > 0 {
            state.finish_job_if_done(job_id, Utc::now());
        }
        Ok(state.jobs.get(job_id).expect("job checked above").clone())
    }

    async fn enqueue_tasks(
        &self,
        job_id: &str,
        entries: &[EnqueueEntry],
    ) -> StoreResult<EnqueueOutcome> {
        let mut state = self.lock();
        let now = Utc::now();

        let Some(job) = state.jobs.get(job_id) else {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        };
        if job.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is {}",
                job.status
            )));
        }
        let org_id = job.org_id.clone();

        // Remaining quota admissions for this batch: tasks beyond the org's
        // remaining daily budget start in `waiting` rather than `pending`.
        let mut quota_slots = state.org_quota_slots(
            org_id.as_deref(),
            job.counters.pending + job.counters.running,
            now,
        );

        let mut outcome = EnqueueOutcome::default();
        for (i, entry) in entries.iter().enumerate() {
            let key = (job_id.to_string(), entry.page_id);
            if state.job_pages.contains(&key) {
                outcome.duplicate += 1;
                continue;
            }

            let job = state.jobs.get(job_id).expect("job checked above");
            let status = if entry.excluded {
                TaskStatus::Skipped
            } else {
                let countable = job.counters.total - job.counters.skipped;
                if job.max_pages > 0 && countable >= job.max_pages {
                    outcome.capped += 1;
                    continue;
                }
                if MemState::has_admission_capacity(job) && quota_slots > 0 {
                    quota_slots -= 1;
                    TaskStatus::Pending
                } else {
                    TaskStatus::Waiting
                }
            };

            let task = Task {
                id: model::new_task_id(),
                job_id: job_id.to_string(),
                page_id: entry.page_id,
                path: entry.path.clone(),
                status,
                priority_score: entry.priority,
                retry_count: 0,
                source: entry.source,
                source_url: entry.source_url.clone(),
                // Per-entry offsets keep claim order stable within a batch.
                created_at: now + chrono::Duration::microseconds(i as i64),
                started_at: None,
                completed_at: None,
                status_code: None,
                response_time_ms: None,
                cache_status: None,
                second_response_time_ms: None,
                second_cache_status: None,
                content_length: None,
                content_type: None,
                headers: None,
                timing: None,
                redirect_url: None,
                error: None,
            };

            let job = state.jobs.get_mut(job_id).expect("job checked above");
            job.counters.total += 1;
            match status {
                TaskStatus::Pending => {
                    job.counters.pending += 1;
                    outcome.inserted += 1;
                }
                TaskStatus::Waiting => {
                    job.counters.waiting += 1;
                    outcome.inserted += 1;
                }
                TaskStatus::Skipped => {
                    job.counters.skipped += 1;
                    outcome.excluded += 1;
                }
                _ => unreachable!("initial status is pending, waiting or skipped"),
            }
            match entry.source {
                SourceKind::Sitemap => job.counters.sitemap += 1,
                SourceKind::Discovered => job.counters.found += 1,
                SourceKind::Manual => {}
            }

            state.job_pages.insert(key);
            state.tasks.insert(task.id.clone(), task);
        }
        Ok(outcome)
    }

    async fn claim_next_task(&self) -> StoreResult<Option<ClaimedTask>> {
        let mut state = self.lock();
        let now = Utc::now();

        let mut best: Option<(f64, DateTime<Utc>, String)> = None;
        for task in state.tasks.values() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let Some(job) = state.jobs.get(&task.job_id) else {
                continue;
            };
            if !MemState::is_claimable(job) {
                continue;
            }
            if !state.org_quota_ok(job.org_id.as_deref(), now) {
                continue;
            }
            let candidate = (task.priority_score, task.created_at, task.id.clone());
            let better = match &best {
                None => true,
                Some((p, c, id)) => {
                    candidate.0 > *p
                        || (candidate.0 == *p
                            && (candidate.1 < *c || (candidate.1 == *c && candidate.2 < *id)))
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let Some((_, _, task_id)) = best else {
            return Ok(None);
        };

        let task = state.tasks.get_mut(&task_id).expect("candidate exists");
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let task = task.clone();

        let job = state.jobs.get_mut(&task.job_id).expect("job exists");
        job.counters.pending -= 1;
        job.counters.running += 1;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
        }
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }

        let claimed = ClaimedTask {
            domain_id: job.domain_id,
            domain: job.domain.clone(),
            org_id: job.org_id.clone(),
            find_links: job.find_links,
            task,
        };
        Ok(Some(claimed))
    }

    async fn apply_task_results(&self, ops: Vec<TaskOp>) -> StoreResult<BatchOutcome> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();
        let mut touched: Vec<String> = Vec::new();

        for op in &ops {
            let Some(task) = state.tasks.get(op.task_id()) else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }
            let job_id = task.job_id.clone();
            let org_id = state.jobs.get(&job_id).and_then(|j| j.org_id.clone());

            match op {
                TaskOp::Complete { task_id, outcome: crawl } => {
                    let task = state.tasks.get_mut(task_id).expect("task checked above");
                    apply_success(task, crawl, now);
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        job.counters.running -= 1;
                        job.counters.completed += 1;
                    }
                    state.record_terminal_usage(org_id.as_deref(), now);
                }
                TaskOp::Fail {
                    task_id,
                    error,
                    retryable,
                } => {
                    let task = state.tasks.get_mut(task_id).expect("task checked above");
                    if *retryable && task.retry_count < MAX_TASK_RETRIES {
                        task.status = TaskStatus::Pending;
                        task.retry_count += 1;
                        task.error = Some(error.clone());
                        task.started_at = None;
                        if let Some(job) = state.jobs.get_mut(&job_id) {
                            job.counters.running -= 1;
                            job.counters.pending += 1;
                        }
                    } else {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(now);
                        task.error = Some(error.clone());
                        if let Some(job) = state.jobs.get_mut(&job_id) {
                            job.counters.running -= 1;
                            job.counters.failed += 1;
                        }
                        state.record_terminal_usage(org_id.as_deref(), now);
                    }
                }
            }

            outcome.applied += 1;
            if !touched.contains(&job_id) {
                touched.push(job_id);
            }
        }

        for job_id in touched {
            if state.finish_job_if_done(&job_id, now) {
                outcome.finished_jobs.push(job_id);
            } else {
                outcome.released_jobs.push(job_id);
            }
        }
        Ok(outcome)
    }

    async fn promote_waiting_task_for_job(&self, job_id: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        let now = Utc::now();

        let Some(job) = state.jobs.get(job_id) else {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        };
        if job.status.is_terminal() || !MemState::has_admission_capacity(job) {
            return Ok(false);
        }
        let admitted = job.counters.pending + job.counters.running;
        if state.org_quota_slots(job.org_id.as_deref(), admitted, now) <= 0 {
            return Ok(false);
        }

        let mut best: Option<(f64, DateTime<Utc>, String)> = None;
        for task in state
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Waiting)
        {
            let candidate = (task.priority_score, task.created_at, task.id.clone());
            let better = match &best {
                None => true,
                Some((p, c, id)) => {
                    candidate.0 > *p
                        || (candidate.0 == *p
                            && (candidate.1 < *c || (candidate.1 == *c && candidate.2 < *id)))
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let Some((_, _, task_id)) = best else {
            return Ok(false);
        };
        state.tasks.get_mut(&task_id).expect("candidate exists").status = TaskStatus::Pending;
        let job = state.jobs.get_mut(job_id).expect("job checked above");
        job.counters.waiting -= 1;
        job.counters.pending += 1;
        Ok(true)
    }

    async fn promote_waiting_tasks_for_org(
        &self,
        org_id: &str,
        limit: usize,
    ) -> StoreResult<usize> {
        let now = Utc::now();
        let budget = {
            let state = self.lock();
            let Some(org) = state.orgs.get(org_id) else {
                return Ok(0);
            };
            if let Some(until) = org.quota_exhausted_until {
                if until > now {
                    return Ok(0);
                }
            }
            let remaining = match state.plans.get(&org.plan_id) {
                Some(plan) if plan.daily_page_limit > 0 => {
                    let used = state
                        .usage
                        .get(&(org_id.to_string(), model::utc_usage_date(now)))
                        .copied()
                        .unwrap_or(0);
                    (plan.daily_page_limit - used).max(0) as usize
                }
                _ => usize::MAX,
            };
            limit.min(remaining)
        };

        let mut job_ids: Vec<String> = {
            let state = self.lock();
            let mut ids: Vec<String> = state
                .jobs
                .values()
                .filter(|j| {
                    j.org_id.as_deref() == Some(org_id)
                        && !j.status.is_terminal()
                        && j.counters.waiting > 0
                })
                .map(|j| j.id.clone())
                .collect();
            ids.sort();
            ids
        };

        let mut promoted = 0usize;
        'outer: for job_id in job_ids.drain(..) {
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
        let state = self.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn clear_expired_quota_blocks(&self) -> StoreResult<Vec<String>> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut cleared = Vec::new();
        for org in state.orgs.values_mut() {
            if let Some(until) = org.quota_exhausted_until {
                if until <= now {
                    org.quota_exhausted_until = None;
                    cleared.push(org.id.clone());
                }
            }
        }
        cleared.sort();
        Ok(cleared)
    }

    async fn get_schedulers_ready_to_run(&self, limit: usize) -> StoreResult<Vec<Scheduler>> {
        let state = self.lock();
        let now = Utc::now();
        let mut due: Vec<Scheduler> = state
            .schedulers
            .values()
            .filter(|s| s.is_enabled && s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn update_scheduler_next_run(
        &self,
        scheduler_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let scheduler = state
            .schedulers
            .get_mut(scheduler_id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduler {scheduler_id}")))?;
        scheduler.next_run_at = next_run_at;
        Ok(())
    }

    async fn get_last_job_start_for_scheduler(
        &self,
        scheduler_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.scheduler_id.as_deref() == Some(scheduler_id))
            .map(|j| j.started_at.unwrap_or(j.created_at))
            .max())
    }

    async fn finalize_lagging_jobs(&self) -> StoreResult<Vec<String>> {
        let mut state = self.lock();
        let now = Utc::now();
        let lagging: Vec<String> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.counters.total > 0 && j.counters.is_done()
            })
            .map(|j| j.id.clone())
            .collect();
        let mut finalized = Vec::new();
        for job_id in lagging {
            if state.finish_job_if_done(&job_id, now) {
                finalized.push(job_id);
            }
        }
        finalized.sort();
        Ok(finalized)
    }

    async fn scan_stuck_jobs(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Job>> {
        let state = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(running_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut stuck: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.counters.completed + j.counters.failed == 0
                    && j.started_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .collect();
        stuck.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let total = stuck.len();
        let samples = stuck.into_iter().take(sample_limit).cloned().collect();
        Ok(StuckScan { total, samples })
    }

    async fn scan_stuck_tasks(
        &self,
        running_threshold: Duration,
        sample_limit: usize,
    ) -> StoreResult<StuckScan<Task>> {
        let state = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(running_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let mut stuck: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.map(|ts| ts < cutoff).unwrap_or(false)
            })
            .collect();
        stuck.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let total = stuck.len();
        let samples = stuck.into_iter().take(sample_limit).cloned().collect();
        Ok(StuckScan { total, samples })
    }

    async fn reset_stuck_tasks(
        &self,
        running_threshold: Duration,
        limit: usize,
    ) -> StoreResult<usize> {
        let mut state = self.lock();
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(running_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(180));

        let mut stuck_ids: Vec<String> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.map(|ts| ts < cutoff).unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();
        stuck_ids.sort();
        stuck_ids.truncate(limit);

        let mut reset = 0usize;
        let mut touched: Vec<String> = Vec::new();
        for task_id in stuck_ids {
            let task = state.tasks.get_mut(&task_id).expect("scanned above");
            let job_id = task.job_id.clone();
            let org_id = state.jobs.get(&job_id).and_then(|j| j.org_id.clone());
            let task = state.tasks.get_mut(&task_id).expect("scanned above");
            if task.retry_count < MAX_TASK_RETRIES {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                task.started_at = None;
                task.error = Some("reset after stuck-task detection".to_string());
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.counters.running -= 1;
                    job.counters.pending += 1;
                }
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.error = Some("stuck in running beyond recovery threshold".to_string());
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.counters.running -= 1;
                    job.counters.failed += 1;
                }
                state.record_terminal_usage(org_id.as_deref(), now);
            }
            reset += 1;
            if !touched.contains(&job_id) {
                touched.push(job_id);
            }
        }

        for job_id in touched {
            state.finish_job_if_done(&job_id, now);
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Headers;
    use warmfront_core::crawl::{CacheStatus, CrawlOutcome, TimingBreakdown};

    fn outcome(status: u16) -> CrawlOutcome {
        CrawlOutcome {
            status_code: status,
            response_time_ms: 50,
            cache_status: CacheStatus::Miss,
            timing: TimingBreakdown::default(),
            content_length: Some(1024),
            content_type: Some("text/html".to_string()),
            headers: Headers::new(),
            redirect_url: None,
            second: None,
            discovered_links: Vec::new(),
        }
    }

    async fn job_with_tasks(
        store: &MemoryStore,
        concurrency: i32,
        max_pages: i64,
        paths: &[&str],
    ) -> Job {
        let mut options = JobOptions::new("example.com");
        options.concurrency = concurrency;
        options.max_pages = max_pages;
        let job = store.create_job(&options).await.unwrap();
        enqueue(store, &job, paths).await;
        store.get_job(&job.id).await.unwrap()
    }

    async fn enqueue(store: &MemoryStore, job: &Job, paths: &[&str]) -> EnqueueOutcome {
        let path_strings: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let ids = store
            .get_or_create_pages(job.domain_id, &path_strings)
            .await
            .unwrap();
        let entries: Vec<EnqueueEntry> = ids
            .into_iter()
            .zip(path_strings)
            .map(|(page_id, path)| EnqueueEntry::new(page_id, path, SourceKind::Sitemap))
            .collect();
        store.enqueue_tasks(&job.id, &entries).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_and_capped() {
        let store = MemoryStore::new();
        let mut options = JobOptions::new("example.com");
        options.max_pages = 2;
        let job = store.create_job(&options).await.unwrap();

        let first = enqueue(&store, &job, &["/a", "/b", "/c"]).await;
        assert_eq!(first.inserted, 2);
        assert_eq!(first.capped, 1);

        // Re-enqueueing the same URLs changes nothing.
        let second = enqueue(&store, &job, &["/a", "/b", "/c"]).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicate, 2);
        assert_eq!(second.capped, 1);

        let refreshed = store.get_job(&job.id).await.unwrap();
        assert_eq!(refreshed.counters.total, 2);
        assert!(refreshed.counters.is_conserved());
    }

    #[tokio::test]
    async fn initial_status_respects_concurrency() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 2, 0, &["/a", "/b", "/c"]).await;
        assert_eq!(job.counters.pending, 2);
        assert_eq!(job.counters.waiting, 1);
    }

    #[tokio::test]
    async fn claim_respects_priority_then_age() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/old", "/new"]).await;

        // A later, higher-priority manual URL jumps the queue.
        let page = store.get_or_create_page(job.domain_id, "/urgent").await.unwrap();
        let mut entry = EnqueueEntry::new(page, "/urgent", SourceKind::Manual);
        entry.priority = SourceKind::Manual.base_priority();
        store.enqueue_tasks(&job.id, &[entry]).await.unwrap();

        let first = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(first.task.path, "/urgent");
        let second = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(second.task.path, "/old");
        let third = store.claim_next_task().await.unwrap().unwrap();
        assert_eq!(third.task.path, "/new");
    }

    #[tokio::test]
    async fn claim_honours_concurrency_cap() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 2, 0, &["/a", "/b", "/c"]).await;

        assert!(store.claim_next_task().await.unwrap().is_some());
        assert!(store.claim_next_task().await.unwrap().is_some());
        // Third pending task exists but the job is at its cap.
        assert!(store.claim_next_task().await.unwrap().is_none());

        let refreshed = store.get_job(&job.id).await.unwrap();
        assert_eq!(refreshed.counters.running, 2);
        assert!(refreshed.counters.running <= refreshed.concurrency as i64);
    }

    #[tokio::test]
    async fn complete_flow_finishes_job() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/a", "/b"]).await;

        for _ in 0..2 {
            let claimed = store.claim_next_task().await.unwrap().unwrap();
            store
                .complete_task(&claimed.task.id, outcome(200))
                .await
                .unwrap();
        }

        let done = store.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress(), 100.0);
        assert!(done.completed_at.is_some());
        assert!(done.stats.is_some());
        assert!(done.counters.is_conserved());

        let notifications = store.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::JobCompleted);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_until_budget_exhausted() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/flaky"]).await;

        for attempt in 0..MAX_TASK_RETRIES {
            let claimed = store.claim_next_task().await.unwrap().unwrap();
            assert_eq!(claimed.task.retry_count, attempt);
            store
                .fail_task(&claimed.task.id, "connection reset", true)
                .await
                .unwrap();
            let task = store.task(&claimed.task.id).unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
        }

        // Budget exhausted: the next retryable failure is terminal.
        let claimed = store.claim_next_task().await.unwrap().unwrap();
        store
            .fail_task(&claimed.task.id, "connection reset", true)
            .await
            .unwrap();
        let task = store.task(&claimed.task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let done = store.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.counters.failed, 1);
    }

    #[tokio::test]
    async fn terminal_job_status_is_frozen() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/a", "/b"]).await;

        let claimed = store.claim_next_task().await.unwrap().unwrap();
        let cancelled = store.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.counters.skipped, 1);

        // The in-flight task completes naturally; the job stays cancelled.
        store
            .complete_task(&claimed.task.id, outcome(200))
            .await
            .unwrap();
        let after = store.get_job(&job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(after.counters.completed, 1);
        assert!(store.notifications().is_empty());

        // Cancelling again is a no-op.
        let again = store.cancel_job(&job.id).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn quota_blocks_claims_and_promotion_restores_them() {
        let store = MemoryStore::new();
        store.seed_plan("starter", 2);
        store.seed_org("org-1", "starter");

        let mut options = JobOptions::new("example.com");
        options.org_id = Some("org-1".to_string());
        let job = store.create_job(&options).await.unwrap();
        enqueue(&store, &job, &["/a", "/b", "/c", "/d"]).await;

        // Only the remaining daily budget is admitted as pending.
        let seeded = store.get_job(&job.id).await.unwrap();
        assert_eq!(seeded.counters.pending, 2);
        assert_eq!(seeded.counters.waiting, 2);

        // Two terminal completions exhaust the plan.
        for _ in 0..2 {
            let claimed = store.claim_next_task().await.unwrap().unwrap();
            store
                .complete_task(&claimed.task.id, outcome(200))
                .await
                .unwrap();
        }
        let org = store.organisation("org-1").unwrap();
        assert!(org.quota_exhausted_until.is_some());
        assert!(store.claim_next_task().await.unwrap().is_none());

        // Simulated midnight: block expiry in the past, usage on a new day.
        store.set_quota_exhausted_until("org-1", Some(Utc::now() - chrono::Duration::seconds(1)));
        store.reset_daily_usage("org-1");
        let cleared = store.clear_expired_quota_blocks().await.unwrap();
        assert_eq!(cleared, vec!["org-1".to_string()]);
        let promoted = store.promote_waiting_tasks_for_org("org-1", 100).await.unwrap();
        assert_eq!(promoted, 2);

        // Remaining tasks are claimable again.
        assert!(store.claim_next_task().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiting_tasks_enter_pending_after_promotion() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 1, 0, &["/a", "/b"]).await;
        assert_eq!(job.counters.waiting, 1);

        let claimed = store.claim_next_task().await.unwrap().unwrap();
        // At capacity: promotion does nothing yet.
        assert!(!store.promote_waiting_task_for_job(&job.id).await.unwrap());

        store
            .complete_task(&claimed.task.id, outcome(200))
            .await
            .unwrap();
        assert!(store.promote_waiting_task_for_job(&job.id).await.unwrap());

        let refreshed = store.get_job(&job.id).await.unwrap();
        assert_eq!(refreshed.counters.pending, 1);
        assert_eq!(refreshed.counters.waiting, 0);
    }

    #[tokio::test]
    async fn stuck_tasks_are_detected_and_reset() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/slow"]).await;
        let claimed = store.claim_next_task().await.unwrap().unwrap();
        store.backdate_task_started(
            &claimed.task.id,
            Utc::now() - chrono::Duration::minutes(10),
        );

        let scan = store
            .scan_stuck_tasks(Duration::from_secs(180), 20)
            .await
            .unwrap();
        assert_eq!(scan.total, 1);

        let reset = store
            .reset_stuck_tasks(Duration::from_secs(180), 10)
            .await
            .unwrap();
        assert_eq!(reset, 1);
        let task = store.task(&claimed.task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);

        // And it completes on the next claim.
        let reclaimed = store.claim_next_task().await.unwrap().unwrap();
        store
            .complete_task(&reclaimed.task.id, outcome(200))
            .await
            .unwrap();
        assert_eq!(
            store.get_job(&job.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn excluded_entries_become_skipped_rows() {
        let store = MemoryStore::new();
        let job = store
            .create_job(&JobOptions::new("example.com"))
            .await
            .unwrap();
        let page = store.get_or_create_page(job.domain_id, "/admin").await.unwrap();
        let mut entry = EnqueueEntry::new(page, "/admin", SourceKind::Sitemap);
        entry.excluded = true;
        let out = store.enqueue_tasks(&job.id, &[entry]).await.unwrap();
        assert_eq!(out.excluded, 1);
        assert_eq!(out.inserted, 0);

        let refreshed = store.get_job(&job.id).await.unwrap();
        assert_eq!(refreshed.counters.skipped, 1);
        assert_eq!(refreshed.counters.total, 1);
        assert!(store.claim_next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recalculate_repairs_counter_drift() {
        let store = MemoryStore::new();
        let job = job_with_tasks(&store, 0, 0, &["/a", "/b"]).await;

        // Simulate drift.
        {
            let mut state = store.lock();
            let job = state.jobs.get_mut(&job.id).unwrap();
            job.counters.pending = 99;
            job.counters.total = 0;
        }
        let repaired = store.recalculate_job_stats(&job.id).await.unwrap();
        assert_eq!(repaired.counters.total, 2);
        assert_eq!(repaired.counters.pending, 2);
        assert!(repaired.counters.is_conserved());
    }

    #[tokio::test]
    async fn due_schedulers_are_listed_in_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("s-b", -10), ("s-a", -20), ("s-future", 3600)] {
            store.insert_scheduler(Scheduler {
                id: id.to_string(),
                domain: "example.com".to_string(),
                org_id: None,
                interval_hours: 24,
                next_run_at: now + chrono::Duration::seconds(offset),
                is_enabled: true,
                concurrency: 2,
                find_links: false,
                max_pages: 0,
                include_paths: Vec::new(),
                exclude_paths: Vec::new(),
                required_workers: 0,
            });
        }
        let due = store.get_schedulers_ready_to_run(10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s-a", "s-b"]);
    }
}

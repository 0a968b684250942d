//! Environment-driven sizing of the worker pool and database budget.

/// Deployment environment; selects default worker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Staging,
    Production,
}

impl AppEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            AppEnv::Development => "development",
            AppEnv::Staging => "staging",
            AppEnv::Production => "production",
        }
    }

    /// Default outer parallelism for this environment.
    pub fn default_job_workers(self) -> usize {
        match self {
            AppEnv::Development => 5,
            AppEnv::Staging => 10,
            AppEnv::Production => 30,
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = InvalidConfig;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(AppEnv::Development),
            "staging" => Ok(AppEnv::Staging),
            "production" => Ok(AppEnv::Production),
            other => Err(InvalidConfig::new(format!("unknown APP_ENV: {other:?}"))),
        }
    }
}

impl std::fmt::Display for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration value the process cannot start with.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvalidConfig {
    message: String,
}

impl InvalidConfig {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Inner parallelism bounds per worker.
pub const MIN_WORKER_CONCURRENCY: usize = 1;
pub const MAX_WORKER_CONCURRENCY: usize = 20;

/// Resolved sizing for the worker pool and its database budget.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSizing {
    pub env: AppEnv,
    /// Outer parallelism (number of worker loops).
    pub job_workers: usize,
    /// Inner parallelism per worker, clamped to `1..=20`.
    pub concurrency_per_worker: usize,
    /// Database pool size shared by workers and interactive queries.
    pub db_pool_size: u32,
    /// Connections withheld from workers for interactive use.
    pub db_reserved_connections: u32,
}

impl WorkerSizing {
    pub fn resolve(
        env: AppEnv,
        job_workers: Option<usize>,
        concurrency_per_worker: Option<usize>,
        db_pool_size: u32,
        db_reserved_connections: u32,
    ) -> Self {
        let job_workers = job_workers
            .unwrap_or_else(|| env.default_job_workers())
            .max(1);
        let concurrency_per_worker = concurrency_per_worker
            .unwrap_or(MIN_WORKER_CONCURRENCY)
            .clamp(MIN_WORKER_CONCURRENCY, MAX_WORKER_CONCURRENCY);
        Self {
            env,
            job_workers,
            concurrency_per_worker,
            db_pool_size: db_pool_size.max(1),
            db_reserved_connections,
        }
    }

    /// Connections actually available to workers.
    pub fn db_connection_budget(&self) -> usize {
        self.db_pool_size
            .saturating_sub(self.db_reserved_connections)
            .max(1) as usize
    }

    /// Total worker capacity.
    ///
    /// Staging additionally caps capacity to the database connection budget
    /// so interactive queries keep their reserved connections.
    pub fn total_capacity(&self) -> usize {
        let raw = self.job_workers * self.concurrency_per_worker;
        match self.env {
            AppEnv::Staging => raw.min(self.db_connection_budget()),
            _ => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_defaults() {
        assert_eq!(AppEnv::Development.default_job_workers(), 5);
        assert_eq!(AppEnv::Staging.default_job_workers(), 10);
        assert_eq!(AppEnv::Production.default_job_workers(), 30);
        assert_eq!("staging".parse::<AppEnv>().unwrap(), AppEnv::Staging);
        assert!("qa".parse::<AppEnv>().is_err());
    }

    #[test]
    fn concurrency_is_clamped() {
        let s = WorkerSizing::resolve(AppEnv::Production, None, Some(99), 50, 0);
        assert_eq!(s.concurrency_per_worker, MAX_WORKER_CONCURRENCY);
        let s = WorkerSizing::resolve(AppEnv::Production, None, Some(0), 50, 0);
        assert_eq!(s.concurrency_per_worker, MIN_WORKER_CONCURRENCY);
    }

    #[test]
    fn staging_caps_capacity_to_connection_budget() {
        let s = WorkerSizing::resolve(AppEnv::Staging, Some(10), Some(4), 20, 8);
        // 40 raw workers but only 12 connections left for them.
        assert_eq!(s.total_capacity(), 12);

        let prod = WorkerSizing::resolve(AppEnv::Production, Some(10), Some(4), 20, 8);
        assert_eq!(prod.total_capacity(), 40);
    }

    #[test]
    fn budget_never_reaches_zero() {
        let s = WorkerSizing::resolve(AppEnv::Staging, Some(2), Some(2), 4, 10);
        assert_eq!(s.db_connection_budget(), 1);
        assert_eq!(s.total_capacity(), 1);
    }
}

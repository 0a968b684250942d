use clap::Parser;

use warmfront_core::config::AppEnv;

#[derive(Debug, Clone, Parser)]
#[command(name = "warmfront", version, about = "Warmfront cache-warming orchestrator")]
pub struct Cli {
    /// Deployment environment; selects default worker counts (5/10/30).
    #[arg(long, env = "APP_ENV", default_value = "development")]
    pub app_env: AppEnv,

    /// Number of workers; defaults per environment.
    #[arg(long, env = "JOB_WORKERS")]
    pub job_workers: Option<usize>,

    /// Inner parallelism per worker.
    #[arg(
        long,
        env = "WORKER_CONCURRENCY",
        value_parser = clap::value_parser!(u16).range(1..=20)
    )]
    pub worker_concurrency: Option<u16>,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Dedicated connection string for the batched result queue.
    #[arg(long, env = "DATABASE_QUEUE_URL")]
    pub database_queue_url: Option<String>,

    /// Database pool size shared by workers and interactive queries.
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 20)]
    pub db_pool_size: u32,

    /// Connections withheld from workers for interactive queries.
    #[arg(long, env = "DB_POOL_RESERVED_CONNECTIONS", default_value_t = 0)]
    pub db_pool_reserved_connections: u32,

    /// Run against an in-memory store instead of Postgres (development).
    #[arg(long, env = "WARMFRONT_IN_MEMORY", default_value_t = false)]
    pub in_memory: bool,

    /// Create a cache-warming job for this domain at startup.
    #[arg(long, value_name = "DOMAIN")]
    pub warm: Option<String>,

    /// Per-job concurrency for `--warm` jobs (0 = unlimited).
    #[arg(long, default_value_t = 5)]
    pub warm_concurrency: i32,

    /// Page cap for `--warm` jobs (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub warm_max_pages: i64,

    /// Follow links discovered while crawling `--warm` jobs.
    #[arg(long, default_value_t = false)]
    pub warm_find_links: bool,
}

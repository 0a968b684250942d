mod cli;
mod shutdown;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use warmfront_core::config::WorkerSizing;
use warmfront_core::model::JobOptions;
use warmfront_engine::crawler::{Crawler, HttpCrawler, HttpCrawlerConfig};
use warmfront_engine::governor::{GovernorConfig, RateGovernor};
use warmfront_engine::health::{HealthConfig, run_health_monitor};
use warmfront_engine::manager::JobManager;
use warmfront_engine::quota::{QuotaSweepConfig, run_quota_sweep};
use warmfront_engine::scheduler::{SchedulerConfig, run_scheduler_loop};
use warmfront_engine::source::{SitemapSource, UrlSource};
use warmfront_engine::{
    PoolConfig, PoolDeps, PoolEvent, Shutdown, TaskDisposition, start_pool,
};
use warmfront_store::memory::MemoryStore;
use warmfront_store::pg::{PgStore, PgStoreConfig};
use warmfront_store::queue::{ResultQueue, ResultQueueConfig};
use warmfront_store::Store;

use crate::cli::Cli;
use crate::shutdown::{ShutdownEvent, spawn_ctrl_c_listener};

const SITEMAP_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const SITEMAP_MAX_URLS: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init();

    let sizing = WorkerSizing::resolve(
        cli.app_env,
        cli.job_workers,
        cli.worker_concurrency.map(|v| v as usize),
        cli.db_pool_size,
        cli.db_pool_reserved_connections,
    );
    info!(
        env = %sizing.env,
        workers = sizing.job_workers,
        concurrency = sizing.concurrency_per_worker,
        capacity = sizing.total_capacity(),
        "warmfront {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let (store, pg): (Arc<dyn Store>, Option<Arc<PgStore>>) = if cli.in_memory {
        info!("using the in-memory store (state is not persisted)");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let database_url = cli.database_url.clone().ok_or_else(|| {
            anyhow::anyhow!("DATABASE_URL is required (or pass --in-memory for development)")
        })?;
        let mut config = PgStoreConfig::new(database_url);
        config.queue_database_url = cli.database_queue_url.clone();
        config.max_connections = cli.db_pool_size;
        let pg = Arc::new(PgStore::connect(&config).await?);
        pg.migrate().await?;
        (pg.clone() as Arc<dyn Store>, Some(pg))
    };

    let (queue, queue_driver) = ResultQueue::start(store.clone(), ResultQueueConfig::default());
    let queue_health = queue.health();
    let governor = RateGovernor::new(store.clone(), GovernorConfig::default());
    let user_agent = format!("warmfront/{}", env!("CARGO_PKG_VERSION"));
    let source: Arc<dyn UrlSource> = Arc::new(SitemapSource::new(
        &user_agent,
        SITEMAP_FETCH_TIMEOUT,
        SITEMAP_MAX_URLS,
    )?);
    let crawler: Arc<dyn Crawler> = Arc::new(HttpCrawler::new(
        HttpCrawlerConfig {
            user_agent,
            ..HttpCrawlerConfig::default()
        },
        Some(source.clone()),
    )?);
    let manager = JobManager::new(store.clone(), source);

    // The staging capacity cap can shrink total capacity below the
    // workers × concurrency product; flatten to capped single loops then.
    let raw_capacity = sizing.job_workers * sizing.concurrency_per_worker;
    let pool_config = if sizing.total_capacity() < raw_capacity {
        warn!(
            capacity = sizing.total_capacity(),
            requested = raw_capacity,
            "worker capacity capped to the database connection budget"
        );
        PoolConfig::new(sizing.total_capacity(), 1)
    } else {
        PoolConfig::new(sizing.job_workers, sizing.concurrency_per_worker)
    };

    let pool = start_pool(
        pool_config,
        PoolDeps {
            store: store.clone(),
            queue: queue.clone(),
            queue_driver,
            governor,
            crawler,
            manager: manager.clone(),
        },
    );

    let shutdown = Shutdown::new();
    let scheduler_task = tokio::spawn(run_scheduler_loop(
        store.clone(),
        manager.clone(),
        SchedulerConfig::default(),
        shutdown.clone(),
    ));
    let health_task = tokio::spawn(run_health_monitor(
        store.clone(),
        queue_health,
        HealthConfig::default(),
        shutdown.clone(),
    ));
    let quota_task = tokio::spawn(run_quota_sweep(
        store.clone(),
        QuotaSweepConfig::default(),
        shutdown.clone(),
    ));

    if let Some(domain) = &cli.warm {
        let mut options = JobOptions::new(domain.clone());
        options.concurrency = cli.warm_concurrency;
        options.max_pages = cli.warm_max_pages;
        options.find_links = cli.warm_find_links;
        options.source = Some("cli".to_string());
        let job = manager.create_job(options).await?;
        info!(job_id = %job.id, domain = %domain, "warm job created");
    }

    let mut events = pool.subscribe();
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_listener(shutdown_tx);

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => match ev {
                Some(ShutdownEvent::Graceful) => {
                    info!("stop requested, draining in-flight work (CTRL+C again exits immediately)");
                    pool.request_stop();
                }
                Some(ShutdownEvent::Immediate) => {
                    warn!("second stop request, exiting immediately");
                    immediate_exit = true;
                    break;
                }
                None => {}
            },
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match evt {
                    PoolEvent::TaskFinished { task, disposition, response_time_ms, cache_status, error, .. } => {
                        match disposition {
                            TaskDisposition::Completed => info!(
                                url = %task.url,
                                response_time_ms = response_time_ms.unwrap_or(0),
                                cache_status = cache_status.as_deref().unwrap_or("unknown"),
                                "warmed"
                            ),
                            TaskDisposition::Retrying => warn!(
                                url = %task.url,
                                attempt = task.attempt,
                                error = error.as_deref().unwrap_or(""),
                                "crawl failed, will retry"
                            ),
                            TaskDisposition::Failed => warn!(
                                url = %task.url,
                                error = error.as_deref().unwrap_or(""),
                                "crawl failed permanently"
                            ),
                        }
                    }
                    PoolEvent::Warning { message } => warn!("{message}"),
                    PoolEvent::Error { message } => error!("{message}"),
                    PoolEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    // Orderly teardown: drain the pool (which flushes the queue), stop the
    // background loops, then close the store.
    pool.wait().await?;
    shutdown.request();
    let _ = scheduler_task.await;
    let _ = health_task.await;
    let _ = quota_task.await;
    if let Some(pg) = pg {
        pg.close().await;
    }
    Ok(())
}

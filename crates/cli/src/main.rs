//! geoanomaly: scheduler, worker pool and operator tools.

mod cli;
mod csv_import;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use geoanomaly_compute::{Backends, Scheduler, WorkerPool};
use geoanomaly_core::config::{self, Config};
use geoanomaly_core::{Clock, FixedClock, SystemClock};
use geoanomaly_queue::{
    InMemoryResultCache, InMemoryTaskQueue, PgResultCache, ResultCache, SqsTaskQueue, TaskQueue,
};
use geoanomaly_storage::{postgres, AnomalyQuery, AnomalyStore, MemoryStore, PgStore};

use crate::cli::{Cli, Command};

/// Connect the configured backends: PostgreSQL for stores and the result
/// cache when configured (memory otherwise), SQS or memory for the queue.
async fn connect_backends(config: &Config, migrate: bool) -> anyhow::Result<Backends> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue: Arc<dyn TaskQueue> = if config.queue.is_sqs() {
        Arc::new(SqsTaskQueue::new(&config.aws, &config.queue).await?)
    } else {
        warn!("QUEUE_PROVIDER is not sqs; using an in-process queue");
        Arc::new(InMemoryTaskQueue::new(std::time::Duration::from_secs(
            config.queue.visibility_timeout_secs as u64,
        )))
    };

    if !config.postgres.is_configured() {
        warn!("PostgreSQL is not configured; using in-process stores");
        let cache = Arc::new(InMemoryResultCache::new(
            clock.clone(),
            config.scheduler.status_ttl(),
        ));
        return Ok(Backends::with_store(Arc::new(MemoryStore::new()), queue, cache, clock));
    }

    let pool = postgres::connect(&config.postgres)
        .await
        .context("connecting to PostgreSQL")?;
    if migrate {
        postgres::run_migrations(&pool).await?;
    }
    let cache = PgResultCache::new(pool.clone(), config.scheduler.status_ttl());
    let purged = cache.purge_expired().await?;
    if purged > 0 {
        info!(purged, "Purged expired result-cache rows");
    }
    let cache: Arc<dyn ResultCache> = Arc::new(cache);
    Ok(Backends::with_store(Arc::new(PgStore::new(pool)), queue, cache, clock))
}

/// Log queue reachability and dead letters before a long-running loop.
async fn log_queue_health(backends: &Backends) {
    match backends.queue.health_check().await {
        Ok(health) => info!(%health, "Queue health"),
        Err(e) => warn!(error = %e, "Queue health check failed"),
    }
    match backends.queue.dlq_depth().await {
        Ok(Some(depth)) if depth > 0 => warn!(depth, "Dead-letter queue holds messages"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Dead-letter depth unavailable"),
    }
}

/// Run `on_signal` once Ctrl-C arrives.
fn on_ctrl_c(on_signal: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal();
        }
    });
}

async fn run_in_process(
    config: &Config,
    csv: &std::path::Path,
    now: Option<chrono::DateTime<chrono::Utc>>,
    min_severity: Option<f64>,
) -> anyhow::Result<()> {
    let observations = csv_import::load_csv(csv)?;
    let store = Arc::new(MemoryStore::new());
    store.insert_observations(observations).await;

    let clock: Arc<dyn Clock> = match now {
        Some(now) => Arc::new(FixedClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let cache = Arc::new(InMemoryResultCache::new(
        clock.clone(),
        config.scheduler.status_ttl(),
    ));
    let queue = Arc::new(InMemoryTaskQueue::default());
    let backends = Backends::with_store(store.clone(), queue, cache, clock);

    let scheduler = Scheduler::new(
        backends.clone(),
        config.pipeline.clone(),
        config.scheduler.clone(),
    )?;
    let workers = Arc::new(WorkerPool::new(
        backends,
        &config.pipeline,
        &config.worker,
        &config.scheduler,
    )?);

    let report = scheduler.sweep().await?;
    let processed = workers.drain().await?;
    let progress = scheduler.progress(&report).await?;
    info!(
        series = report.series_seen,
        processed,
        done = progress.done,
        skipped = progress.skipped,
        failed = progress.failed,
        success_ratio = progress.success_ratio,
        "In-process run finished"
    );

    let query = AnomalyQuery {
        min_severity,
        ..AnomalyQuery::default()
    };
    let records = store.query_anomalies(&query).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    config::load_dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env();
    config.log_summary();

    match cli.command {
        Command::Scheduler => {
            let backends = connect_backends(&config, cli.migrate).await?;
            log_queue_health(&backends).await;
            let scheduler = Arc::new(Scheduler::new(
                backends,
                config.pipeline.clone(),
                config.scheduler.clone(),
            )?);
            let handle = Arc::clone(&scheduler);
            on_ctrl_c(move || handle.shutdown());
            scheduler.run().await;
        }
        Command::Sweep => {
            let backends = connect_backends(&config, cli.migrate).await?;
            let scheduler =
                Scheduler::new(backends, config.pipeline.clone(), config.scheduler.clone())?;
            let report = scheduler.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Worker { concurrency } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            let backends = connect_backends(&config, cli.migrate).await?;
            log_queue_health(&backends).await;
            let workers = Arc::new(WorkerPool::new(
                backends,
                &config.pipeline,
                &config.worker,
                &config.scheduler,
            )?);
            let handle = Arc::clone(&workers);
            on_ctrl_c(move || handle.shutdown());
            workers.run().await;
        }
        Command::Backfill {
            entity,
            from,
            until,
            step_hours,
        } => {
            let backends = connect_backends(&config, cli.migrate).await?;
            let scheduler =
                Scheduler::new(backends, config.pipeline.clone(), config.scheduler.clone())?;
            let report = scheduler
                .backfill(
                    entity.as_deref(),
                    from,
                    until,
                    chrono::Duration::hours(step_hours),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Import { csv } => {
            anyhow::ensure!(
                config.postgres.is_configured(),
                "import needs PostgreSQL (set PG_USERNAME and PG_HOST)"
            );
            let observations = csv_import::load_csv(&csv)?;
            let pool = postgres::connect(&config.postgres).await?;
            if cli.migrate {
                postgres::run_migrations(&pool).await?;
            }
            let written = PgStore::new(pool).insert_observations(&observations).await?;
            info!(written, path = %csv.display(), "Import complete");
        }
        Command::Run {
            csv,
            now,
            min_severity,
        } => {
            run_in_process(&config, &csv, now, min_severity).await?;
        }
        Command::Status => {
            let backends = connect_backends(&config, cli.migrate).await?;
            let scheduler =
                Scheduler::new(backends, config.pipeline.clone(), config.scheduler.clone())?;
            let status = scheduler.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Tasks { status } => {
            let backends = connect_backends(&config, cli.migrate).await?;
            let scheduler =
                Scheduler::new(backends, config.pipeline.clone(), config.scheduler.clone())?;
            let states = scheduler.tasks(status).await?;
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
    }

    Ok(())
}

// ==============================================================================
// main.rs - Ingest Worker Process
// ==============================================================================
// Description: Background worker that admits pending jobs during the operating
//              window and dispatches them to the processing service
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ingest_core::config::IngestConfig;
use ingest_core::dispatcher::{HttpProcessingService, TaskDispatcher};
use ingest_core::postgres::{PgRepository, MIGRATOR};
use ingest_core::progress::ProgressPublisher;
use ingest_core::repository::JobRepository;
use ingest_core::resource::SystemResourceMonitor;
use ingest_core::scheduler::Scheduler;
use ingest_core::task_queue::TaskQueue;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::RedisProgressPublisher;

const STUCK_JOB_MESSAGE: &str = "Job interrupted by worker restart. Please resubmit the task.";

#[derive(Parser, Debug)]
#[command(author, version, about = "Schedules and dispatches queued processing jobs", long_about = None)]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string (progress pub/sub)
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Maximum PostgreSQL connections
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Skip startup recovery of jobs left in `processing`
    #[arg(long)]
    skip_recovery: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before parsing so .env values reach clap
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Ingest Worker v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = IngestConfig::from_env().context("Invalid configuration")?;

    // Initialize database connection
    let db_pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    MIGRATOR
        .run(&db_pool)
        .await
        .context("Failed to run database migrations")?;

    info!("Connected to PostgreSQL");

    // Initialize Redis connection
    let redis_client = RedisClient::open(args.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;

    info!("Connected to Redis");

    let repository = Arc::new(PgRepository::new(db_pool));
    let publisher: Arc<dyn ProgressPublisher> = Arc::new(RedisProgressPublisher::new(redis_conn));

    if args.skip_recovery {
        warn!("Skipping stuck job recovery");
    } else if let Err(e) = recover_stuck_jobs(repository.as_ref(), &config).await {
        error!("Failed to recover stuck jobs: {}", e);
    }

    let service = HttpProcessingService::new(&config.dispatcher)
        .context("Failed to build processing service client")?;
    let dispatcher = TaskDispatcher::new(Arc::new(service), config.dispatcher.timeout);
    let monitor = Arc::new(SystemResourceMonitor::new(config.queue.memory_threshold));

    let queue = TaskQueue::new(
        config.queue.clone(),
        repository.clone(),
        Arc::new(dispatcher),
        monitor.clone(),
        publisher,
    );
    let scheduler = Scheduler::new(config.scheduler.clone(), repository, queue, monitor);

    if scheduler.window().is_admission_window_open(Utc::now()) {
        info!("Started inside the admission window");
    }

    info!(
        "Worker ready (max {} concurrent tasks, dispatching to {})",
        config.queue.max_concurrent_tasks, config.dispatcher.base_url
    );
    scheduler.run(shutdown_signal()).await;

    info!("Worker stopped");
    Ok(())
}

/// Fail jobs left in `processing` by a previous worker instance
async fn recover_stuck_jobs(jobs: &dyn JobRepository, config: &IngestConfig) -> Result<()> {
    let recovered = jobs
        .recover_stuck(config.scheduler.stuck_job_cutoff, STUCK_JOB_MESSAGE)
        .await
        .context("Failed to query stuck jobs")?;

    if recovered == 0 {
        info!("No stuck jobs found");
    } else {
        warn!("Marked {} stuck job(s) as failed", recovered);
    }

    // younger interrupted jobs go back to the queue
    let requeued = jobs
        .requeue_processing()
        .await
        .context("Failed to requeue interrupted jobs")?;
    if requeued > 0 {
        warn!("Returned {} interrupted job(s) to pending", requeued);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::memory::MemoryRepository;
    use ingest_core::models::{DataFormat, JobStatus, NewJob};
    use std::time::Duration;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "ingest-worker",
            "--database-url",
            "postgres://localhost/ingest",
            "--max-connections",
            "8",
        ])
        .unwrap();

        assert_eq!(args.database_url, "postgres://localhost/ingest");
        assert_eq!(args.max_connections, 8);
        assert!(!args.skip_recovery);
    }

    async fn processing_job(repo: &MemoryRepository, started_ago: chrono::Duration) -> i64 {
        let job = repo
            .create_job(NewJob {
                project_id: 1,
                user_id: 1,
                name: "interrupted".to_string(),
                task_type: "cluster".to_string(),
                data_format: DataFormat::default(),
                priority: 0,
                files: vec![],
                total_size: 0,
            })
            .await
            .unwrap();
        repo.transition(job.id, JobStatus::Processing, None).await.unwrap();
        repo.set_started_at(job.id, Utc::now() - started_ago);
        job.id
    }

    #[tokio::test]
    async fn test_recover_requeues_recent_processing_jobs() {
        let repo = MemoryRepository::new();
        let recent = processing_job(&repo, chrono::Duration::minutes(5)).await;
        let old = processing_job(&repo, chrono::Duration::hours(2)).await;

        recover_stuck_jobs(&repo, &IngestConfig::default()).await.unwrap();

        let recent = repo.get_job(recent).await.unwrap();
        assert_eq!(recent.status, JobStatus::Pending);
        assert_eq!(recent.error_message, None);
        assert_eq!(repo.get_job(old).await.unwrap().status, JobStatus::Failed);

        let pending = repo.fetch_pending(Duration::ZERO, 10).await.unwrap();
        assert_eq!(pending.iter().map(|job| job.id).collect::<Vec<_>>(), vec![recent.id]);
    }

    #[tokio::test]
    async fn test_recover_stuck_jobs_fails_old_processing_jobs() {
        let repo = MemoryRepository::new();
        let job = processing_job(&repo, chrono::Duration::hours(2)).await;

        recover_stuck_jobs(&repo, &IngestConfig::default()).await.unwrap();

        let job = repo.get_job(job).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(STUCK_JOB_MESSAGE));
    }
}

// ==============================================================================
// state.rs - Application State Management
// ==============================================================================
// Description: Shared application state for the ingest API gateway
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use ingest_core::config::IngestConfig;
use ingest_core::postgres::{PgRepository, MIGRATOR};
use ingest_core::repository::{FileRepository, JobRepository};
use ingest_core::session::SessionRegistry;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Upload sessions, owned here and injected into handlers
    sessions: Arc<SessionRegistry>,

    files: Arc<dyn FileRepository>,

    jobs: Arc<dyn JobRepository>,

    config: IngestConfig,

    /// PostgreSQL pool, absent when running against in-memory repositories
    db_pool: Option<PgPool>,
}

impl AppState {
    /// Create new application state from environment
    pub async fn new() -> Result<Self> {
        let config = IngestConfig::from_env().context("Invalid configuration")?;

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(10);

        let db_pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        MIGRATOR
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;

        tokio::fs::create_dir_all(&config.upload.upload_root)
            .await
            .context("Failed to create upload root")?;

        let repository = Arc::new(PgRepository::new(db_pool.clone()));
        Ok(Self::from_parts(config, repository, Some(db_pool)))
    }

    /// Assemble state around a repository that stores both files and jobs
    pub fn from_parts<R>(config: IngestConfig, repository: Arc<R>, db_pool: Option<PgPool>) -> Self
    where
        R: FileRepository + JobRepository + 'static,
    {
        let files: Arc<dyn FileRepository> = repository.clone();
        let jobs: Arc<dyn JobRepository> = repository;
        let sessions = Arc::new(SessionRegistry::new(&config.upload, files.clone()));

        Self {
            inner: Arc::new(AppStateInner {
                sessions,
                files,
                jobs,
                config,
                db_pool,
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn files(&self) -> &dyn FileRepository {
        self.inner.files.as_ref()
    }

    pub fn jobs(&self) -> &dyn JobRepository {
        self.inner.jobs.as_ref()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    pub fn db_pool(&self) -> Option<&PgPool> {
        self.inner.db_pool.as_ref()
    }

    /// In-memory state rooted at `upload_root` for handler tests
    #[cfg(test)]
    pub fn in_memory(
        upload_root: &std::path::Path,
    ) -> (Self, Arc<ingest_core::memory::MemoryRepository>) {
        let mut config = IngestConfig::default();
        config.upload.upload_root = upload_root.to_path_buf();
        let repository = Arc::new(ingest_core::memory::MemoryRepository::new());
        (Self::from_parts(config, repository.clone(), None), repository)
    }
}

// ==============================================================================
// progress.rs - Redis Progress Publisher (Worker Side)
// ==============================================================================
// Description: Publishes job progress updates on Redis pub/sub
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use ingest_core::progress::{ProgressPublisher, ProgressUpdate};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

const CHANNEL_PREFIX: &str = "ingest:progress";

pub fn progress_channel(job_id: i64) -> String {
    format!("{}:{}", CHANNEL_PREFIX, job_id)
}

/// Progress publisher backed by a Redis connection manager
#[derive(Clone)]
pub struct RedisProgressPublisher {
    conn: ConnectionManager,
}

impl RedisProgressPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProgressPublisher for RedisProgressPublisher {
    async fn publish(&self, update: ProgressUpdate) {
        let message = match serde_json::to_string(&update) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to serialize progress for job {}: {}", update.job_id, e);
                return;
            }
        };

        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .publish::<_, _, ()>(progress_channel(update.job_id), message)
            .await
        {
            warn!("Failed to publish progress for job {}: {}", update.job_id, e);
        }
    }
}

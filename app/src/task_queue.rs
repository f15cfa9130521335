// ==============================================================================
// task_queue.rs - Weighted Task Queue
// ==============================================================================
// Description: In-memory job queue with bounded concurrency, pressure backoff,
//              segmented execution of large inputs, and per-job retry
// Author: Matt Barham
// Created: 2026-10-15
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
//
// The pending list, active set and retry counters share one mutex. The mutex
// is never held across an await. Every state change that can free capacity
// ends in `pump()`, which admits as many jobs as the cap and the resource
// monitor allow and spawns one task per admitted job.
//
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{IngestError, Result};
use crate::execution_log::ExecutionLog;
use crate::models::{JobStatus, ProcessingJob};
use crate::progress::{ProgressPublisher, ProgressUpdate};
use crate::repository::JobRepository;
use crate::resource::ResourceMonitor;
use crate::retry::RetryPolicy;

pub const BASE_WEIGHT: f64 = 1.0;
pub const SIZE_FACTOR: f64 = 0.3;
pub const PRIORITY_FACTOR: f64 = 0.4;
pub const TIME_FACTOR: f64 = 0.3;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Composite scheduling weight; higher runs first.
///
/// Sizes below 1 MB are clamped to 1 MB so the size term is never negative
/// or undefined.
pub fn job_weight(total_size: u64, priority: i32, waited: Duration) -> f64 {
    let size_mb = (total_size as f64 / BYTES_PER_MB).max(1.0);
    let wait_hours = waited.as_secs_f64() / 3600.0;

    BASE_WEIGHT
        + SIZE_FACTOR * size_mb.log10()
        + PRIORITY_FACTOR * f64::from(priority)
        + TIME_FACTOR * (1.0 + wait_hours).log10()
}

fn weight_at(job: &ProcessingJob, now: DateTime<Utc>) -> f64 {
    let waited = (now - job.created_at).to_std().unwrap_or(Duration::ZERO);
    job_weight(job.total_size, job.priority, waited)
}

/// Byte range `[start, end)` of a large input handled as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

pub fn plan_segments(total_size: u64, segment_size: u64) -> Vec<Segment> {
    let segment_size = segment_size.max(1);
    let count = total_size.div_ceil(segment_size);
    (0..count)
        .map(|index| {
            let start = index * segment_size;
            Segment {
                index,
                start,
                end: (start + segment_size).min(total_size),
            }
        })
        .collect()
}

/// Performs one dispatch attempt for a job (or one segment of it)
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &ProcessingJob, segment: Option<Segment>) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    pending: Vec<ProcessingJob>,
    active: HashSet<i64>,
    /// Retries already spent per job
    retries: HashMap<i64, u32>,
    /// Jobs sleeping before a requeue; they hold no concurrency slot
    waiting: HashSet<i64>,
    deferred: bool,
}

struct QueueInner {
    config: QueueConfig,
    retry: RetryPolicy,
    jobs: Arc<dyn JobRepository>,
    executor: Arc<dyn JobExecutor>,
    monitor: Arc<dyn ResourceMonitor>,
    progress: Arc<dyn ProgressPublisher>,
    state: Mutex<QueueState>,
}

enum Attempt {
    Completed,
    Skipped,
    Deferred,
    Failed(IngestError),
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        jobs: Arc<dyn JobRepository>,
        executor: Arc<dyn JobExecutor>,
        monitor: Arc<dyn ResourceMonitor>,
        progress: Arc<dyn ProgressPublisher>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(QueueInner {
                config,
                retry,
                jobs,
                executor,
                monitor,
                progress,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job and re-sort by weight. Returns false when the job is already
    /// queued, running, or waiting for a retry.
    pub fn enqueue(&self, job: ProcessingJob) -> bool {
        {
            let mut state = self.state();
            let id = job.id;
            if state.active.contains(&id)
                || state.waiting.contains(&id)
                || state.pending.iter().any(|queued| queued.id == id)
            {
                debug!("Job {} already queued", id);
                return false;
            }

            state.pending.push(job);
            let now = Utc::now();
            state.pending.sort_by(|a, b| {
                weight_at(b, now)
                    .partial_cmp(&weight_at(a, now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!("Queued job {} ({} pending)", id, state.pending.len());
        }

        self.pump();
        true
    }

    /// Take the highest-weight job if a slot is free and the system is not
    /// under pressure. The returned job holds a concurrency slot.
    pub fn dequeue_next(&self) -> Option<ProcessingJob> {
        {
            let state = self.state();
            if state.pending.is_empty()
                || state.active.len() >= self.inner.config.max_concurrent_tasks
            {
                return None;
            }
        }

        if self.inner.monitor.under_pressure() {
            self.defer();
            return None;
        }

        let mut state = self.state();
        if state.pending.is_empty() || state.active.len() >= self.inner.config.max_concurrent_tasks {
            return None;
        }
        let job = state.pending.remove(0);
        state.active.insert(job.id);
        Some(job)
    }

    pub fn pending_ids(&self) -> Vec<i64> {
        self.state().pending.iter().map(|job| job.id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    /// Nothing pending, running, or waiting for a retry
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && state.active.is_empty() && state.waiting.is_empty()
    }

    /// One delayed admission attempt under resource pressure
    fn defer(&self) {
        {
            let mut state = self.state();
            if state.deferred {
                return;
            }
            state.deferred = true;
        }

        let delay = self.inner.config.pressure_retry_delay;
        warn!("Resource pressure, deferring admission for {:?}", delay);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.state().deferred = false;
            queue.pump();
        });
    }

    fn pump(&self) {
        while let Some(job) = self.dequeue_next() {
            info!("Starting job {} ({})", job.id, job.name);
            let queue = self.clone();
            tokio::spawn(async move { queue.run_job(job).await });
        }
    }

    fn release(&self, job_id: i64) {
        self.state().active.remove(&job_id);
    }

    async fn run_job(self, job: ProcessingJob) {
        let job_id = job.id;
        let attempt = self.state().retries.get(&job_id).copied().unwrap_or(0);

        match self.attempt(&job, attempt).await {
            Attempt::Completed | Attempt::Skipped => {
                self.state().retries.remove(&job_id);
            }
            Attempt::Deferred => {
                let delay = self.inner.config.pressure_retry_delay;
                info!("Job {} deferred for {:?} by resource pressure", job_id, delay);
                self.schedule_requeue(job, delay);
            }
            Attempt::Failed(err) => self.handle_failure(job, attempt, err).await,
        }

        self.release(job_id);
        self.pump();
    }

    async fn attempt(&self, job: &ProcessingJob, attempt: u32) -> Attempt {
        let jobs = &self.inner.jobs;

        let current = match jobs.get_job(job.id).await {
            Ok(current) => current,
            Err(e) => return Attempt::Failed(e),
        };
        if current.status.is_terminal() {
            info!("Job {} is {}, skipping", job.id, current.status);
            return Attempt::Skipped;
        }
        if current.status == JobStatus::Pending {
            match jobs.transition(job.id, JobStatus::Processing, None).await {
                Ok(_) => {}
                Err(IngestError::InvalidTransition { from, .. }) => {
                    info!("Job {} moved to {} before admission, skipping", job.id, from);
                    return Attempt::Skipped;
                }
                Err(e) => return Attempt::Failed(e),
            }
        }
        self.publish(&current, JobStatus::Processing, current.progress, "Processing")
            .await;

        let mut log = ExecutionLog::new(&current, attempt + 1)
            .with_file_sizes(&current)
            .await;
        let log_id = match jobs.start_execution(&log).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to write execution log for job {}: {}", job.id, e);
                None
            }
        };

        let segmented = current.total_size > self.inner.config.large_input_threshold;
        let result = if segmented {
            self.run_segmented(&current).await
        } else {
            self.inner.executor.execute(&current, None).await
        };

        log.finish(result.is_ok(), result.as_ref().err().map(|e| e.to_string()));
        if let Some(log_id) = log_id {
            if let Err(e) = jobs.finish_execution(log_id, &log).await {
                warn!("Failed to close execution log for job {}: {}", job.id, e);
            }
        }

        match result {
            Ok(()) => {
                if !segmented {
                    self.report_progress(&current, 100).await;
                }
                match jobs.transition(job.id, JobStatus::Completed, None).await {
                    Ok(_) => {
                        info!("Job {} completed", job.id);
                        self.publish(&current, JobStatus::Completed, 100, "Completed")
                            .await;
                    }
                    Err(e) => warn!("Job {} finished but was not marked completed: {}", job.id, e),
                }
                Attempt::Completed
            }
            Err(IngestError::ResourcePressure(reason)) => {
                debug!("Job {} hit resource pressure: {}", job.id, reason);
                Attempt::Deferred
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    /// Inputs above the threshold run as segments, `segment_batch_width` at a
    /// time. Progress is written after every batch; one failed segment fails
    /// the attempt.
    async fn run_segmented(&self, job: &ProcessingJob) -> Result<()> {
        let segments = plan_segments(job.total_size, self.inner.config.segment_size);
        let total = segments.len();
        let width = self.inner.config.segment_batch_width.max(1);
        info!(
            "Job {} split into {} segments (batches of {})",
            job.id, total, width
        );

        let mut done = 0usize;
        for batch in segments.chunks(width) {
            let calls = batch
                .iter()
                .map(|segment| self.inner.executor.execute(job, Some(*segment)));
            try_join_all(calls).await?;

            done += batch.len();
            let percent = (done * 100 / total.max(1)) as i32;
            self.report_progress(job, percent).await;
        }
        Ok(())
    }

    async fn handle_failure(&self, job: ProcessingJob, attempt: u32, err: IngestError) {
        let message = err.to_string();

        // client errors fail the same way on every attempt
        if !err.is_client_error() && self.inner.retry.should_retry(attempt) {
            let delay = self.inner.retry.delay(attempt);
            self.state().retries.insert(job.id, attempt + 1);
            warn!(
                "Job {} attempt {} failed: {}; retrying in {:?}",
                job.id,
                attempt + 1,
                message,
                delay
            );
            if let Err(e) = self.inner.jobs.record_error(job.id, &message).await {
                warn!("Failed to record error for job {}: {}", job.id, e);
            }
            self.schedule_requeue(job, delay);
            return;
        }

        self.state().retries.remove(&job.id);
        error!(
            "Job {} failed after {} attempts: {}",
            job.id,
            attempt + 1,
            message
        );
        match self
            .inner
            .jobs
            .transition(job.id, JobStatus::Failed, Some(&message))
            .await
        {
            Ok(_) => self.publish(&job, JobStatus::Failed, job.progress, &message).await,
            Err(e) => warn!("Job {} could not be marked failed: {}", job.id, e),
        }
    }

    /// Put a job back after `delay` without holding a slot meanwhile
    fn schedule_requeue(&self, job: ProcessingJob, delay: Duration) {
        self.state().waiting.insert(job.id);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.requeue(job).await;
        });
    }

    async fn requeue(&self, job: ProcessingJob) {
        let job_id = job.id;
        self.state().waiting.remove(&job_id);

        let latest = match self.inner.jobs.get_job(job_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Could not reload job {} before retry: {}", job_id, e);
                job
            }
        };

        if latest.status.is_terminal() {
            info!("Job {} is {}, dropping retry", job_id, latest.status);
            self.state().retries.remove(&job_id);
            return;
        }
        self.enqueue(latest);
    }

    async fn report_progress(&self, job: &ProcessingJob, percent: i32) {
        if let Err(e) = self.inner.jobs.update_progress(job.id, percent).await {
            warn!("Failed to record progress for job {}: {}", job.id, e);
        }
        self.publish(job, JobStatus::Processing, percent, "Processing")
            .await;
    }

    async fn publish(&self, job: &ProcessingJob, status: JobStatus, progress: i32, message: &str) {
        self.inner
            .progress
            .publish(ProgressUpdate {
                job_id: job.id,
                status,
                progress,
                message: message.to_string(),
            })
            .await;
    }
}

// ==============================================================================
// scheduler.rs - Admission Window Scheduler
// ==============================================================================
// Description: Time-windowed driver that moves eligible pending jobs into the
//              task queue on a fixed cadence
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::repository::JobRepository;
use crate::resource::ResourceMonitor;
use crate::task_queue::TaskQueue;

const SECS_PER_DAY: i64 = 24 * 3600;
const WINDOW_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Daily operating window in a fixed UTC offset. The window may wrap midnight;
/// equal start and end hours mean the window is open all day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    /// Admission stops this long before the window closes
    pub closing_margin: Duration,
    pub offset: FixedOffset,
}

impl AdmissionWindow {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            start_hour: config.window_start_hour,
            end_hour: config.window_end_hour,
            closing_margin: config.closing_margin,
            offset: config.utc_offset,
        }
    }

    fn length_secs(&self) -> i64 {
        let span = (i64::from(self.end_hour) - i64::from(self.start_hour)) * 3600;
        match span.rem_euclid(SECS_PER_DAY) {
            0 => SECS_PER_DAY,
            secs => secs,
        }
    }

    /// Seconds elapsed since the most recent window start (local time)
    fn secs_since_start(&self, now: DateTime<Utc>) -> i64 {
        let local = now.with_timezone(&self.offset);
        let secs_of_day = i64::from(local.num_seconds_from_midnight());
        (secs_of_day - i64::from(self.start_hour) * 3600).rem_euclid(SECS_PER_DAY)
    }

    pub fn is_admission_window_open(&self, now: DateTime<Utc>) -> bool {
        let margin = self.closing_margin.as_secs() as i64;
        self.secs_since_start(now) < self.length_secs() - margin
    }

    /// True when a window start falls in `(prev, now]`
    pub fn window_started_between(&self, prev: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if now <= prev {
            return false;
        }
        let local = now.with_timezone(&self.offset);
        let last_start = now
            - chrono::Duration::seconds(self.secs_since_start(now))
            - chrono::Duration::nanoseconds(i64::from(local.nanosecond() % 1_000_000_000));
        last_start > prev
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    WindowClosed,
    ResourcePressure,
    Admitted(usize),
}

pub struct Scheduler {
    jobs: Arc<dyn JobRepository>,
    queue: TaskQueue,
    monitor: Arc<dyn ResourceMonitor>,
    window: AdmissionWindow,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<dyn JobRepository>,
        queue: TaskQueue,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        Self {
            jobs,
            queue,
            monitor,
            window: AdmissionWindow::from_config(&config),
            config,
        }
    }

    pub fn window(&self) -> &AdmissionWindow {
        &self.window
    }

    /// Regular cadence: jobs older than the minimum age, window permitting
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.admit(now, self.config.min_job_age).await
    }

    /// Window-start trigger: pending jobs regardless of age
    pub async fn bulk_load(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.admit(now, Duration::ZERO).await
    }

    async fn admit(&self, now: DateTime<Utc>, min_age: Duration) -> Result<TickOutcome> {
        if !self.window.is_admission_window_open(now) {
            debug!("Outside admission window, not admitting jobs");
            return Ok(TickOutcome::WindowClosed);
        }
        if self.monitor.under_pressure() {
            info!("Resource pressure, skipping this scheduling round");
            return Ok(TickOutcome::ResourcePressure);
        }

        let pending = self
            .jobs
            .fetch_pending(min_age, self.config.batch_limit)
            .await?;

        let mut admitted = 0;
        for job in pending {
            if self.queue.enqueue(job) {
                admitted += 1;
            }
        }

        if admitted > 0 {
            info!("Admitted {} pending job(s)", admitted);
        }
        Ok(TickOutcome::Admitted(admitted))
    }

    /// Drive the scheduler until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut admission = interval(self.config.interval);
        admission.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window_check = interval(WINDOW_CHECK_INTERVAL);
        window_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_check = Utc::now();
        tokio::pin!(shutdown);

        info!(
            "Scheduler started (every {:?}, window {:02}:00-{:02}:00 {})",
            self.config.interval, self.window.start_hour, self.window.end_hour, self.window.offset
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    return;
                }
                _ = admission.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("Scheduling round failed: {}", e);
                    }
                }
                _ = window_check.tick() => {
                    let now = Utc::now();
                    if self.window.window_started_between(last_check, now) {
                        info!("Admission window opened, bulk-loading pending jobs");
                        if let Err(e) = self.bulk_load(now).await {
                            error!("Window-start bulk load failed: {}", e);
                        }
                    }
                    last_check = now;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::memory::MemoryRepository;
    use crate::models::{DataFormat, NewJob};
    use crate::progress::NoopProgressPublisher;
    use crate::resource::ManualResourceMonitor;
    use crate::task_queue::{JobExecutor, Segment};
    use crate::models::ProcessingJob;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn window() -> AdmissionWindow {
        AdmissionWindow::from_config(&SchedulerConfig::default())
    }

    /// Build a UTC instant from a +08:00 wall-clock time
    fn local(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, day, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_window_wraps_midnight() {
        let w = window();
        assert!(w.is_admission_window_open(local(10, 22, 0)));
        assert!(w.is_admission_window_open(local(10, 23, 59)));
        assert!(w.is_admission_window_open(local(11, 0, 30)));
        assert!(w.is_admission_window_open(local(11, 5, 44)));
        assert!(!w.is_admission_window_open(local(11, 5, 45)));
        assert!(!w.is_admission_window_open(local(11, 6, 0)));
        assert!(!w.is_admission_window_open(local(11, 12, 0)));
        assert!(!w.is_admission_window_open(local(11, 21, 59)));
    }

    #[test]
    fn test_same_day_window() {
        let w = AdmissionWindow {
            start_hour: 9,
            end_hour: 17,
            closing_margin: Duration::ZERO,
            offset: FixedOffset::east_opt(0).unwrap(),
        };
        let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap();
        assert!(!w.is_admission_window_open(at(8, 59)));
        assert!(w.is_admission_window_open(at(9, 0)));
        assert!(w.is_admission_window_open(at(16, 59)));
        assert!(!w.is_admission_window_open(at(17, 0)));
    }

    #[test]
    fn test_window_start_detection() {
        let w = window();
        assert!(w.window_started_between(local(10, 21, 59), local(10, 22, 0)));
        assert!(w.window_started_between(local(10, 21, 55), local(10, 22, 4)));
        assert!(!w.window_started_between(local(10, 22, 0), local(10, 22, 1)));
        assert!(!w.window_started_between(local(10, 12, 0), local(10, 13, 0)));
        assert!(!w.window_started_between(local(10, 22, 5), local(10, 22, 5)));
    }

    struct NeverRuns;

    #[async_trait]
    impl JobExecutor for NeverRuns {
        async fn execute(&self, _job: &ProcessingJob, _segment: Option<Segment>) -> Result<()> {
            Ok(())
        }
    }

    fn new_job(priority: i32) -> NewJob {
        NewJob {
            project_id: 1,
            user_id: 1,
            name: format!("p{}", priority),
            task_type: "cluster".to_string(),
            data_format: DataFormat::default(),
            priority,
            files: vec![],
            total_size: 0,
        }
    }

    /// With `queue_pressure` set, admitted jobs stay in the queue's pending list
    fn scheduler(repo: Arc<MemoryRepository>, queue_pressure: bool) -> (Scheduler, Arc<ManualResourceMonitor>) {
        let queue = TaskQueue::new(
            QueueConfig::default(),
            repo.clone(),
            Arc::new(NeverRuns),
            Arc::new(ManualResourceMonitor::new(queue_pressure)),
            Arc::new(NoopProgressPublisher),
        );
        let monitor = Arc::new(ManualResourceMonitor::new(false));
        let scheduler = Scheduler::new(SchedulerConfig::default(), repo, queue, monitor.clone());
        (scheduler, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_window_age_and_limit() {
        let repo = Arc::new(MemoryRepository::new());
        let (scheduler, _) = scheduler(repo.clone(), true);
        let now = Utc::now();
        for i in 0..12 {
            repo.insert_job_at(new_job(i % 3), now - chrono::Duration::hours(1));
        }
        let fresh = repo.insert_job_at(new_job(9), now);

        let night = local(10, 23, 0);
        let day = local(10, 12, 0);
        assert_eq!(scheduler.tick(day).await.unwrap(), TickOutcome::WindowClosed);

        assert_eq!(scheduler.tick(night).await.unwrap(), TickOutcome::Admitted(10));
        assert!(!scheduler.queue.pending_ids().contains(&fresh.id));

        // Bulk load ignores age; only the fresh job is new to the queue
        let outcome = scheduler.bulk_load(night).await.unwrap();
        assert_eq!(outcome, TickOutcome::Admitted(1));
        assert!(scheduler.queue.pending_ids().contains(&fresh.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_under_pressure() {
        let repo = Arc::new(MemoryRepository::new());
        let (scheduler, monitor) = scheduler(repo.clone(), true);
        repo.insert_job_at(new_job(0), Utc::now() - chrono::Duration::hours(1));

        monitor.set_pressure(true);
        let night = local(11, 1, 0);
        assert_eq!(
            scheduler.tick(night).await.unwrap(),
            TickOutcome::ResourcePressure
        );
        assert!(scheduler.queue.pending_ids().is_empty());
    }
}

//! Job scheduler
//!
//! This module handles:
//! - Resolving the selector into jobs (explicit ids or the auto-mode batch)
//! - Admitting jobs up to the concurrency limit, in priority order
//! - Cancelling jobs that exceed their timeout
//! - Re-queuing failed jobs with the retry policy
//! - Writing the status snapshot and building the final report

use crate::catalog::{sort_by_priority, AutoBatch, BrandLookup, Cursor, JobOutcome};
use crate::config::Config;
use crate::crawler::runner::{JobEnd, JobRun, JobRunner, RunRequest};
use crate::crawler::status::{write_status, SchedulerState, StatusSnapshot};
use crate::output::{JobReport, Report};
use crate::retry::RetryPolicy;
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::state::{BrandJob, JobStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which jobs a run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// These job ids, in priority order
    Jobs(Vec<String>),

    /// The next batch of the catalog, from the auto-mode cursor
    Auto,
}

impl Selector {
    /// Interprets command-line job arguments
    ///
    /// `auto` (or no arguments while auto mode is on) selects the auto
    /// batch. No arguments with auto mode off selects nothing.
    pub fn from_args(args: &[String], auto_mode: bool) -> Option<Self> {
        match args {
            [] if auto_mode => Some(Self::Auto),
            [] => None,
            [single] if single.eq_ignore_ascii_case("auto") => Some(Self::Auto),
            ids => Some(Self::Jobs(ids.to_vec())),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Jobs(ids) => ids.join(","),
            Self::Auto => "auto".to_string(),
        }
    }
}

/// Per-run knobs, usually from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Adopt saved checkpoints on first admission
    pub resume: bool,

    /// Overrides `max-concurrent-jobs`
    pub max_concurrent_jobs: Option<usize>,

    /// Overrides `max-brands-per-session` in auto mode
    pub batch_size: Option<usize>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            resume: true,
            max_concurrent_jobs: None,
            batch_size: None,
        }
    }
}

struct Waiting {
    job: BrandJob,
    not_before: Instant,
}

struct Admitted {
    job: BrandJob,
    cancel: CancellationToken,
    deadline: Instant,
    cancelled_at: Option<Instant>,
    handle: JoinHandle<JobRun>,
}

/// Admits brand jobs and collects their outcomes
pub struct Scheduler {
    config: Arc<Config>,
    lookup: Arc<dyn BrandLookup>,
    runner: Arc<JobRunner>,
    shutdown: ShutdownCoordinator,
    state: Arc<Mutex<SchedulerState>>,
    finished: Arc<Notify>,
    config_hash: Option<String>,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        lookup: Arc<dyn BrandLookup>,
        runner: Arc<JobRunner>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            config,
            lookup,
            runner,
            shutdown,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            finished: Arc::new(Notify::new()),
            config_hash: None,
        }
    }

    /// Hash of the config file, recorded in the auto-mode cursor
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Current view of the run
    pub fn snapshot(&self) -> StatusSnapshot {
        lock(&self.state).snapshot()
    }

    fn status_path(&self) -> PathBuf {
        PathBuf::from(&self.config.output.status_path)
    }

    fn write_snapshot(&self) {
        if let Err(e) = write_status(&self.status_path(), &self.snapshot()) {
            tracing::warn!("Failed to write status snapshot: {}", e);
        }
    }

    /// Runs every selected job to a terminal outcome
    ///
    /// # Returns
    ///
    /// The final report. Unknown job ids appear in it as failed jobs that
    /// were never attempted.
    pub async fn schedule(&self, selector: Selector, options: ScheduleOptions) -> crate::Result<Report> {
        let mut report = Report::new(selector.label());

        let (mut jobs, auto) = match &selector {
            Selector::Jobs(ids) => (self.resolve(ids, &mut report), None),
            Selector::Auto => {
                let (cursor, batch) = self.auto_batch(&options);
                if batch.is_empty() {
                    tracing::info!("Catalog exhausted: every job is completed");
                    report.cursor = Some(cursor);
                    return Ok(report);
                }
                tracing::info!(
                    "Auto batch: {} jobs from index {} ({} remaining)",
                    batch.jobs.len(),
                    batch.start_index,
                    batch.remaining
                );
                (batch.jobs.clone(), Some((cursor, batch)))
            }
        };
        sort_by_priority(&mut jobs);

        let max_running = options
            .max_concurrent_jobs
            .unwrap_or(self.config.scheduler.max_concurrent_jobs)
            .max(1);
        tracing::info!(
            "Scheduling {} jobs, at most {} at a time",
            jobs.len(),
            max_running
        );

        let _status_guard = {
            let state = self.state.clone();
            let path = self.status_path();
            self.shutdown
                .register(ShutdownPhase::StopAdmission, "scheduler status", move || {
                    let snapshot = lock(&state).snapshot();
                    let path = path.clone();
                    async move {
                        if let Err(e) = write_status(&path, &snapshot) {
                            tracing::warn!("Failed to write status snapshot: {}", e);
                        }
                    }
                })
        };

        let order: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let mut results = self.admission_loop(jobs, max_running, &options).await;

        for job_id in &order {
            match results.remove(job_id) {
                Some((job, run)) => {
                    report.push_job(JobReport::new(&job, &run.tasks, run.end.error()));
                }
                None => report.push_job(JobReport::not_attempted(job_id, "interrupted before admission")),
            }
        }
        report.interrupted = self.shutdown.is_triggered();

        if let Some((mut cursor, batch)) = auto {
            for job in &report.jobs {
                if report.interrupted && job.status != JobStatus::Completed {
                    continue;
                }
                let outcome = match job.status {
                    JobStatus::Completed => JobOutcome::Completed,
                    _ => JobOutcome::Failed,
                };
                cursor.record(&job.job_id, outcome);
            }
            cursor.advance(&batch, self.lookup.catalog().len(), self.config_hash.as_deref());
            if let Err(e) = cursor.save(&PathBuf::from(&self.config.output.cursor_path)) {
                tracing::error!("Failed to save auto progress: {}", e);
            }
            report.cursor = Some(cursor);
        }

        self.write_snapshot();
        let stats = self.runner.recovery().statistics();
        if stats.total > 0 {
            tracing::info!(
                "Recovery handled {} errors: {:?}",
                stats.total,
                stats.by_kind
            );
        }
        tracing::info!(
            "Run finished: {}/{} jobs completed ({}%)",
            report.completed_jobs,
            report.total_jobs,
            report.success_rate
        );
        Ok(report)
    }

    fn resolve(&self, ids: &[String], report: &mut Report) -> Vec<BrandJob> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.lookup.resolve(id) {
                Some(job) => jobs.push(job),
                None => {
                    tracing::warn!(job = %id, "Unknown job, skipping");
                    report.push_job(JobReport::not_attempted(id, "unknown job"));
                }
            }
        }
        jobs
    }

    fn auto_batch(&self, options: &ScheduleOptions) -> (Cursor, AutoBatch) {
        let cursor = Cursor::load(&PathBuf::from(&self.config.output.cursor_path));
        if let Some(hash) = &self.config_hash {
            cursor.config_changed(hash);
        }
        let limit = options
            .batch_size
            .unwrap_or(self.config.scheduler.max_brands_per_session);
        let batch = cursor.next_batch(&self.lookup.catalog(), limit);
        (cursor, batch)
    }

    async fn admission_loop(
        &self,
        jobs: Vec<BrandJob>,
        max_running: usize,
        options: &ScheduleOptions,
    ) -> HashMap<String, (BrandJob, JobRun)> {
        let scheduler = &self.config.scheduler;
        let retry = RetryPolicy::from_flags(
            scheduler.retry_attempts,
            Duration::from_millis(scheduler.retry_delay_ms),
            scheduler.exponential_backoff,
            Duration::from_millis(scheduler.max_retry_delay_ms),
        );
        let shutdown = self.shutdown.token();

        let mut waiting: VecDeque<Waiting> = VecDeque::new();
        {
            let mut state = lock(&self.state);
            let now = Instant::now();
            for job in jobs {
                state.enqueue(&job.id);
                waiting.push_back(Waiting {
                    job,
                    not_before: now,
                });
            }
        }

        let mut running: Vec<Admitted> = Vec::new();
        let mut results = HashMap::new();
        let mut next_status = Instant::now();

        loop {
            if !shutdown.is_cancelled() {
                let now = Instant::now();
                while running.len() < max_running {
                    let Some(position) = waiting.iter().position(|w| w.not_before <= now) else {
                        break;
                    };
                    if let Some(entry) = waiting.remove(position) {
                        running.push(self.admit(entry.job, options));
                    }
                }
            }

            if running.is_empty() && (waiting.is_empty() || shutdown.is_cancelled()) {
                break;
            }

            if Instant::now() >= next_status {
                self.write_snapshot();
                next_status = Instant::now() + scheduler.status_interval();
            }

            let finished = self.finished.notified();
            tokio::select! {
                _ = tokio::time::sleep(scheduler.poll_interval()) => {}
                _ = finished => {}
                _ = shutdown.cancelled(), if !shutdown.is_cancelled() => {
                    tracing::warn!("Shutdown requested, admission stopped");
                }
            }

            let (done, still_running): (Vec<Admitted>, Vec<Admitted>) = std::mem::take(&mut running)
                .into_iter()
                .partition(|admitted| admitted.handle.is_finished());
            running = still_running;

            for admitted in done {
                let run = match admitted.handle.await {
                    Ok(run) => run,
                    Err(e) => {
                        tracing::error!(job = %admitted.job.id, "Job task ended abnormally: {}", e);
                        let end = if admitted.cancelled_at.is_some() {
                            JobEnd::TimedOut
                        } else {
                            JobEnd::Failed(format!("job task failed: {}", e))
                        };
                        JobRun {
                            end,
                            tasks: self.runner.saved_tasks(&admitted.job.id),
                        }
                    }
                };
                self.conclude(admitted.job, run, &retry, &mut waiting, &mut results);
            }

            let now = Instant::now();
            for admitted in running.iter_mut() {
                match admitted.cancelled_at {
                    None if now >= admitted.deadline => {
                        tracing::warn!(job = %admitted.job.id, "Job exceeded its timeout, cancelling");
                        admitted.cancel.cancel();
                        admitted.cancelled_at = Some(now);
                    }
                    Some(at) if now >= at + scheduler.cancel_grace() => {
                        if !admitted.handle.is_finished() {
                            tracing::error!(job = %admitted.job.id, "Job did not unwind in time, aborting");
                            admitted.handle.abort();
                        }
                    }
                    _ => {}
                }
            }
        }

        if shutdown.is_cancelled() {
            self.interrupt_waiting(waiting, &mut results);
        }
        results
    }

    /// Settles jobs left waiting for admission when shutdown stopped the loop
    ///
    /// A job sitting out a retry delay already has a result from its last
    /// attempt; that result becomes an interruption. Jobs never admitted
    /// stay out of `results` and are reported as not attempted.
    fn interrupt_waiting(
        &self,
        waiting: VecDeque<Waiting>,
        results: &mut HashMap<String, (BrandJob, JobRun)>,
    ) {
        let mut state = lock(&self.state);
        for Waiting { mut job, .. } in waiting {
            state.forget(&job.id);
            let Some((_, previous)) = results.remove(&job.id) else {
                continue;
            };
            tracing::warn!(
                job = %job.id,
                "Retry abandoned after {} attempt(s), shutting down",
                job.attempts
            );
            job.finish(JobStatus::Failed);
            let run = JobRun {
                end: JobEnd::Interrupted,
                tasks: previous.tasks,
            };
            results.insert(job.id.clone(), (job, run));
        }
    }

    fn admit(&self, mut job: BrandJob, options: &ScheduleOptions) -> Admitted {
        job.start();
        lock(&self.state).start(&job.id);

        let profile = self.config.profile_for(&job.id);
        let request = RunRequest {
            resume: options.resume || job.attempts > 1,
            fresh_session: job.attempts == 1,
        };
        let cancel = self.shutdown.token().child_token();

        let handle = {
            let runner = self.runner.clone();
            let job = job.clone();
            let cancel = cancel.clone();
            let finished = self.finished.clone();
            tokio::spawn(async move {
                let run = runner.run(&job, cancel, request).await;
                finished.notify_one();
                run
            })
        };

        tracing::info!(job = %job.id, "Admitted (attempt {})", job.attempts);
        Admitted {
            job,
            cancel,
            deadline: Instant::now() + profile.timeout,
            cancelled_at: None,
            handle,
        }
    }

    fn conclude(
        &self,
        mut job: BrandJob,
        run: JobRun,
        retry: &RetryPolicy,
        waiting: &mut VecDeque<Waiting>,
        results: &mut HashMap<String, (BrandJob, JobRun)>,
    ) {
        match &run.end {
            JobEnd::Succeeded => {
                job.finish(JobStatus::Completed);
                lock(&self.state).complete(&job.id);
                tracing::info!(
                    job = %job.id,
                    "Completed in {:.1}s after {} attempt(s)",
                    job.duration_secs(),
                    job.attempts
                );
            }
            JobEnd::Interrupted => {
                job.finish(JobStatus::Failed);
                lock(&self.state).forget(&job.id);
            }
            JobEnd::Failed(_) | JobEnd::TimedOut
                if retry.allows_retry(job.attempts) && !self.shutdown.is_triggered() =>
            {
                let delay = retry.delay_for(job.attempts);
                tracing::warn!(
                    job = %job.id,
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    job.attempts,
                    retry.max_attempts,
                    run.end.error().unwrap_or_default(),
                    delay
                );
                job.finish(JobStatus::Queued);
                lock(&self.state).enqueue(&job.id);
                waiting.push_back(Waiting {
                    not_before: Instant::now() + delay,
                    job: job.clone(),
                });
            }
            JobEnd::Failed(_) | JobEnd::TimedOut => {
                job.finish(JobStatus::Failed);
                lock(&self.state).fail(&job.id);
                tracing::error!(
                    job = %job.id,
                    "Failed after {} attempt(s): {}",
                    job.attempts,
                    run.end.error().unwrap_or_default()
                );
            }
        }
        results.insert(job.id.clone(), (job, run));
    }
}

//! Per-job orchestration
//!
//! One admission of a job goes through these steps:
//! - Launching the job's resource pool
//! - Resuming from the checkpoint, or discovering the task set
//! - Running the tasks under the task limiter, with recovery and retries
//! - Finalizing output and clearing a fully complete checkpoint
//! - Tearing the pool down
//!
//! Cancellation (job timeout or shutdown) aborts in-flight tasks; their
//! dropped resource handles destroy the sessions they held.

use crate::checkpoint::{CheckpointManager, StatusExtra};
use crate::config::{Config, JobProfile};
use crate::crawler::hooks::{HookChain, HookRegistry, HookScope};
use crate::driver::{Driver, IdentityConfigurator};
use crate::output::{OutputStore, TaskPayload};
use crate::pool::{ResourcePool, TaskLimiter};
use crate::protocol::ProtocolHealthManager;
use crate::recovery::{ErrorRecovery, RecoveryTarget};
use crate::retry::RetryPolicy;
use crate::scrape::{Discovery, Scraper, TaskEnv};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::state::{BrandJob, CarTask, TaskStatus};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How one admission should treat existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    /// Adopt a saved checkpoint instead of rediscovering
    pub resume: bool,

    /// First admission in this process: failed tasks get their attempts back
    pub fresh_session: bool,
}

/// How one admission ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEnd {
    /// At least `min-completed-tasks` tasks completed
    Succeeded,
    Failed(String),

    /// Cancelled by the job timeout
    TimedOut,

    /// Cancelled by shutdown; in-flight entries stay in progress
    Interrupted,
}

impl JobEnd {
    /// Message recorded for an unsuccessful end
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Succeeded => None,
            Self::Failed(message) => Some(message.clone()),
            Self::TimedOut => Some("job timed out".to_string()),
            Self::Interrupted => Some("interrupted by shutdown".to_string()),
        }
    }
}

/// Result of one admission
#[derive(Debug, Clone)]
pub struct JobRun {
    pub end: JobEnd,

    /// Final tracking entries, in discovery order
    pub tasks: Vec<CarTask>,
}

/// The collaborators every job runs with
pub struct JobRunner {
    config: Arc<Config>,
    driver: Arc<dyn Driver>,
    scraper: Arc<dyn Scraper>,
    output: Arc<dyn OutputStore>,
    identity: Arc<dyn IdentityConfigurator>,
    hooks: HookRegistry,
    recovery: Arc<ErrorRecovery>,
    shutdown: ShutdownCoordinator,
}

enum TaskEnd {
    Completed,
    Failed,
    Stopped,
}

struct AttemptFailure {
    message: String,
    skip: bool,
}

impl AttemptFailure {
    fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            skip: false,
        }
    }
}

/// Everything a spawned task needs, shared across the job's tasks
struct TaskShared {
    job: BrandJob,
    aliases: Vec<String>,
    pool: ResourcePool,
    limiter: TaskLimiter,
    checkpoint: Arc<CheckpointManager>,
    recovery: Arc<ErrorRecovery>,
    scraper: Arc<dyn Scraper>,
    hooks: HookChain,
    retry: RetryPolicy,
    task_timeout: Duration,
    cancel: CancellationToken,
}

async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        driver: Arc<dyn Driver>,
        scraper: Arc<dyn Scraper>,
        output: Arc<dyn OutputStore>,
        identity: Arc<dyn IdentityConfigurator>,
        hooks: HookRegistry,
        recovery: Arc<ErrorRecovery>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            config,
            driver,
            scraper,
            output,
            identity,
            hooks,
            recovery,
            shutdown,
        }
    }

    pub fn recovery(&self) -> &Arc<ErrorRecovery> {
        &self.recovery
    }

    /// Entries of the job's checkpoint file, for a run that was aborted
    /// before it could report them
    pub fn saved_tasks(&self, job_id: &str) -> Vec<CarTask> {
        CheckpointManager::new(
            Path::new(&self.config.output.checkpoint_dir),
            job_id,
            1,
            self.output.clone(),
        )
        .load()
        .map(|checkpoint| checkpoint.tasks)
        .unwrap_or_default()
    }

    /// Runs one admission of `job`
    ///
    /// # Arguments
    ///
    /// * `job` - The job, already marked running by the scheduler
    /// * `cancel` - Cancelled on job timeout or shutdown
    /// * `request` - Resume behaviour for this admission
    pub async fn run(&self, job: &BrandJob, cancel: CancellationToken, request: RunRequest) -> JobRun {
        let profile = self.config.profile_for(&job.id);
        let protocol = Arc::new(ProtocolHealthManager::new(self.config.protocol.clone()));
        let pool = ResourcePool::new(
            job.id.clone(),
            self.driver.clone(),
            protocol,
            self.identity.clone(),
            self.config.browser.clone(),
            Duration::from_millis(self.config.task.acquire_poll_ms),
            RetryPolicy::fixed(
                self.config.task.launch_attempts,
                Duration::from_millis(self.config.task.retry_delay_ms),
            ),
        );
        let checkpoint = Arc::new(CheckpointManager::new(
            Path::new(&self.config.output.checkpoint_dir),
            job.id.clone(),
            profile.max_task_attempts,
            self.output.clone(),
        ));

        let _flush = {
            let checkpoint = checkpoint.clone();
            self.shutdown.register(
                ShutdownPhase::FlushCheckpoints,
                format!("{}: flush checkpoint", job.id),
                move || {
                    let checkpoint = checkpoint.clone();
                    async move {
                        if let Err(e) = checkpoint.flush() {
                            tracing::error!(job = %checkpoint.job_id(), "Checkpoint flush failed: {}", e);
                        }
                    }
                },
            )
        };
        let _release = {
            let pool = pool.clone();
            self.shutdown.register(
                ShutdownPhase::ReleaseResources,
                format!("{}: release pool", job.id),
                move || {
                    let pool = pool.clone();
                    async move { pool.cleanup_all().await }
                },
            )
        };

        tracing::info!(
            job = %job.id,
            "Starting job (attempt {}, {} sessions, {} concurrent tasks)",
            job.attempts,
            profile.pool_size,
            profile.task_concurrency
        );

        let end = self
            .drive(job, &profile, &pool, &checkpoint, &cancel, request)
            .await;
        pool.cleanup_all().await;

        let tasks = checkpoint
            .snapshot()
            .map(|snapshot| snapshot.tasks)
            .unwrap_or_default();
        if !tasks.is_empty() {
            self.settle(job, &checkpoint, &end);
        }
        if end == JobEnd::Succeeded {
            self.recovery.reset(&job.id);
        }

        JobRun { end, tasks }
    }

    async fn drive(
        &self,
        job: &BrandJob,
        profile: &JobProfile,
        pool: &ResourcePool,
        checkpoint: &Arc<CheckpointManager>,
        cancel: &CancellationToken,
        request: RunRequest,
    ) -> JobEnd {
        let hooks = self.hooks.chain(&job.id, &profile.hooks);

        match or_cancel(cancel, pool.init_pool(profile.pool_size)).await {
            None => return self.cancelled(job, checkpoint),
            Some(Err(e)) => {
                tracing::error!(job = %job.id, "{}", e);
                return JobEnd::Failed(e.to_string());
            }
            Some(Ok(_)) => {}
        }

        let pending = match or_cancel(
            cancel,
            self.plan_tasks(job, profile, &hooks, pool, checkpoint, request),
        )
        .await
        {
            None => return self.cancelled(job, checkpoint),
            Some(Err(message)) => {
                tracing::error!(job = %job.id, "{}", message);
                return JobEnd::Failed(message);
            }
            Some(Ok(pending)) => pending,
        };

        let shared = Arc::new(TaskShared {
            job: job.clone(),
            aliases: profile.aliases.clone(),
            pool: pool.clone(),
            limiter: TaskLimiter::new(profile.task_concurrency),
            checkpoint: checkpoint.clone(),
            recovery: self.recovery.clone(),
            scraper: self.scraper.clone(),
            hooks,
            retry: RetryPolicy::from_flags(
                profile.max_task_attempts,
                profile.task_retry_delay,
                profile.task_exponential_backoff,
                profile.task_retry_delay * 8,
            ),
            task_timeout: profile.task_timeout,
            cancel: cancel.clone(),
        });

        if !execute(shared, pending).await {
            return self.cancelled(job, checkpoint);
        }

        let counts = checkpoint.counts();
        if counts.completed >= profile.min_completed_tasks {
            tracing::info!(
                job = %job.id,
                "Job finished: {}/{} tasks completed, {} failed",
                counts.completed,
                counts.total(),
                counts.failed
            );
            JobEnd::Succeeded
        } else {
            let message = format!(
                "only {} of {} tasks completed (minimum {})",
                counts.completed,
                counts.total(),
                profile.min_completed_tasks
            );
            tracing::warn!(job = %job.id, "Job failed: {}", message);
            JobEnd::Failed(message)
        }
    }

    /// Resumes from the checkpoint when allowed, otherwise discovers tasks
    ///
    /// # Returns
    ///
    /// The entries still to execute
    async fn plan_tasks(
        &self,
        job: &BrandJob,
        profile: &JobProfile,
        hooks: &HookChain,
        pool: &ResourcePool,
        checkpoint: &CheckpointManager,
        request: RunRequest,
    ) -> Result<Vec<CarTask>, String> {
        if let Some(saved) = checkpoint.load() {
            if request.resume {
                let plan = checkpoint
                    .prepare_resume(saved, request.fresh_session)
                    .map_err(|e| e.to_string())?;
                if !plan.requeued.is_empty() {
                    tracing::warn!(
                        job = %job.id,
                        "{} completed tasks lost their payload and run again",
                        plan.requeued.len()
                    );
                }
                return Ok(plan.pending);
            }
            tracing::info!(job = %job.id, "Ignoring saved checkpoint, rediscovering tasks");
        }

        let discovery = self.discover(job, profile, hooks, pool).await?;
        if discovery.seeds.is_empty() {
            return Err("discovery found no tasks".to_string());
        }
        let tracked = checkpoint
            .create_tracking(&discovery.seeds, discovery.auxiliary)
            .map_err(|e| e.to_string())?;
        Ok(tracked.tasks)
    }

    async fn discover(
        &self,
        job: &BrandJob,
        profile: &JobProfile,
        hooks: &HookChain,
        pool: &ResourcePool,
    ) -> Result<Discovery, String> {
        let handle = pool.acquire().await.map_err(|e| e.to_string())?;
        let prepared = match pool.create_context(&handle).await {
            Ok(prepared) => prepared,
            Err(e) => {
                pool.destroy(handle).await;
                return Err(format!("Discovery failed: {}", e));
            }
        };

        let result = {
            let env = TaskEnv {
                job_id: &job.id,
                resource_id: handle.id(),
                context: prepared.context.as_ref(),
            };
            tokio::time::timeout(profile.task_timeout, self.scraper.discover(job, &env)).await
        };
        pool.close_context(&prepared.context).await;
        pool.release(handle);

        let mut discovery = match result {
            Ok(Ok(discovery)) => discovery,
            Ok(Err(e)) => return Err(format!("Discovery failed: {}", e)),
            Err(_) => {
                return Err(format!(
                    "Discovery timed out after {}ms",
                    profile.task_timeout.as_millis()
                ))
            }
        };

        let scope = HookScope {
            job,
            aliases: &profile.aliases,
        };
        hooks.on_discovered(&scope, &mut discovery.seeds);

        let before = discovery.seeds.len();
        let mut seen = HashSet::new();
        discovery.seeds.retain(|seed| seen.insert(seed.id.clone()));
        if discovery.seeds.len() < before {
            tracing::debug!(
                job = %job.id,
                "Dropped {} duplicate task ids",
                before - discovery.seeds.len()
            );
        }

        tracing::info!(job = %job.id, "Discovered {} tasks", discovery.seeds.len());
        Ok(discovery)
    }

    /// Ends a cancelled admission
    ///
    /// On shutdown the in-flight entries stay in progress for the next
    /// resume. On timeout they are marked failed, which uses up an attempt.
    fn cancelled(&self, job: &BrandJob, checkpoint: &CheckpointManager) -> JobEnd {
        if self.shutdown.is_triggered() {
            tracing::warn!(job = %job.id, "Interrupted by shutdown");
            return JobEnd::Interrupted;
        }

        let in_flight = checkpoint
            .snapshot()
            .map(|c| c.ids_with_status(TaskStatus::InProgress))
            .unwrap_or_default();
        for task_id in &in_flight {
            if let Err(e) = checkpoint.update_status(
                task_id,
                TaskStatus::Failed,
                StatusExtra::failed("job timed out"),
            ) {
                tracing::error!(job = %job.id, task = %task_id, "{}", e);
            }
        }
        tracing::warn!(
            job = %job.id,
            "Job timed out with {} tasks in flight",
            in_flight.len()
        );
        JobEnd::TimedOut
    }

    /// Finalizes output and drops the checkpoint of a fully complete job
    fn settle(&self, job: &BrandJob, checkpoint: &CheckpointManager, end: &JobEnd) {
        let completeness = checkpoint.completeness();
        if let Err(e) = self.output.finalize(&job.id, completeness.is_complete) {
            tracing::error!(job = %job.id, "Failed to finalize output: {}", e);
        }

        if *end == JobEnd::Succeeded && completeness.is_complete {
            if let Err(e) = checkpoint.clear() {
                tracing::error!(job = %job.id, "Failed to clear checkpoint: {}", e);
            }
            return;
        }

        if !completeness.missing.is_empty() {
            tracing::info!(
                job = %job.id,
                "Checkpoint kept: {} of {} tasks complete ({}%)",
                completeness.completed,
                completeness.expected,
                completeness.percentage
            );
        }
        if let Some(report) = checkpoint.integrity_report() {
            if !report.consistent {
                tracing::warn!(
                    job = %job.id,
                    "Checkpoint integrity: counters {:?} vs entries {:?}, {} completed without partial result",
                    report.counts,
                    report.recounted,
                    report.missing_results.len()
                );
            }
        }
    }
}

/// Runs every pending task to an end
///
/// # Returns
///
/// False if the job was cancelled before all tasks ended
async fn execute(shared: Arc<TaskShared>, pending: Vec<CarTask>) -> bool {
    let mut tasks = JoinSet::new();
    for task in pending {
        tasks.spawn(run_task(shared.clone(), task));
    }

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return false;
            }
            next = tasks.join_next() => match next {
                None => return !shared.cancel.is_cancelled(),
                Some(Err(e)) if e.is_panic() => {
                    tracing::error!(job = %shared.job.id, "Task panicked: {}", e);
                }
                Some(_) => {}
            },
        }
    }
}

/// Drives one task through its attempts
async fn run_task(shared: Arc<TaskShared>, task: CarTask) -> TaskEnd {
    let Some(_permit) = shared.limiter.acquire().await else {
        return TaskEnd::Stopped;
    };
    let job_id = shared.job.id.as_str();

    loop {
        if shared.cancel.is_cancelled() {
            return TaskEnd::Stopped;
        }

        let entry = match shared.checkpoint.update_status(
            &task.id,
            TaskStatus::InProgress,
            StatusExtra::default(),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(job = %job_id, task = %task.id, "{}", e);
                return TaskEnd::Failed;
            }
        };

        let failure = match shared.attempt(&entry).await {
            Ok(payload) => {
                match shared.checkpoint.update_status(
                    &task.id,
                    TaskStatus::Completed,
                    StatusExtra::completed(payload),
                ) {
                    Ok(_) => {
                        shared.log_progress(&task);
                        return TaskEnd::Completed;
                    }
                    Err(e) => AttemptFailure {
                        message: e.to_string(),
                        skip: true,
                    },
                }
            }
            Err(failure) => failure,
        };

        tracing::warn!(
            job = %job_id,
            task = %task.id,
            "Attempt {}/{} failed: {}",
            entry.attempts,
            shared.retry.max_attempts,
            failure.message
        );
        if let Err(e) = shared.checkpoint.update_status(
            &task.id,
            TaskStatus::Failed,
            StatusExtra::failed(failure.message.clone()),
        ) {
            tracing::error!(job = %job_id, task = %task.id, "{}", e);
            return TaskEnd::Failed;
        }

        if failure.skip || !shared.retry.allows_retry(entry.attempts) {
            tracing::error!(
                job = %job_id,
                task = %task.id,
                "Giving up after {} attempts: {}",
                entry.attempts,
                failure.message
            );
            return TaskEnd::Failed;
        }

        let delay = shared.retry.delay_for(entry.attempts);
        if or_cancel(&shared.cancel, tokio::time::sleep(delay)).await.is_none() {
            return TaskEnd::Stopped;
        }
        if let Err(e) =
            shared
                .checkpoint
                .update_status(&task.id, TaskStatus::Pending, StatusExtra::default())
        {
            tracing::error!(job = %job_id, task = %task.id, "{}", e);
            return TaskEnd::Failed;
        }
    }
}

impl TaskShared {
    /// One attempt: borrow a session, prepare a context, scrape, hand back
    async fn attempt(&self, task: &CarTask) -> Result<TaskPayload, AttemptFailure> {
        let mut handle = self
            .pool
            .acquire()
            .await
            .map_err(|e| AttemptFailure::retryable(e.to_string()))?;

        let prepared = match self.pool.create_context(&handle).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.pool.destroy(handle).await;
                return Err(AttemptFailure::retryable(e.to_string()));
            }
        };
        if prepared.degraded {
            tracing::debug!(job = %self.job.id, task = %task.id, "Running on a degraded context");
        }
        let mut context = prepared.context;

        let scraped = {
            let env = TaskEnv {
                job_id: &self.job.id,
                resource_id: handle.id(),
                context: context.as_ref(),
            };
            tokio::time::timeout(self.task_timeout, self.scraper.scrape(task, &env)).await
        };

        let message = match scraped {
            Ok(Ok(mut result)) => {
                let scope = HookScope {
                    job: &self.job,
                    aliases: &self.aliases,
                };
                let checked = self.hooks.on_task_result(&scope, &mut result);
                self.pool.close_context(&context).await;
                self.pool.release(handle);

                return match checked {
                    Ok(()) => Ok(TaskPayload {
                        task_id: task.id.clone(),
                        display_name: task.display_name.clone(),
                        data: result.data,
                        summary: result.summary,
                        completed_at: Utc::now(),
                    }),
                    Err(rejection) => Err(AttemptFailure::retryable(format!(
                        "Result rejected by {}",
                        rejection
                    ))),
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("Task timed out after {}ms", self.task_timeout.as_millis()),
        };

        let outcome = self
            .recovery
            .handle(
                &message,
                &mut RecoveryTarget {
                    job_key: &self.job.id,
                    pool: &self.pool,
                    handle: &mut handle,
                    context: &mut context,
                    limiter: &self.limiter,
                },
            )
            .await;

        self.pool.close_context(&context).await;
        if outcome.recovered {
            self.pool.release(handle);
        } else {
            self.pool.destroy(handle).await;
        }

        Err(AttemptFailure {
            message,
            skip: outcome.should_skip,
        })
    }

    fn log_progress(&self, task: &CarTask) {
        let counts = self.checkpoint.counts();
        let total = counts.total();
        let percentage = if total == 0 {
            0.0
        } else {
            counts.completed as f64 / total as f64 * 100.0
        };
        tracing::info!(
            job = %self.job.id,
            task = %task.id,
            "Progress: {}/{} ({:.1}%)",
            counts.completed,
            total,
            percentage
        );
    }
}

//! Per-job execution profiles
//!
//! A profile is the task-level configuration with a brand's `[[brand]]`
//! overrides applied on top.

use crate::config::types::{BrandEntry, Config};
use std::time::Duration;

/// Brands with many models; they run one task at a time unless overridden
pub const COMPLEX_BRANDS: &[&str] = &["BYD", "Tesla", "BMW", "Audi", "Benz", "Volkswagen", "Toyota"];

/// Image-heavy brands; their task timeout is scaled by `LUXURY_TIMEOUT_FACTOR`
pub const LUXURY_BRANDS: &[&str] = &["Ferrari", "Lamborghini", "RollsRoyce", "Bentley", "AstonMartin"];

const LUXURY_TIMEOUT_FACTOR: u32 = 3;

/// Resolved execution settings for one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobProfile {
    /// Wall-clock budget for one admission of the job
    pub timeout: Duration,

    /// Budget for one scrape call
    pub task_timeout: Duration,

    /// Concurrent tasks within the job; never exceeds `pool_size`
    pub task_concurrency: usize,

    pub pool_size: usize,
    pub max_task_attempts: u32,
    pub task_retry_delay: Duration,
    pub task_exponential_backoff: bool,
    pub min_completed_tasks: usize,

    /// Hook names to look up in the hook registry
    pub hooks: Vec<String>,

    pub aliases: Vec<String>,
}

impl Config {
    /// Looks up the catalog entry for a job id (case-sensitive)
    pub fn brand(&self, job_id: &str) -> Option<&BrandEntry> {
        self.brands.iter().find(|b| b.name == job_id)
    }

    /// Resolves the execution profile for a job
    ///
    /// `[[brand]]` overrides win, then the built-in brand defaults, then the
    /// plain `[task]` settings.
    pub fn profile_for(&self, job_id: &str) -> JobProfile {
        let entry = self.brand(job_id);
        let task = &self.task;

        let pool_size = entry
            .and_then(|e| e.pool_size)
            .unwrap_or(task.pool_size)
            .max(1);
        let task_concurrency = entry
            .and_then(|e| e.task_concurrency)
            .unwrap_or_else(|| {
                if COMPLEX_BRANDS.contains(&job_id) {
                    1
                } else {
                    task.concurrency
                }
            })
            .clamp(1, pool_size);

        let base_task_timeout = Duration::from_millis(task.task_timeout_ms);

        JobProfile {
            timeout: Duration::from_millis(
                entry
                    .and_then(|e| e.timeout_ms)
                    .unwrap_or(self.scheduler.timeout_per_job_ms),
            ),
            task_timeout: match entry.and_then(|e| e.task_timeout_ms) {
                Some(ms) => Duration::from_millis(ms),
                None if LUXURY_BRANDS.contains(&job_id) => {
                    base_task_timeout * LUXURY_TIMEOUT_FACTOR
                }
                None => base_task_timeout,
            },
            task_concurrency,
            pool_size,
            max_task_attempts: entry
                .and_then(|e| e.max_task_attempts)
                .unwrap_or(task.max_attempts)
                .max(1),
            task_retry_delay: Duration::from_millis(task.retry_delay_ms),
            task_exponential_backoff: task.exponential_backoff,
            min_completed_tasks: entry
                .and_then(|e| e.min_completed_tasks)
                .unwrap_or(task.min_completed_tasks),
            hooks: entry.map(|e| e.hooks.clone()).unwrap_or_default(),
            aliases: entry.map(|e| e.aliases.clone()).unwrap_or_default(),
        }
    }
}

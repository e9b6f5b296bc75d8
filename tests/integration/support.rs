//! Shared fixtures: a scripted scraper and a fast test configuration

use async_trait::async_trait;
use marque_crawler::catalog::ConfigCatalog;
use marque_crawler::config::{BrandEntry, Config, RecoveryWaits};
use marque_crawler::crawler::{HookRegistry, JobRunner, Scheduler};
use marque_crawler::driver::{MemoryDriver, StaticIdentity};
use marque_crawler::output::JsonFileStore;
use marque_crawler::recovery::ErrorRecovery;
use marque_crawler::scrape::{
    Discovery, ScrapeError, ScrapeResult, Scraper, TaskEnv, TaskResult, TaskSeed,
};
use marque_crawler::shutdown::ShutdownCoordinator;
use marque_crawler::state::{BrandJob, CarTask, ResultSummary};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// What the fake scraper does for one task id
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Every attempt fails with this message
    Fail(String),

    /// Every attempt hangs until cancelled
    Hang,
}

/// Scraper with a fixed catalog of model ids per brand
#[derive(Default)]
pub struct FakeScraper {
    models: HashMap<String, Vec<String>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    work: Duration,
    discoveries: Mutex<HashMap<String, u32>>,
    failing_discoveries: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, u32>>,
    active: Mutex<HashSet<(String, usize)>>,
    shared_handles: Mutex<u32>,
}

impl FakeScraper {
    pub fn new(models: &[(&str, &[&str])]) -> Self {
        Self {
            models: models
                .iter()
                .map(|(brand, ids)| {
                    (
                        brand.to_string(),
                        ids.iter().map(|id| id.to_string()).collect(),
                    )
                })
                .collect(),
            work: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// Time each successful scrape takes
    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn set_behavior(&self, task_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(task_id.to_string(), behavior);
    }

    /// Makes the next `count` discoveries of a job fail
    pub fn fail_discoveries(&self, job_id: &str, count: u32) {
        self.failing_discoveries
            .lock()
            .unwrap()
            .insert(job_id.to_string(), count);
    }

    pub fn clear_behaviors(&self) {
        self.behaviors.lock().unwrap().clear();
    }

    /// Number of scrape calls seen for a task
    pub fn calls(&self, task_id: &str) -> u32 {
        self.calls.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn scraped_ids(&self) -> HashSet<String> {
        self.calls.lock().unwrap().keys().cloned().collect()
    }

    pub fn discoveries(&self, job_id: &str) -> u32 {
        self.discoveries
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    /// Times two tasks ran on the same pooled session at once
    pub fn shared_handles(&self) -> u32 {
        *self.shared_handles.lock().unwrap()
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn discover(&self, job: &BrandJob, _env: &TaskEnv<'_>) -> ScrapeResult<Discovery> {
        *self
            .discoveries
            .lock()
            .unwrap()
            .entry(job.id.clone())
            .or_insert(0) += 1;

        if let Some(left) = self.failing_discoveries.lock().unwrap().get_mut(&job.id) {
            if *left > 0 {
                *left -= 1;
                return Err(ScrapeError::Extraction(
                    "series list missing from page".to_string(),
                ));
            }
        }

        let seeds = self
            .models
            .get(&job.id)
            .map(|ids| {
                ids.iter()
                    .map(|id| TaskSeed::new(id.clone(), format!("{} Model {}", job.id, id)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Discovery {
            seeds,
            auxiliary: serde_json::json!({ "brand": job.id }),
        })
    }

    async fn scrape(&self, task: &CarTask, env: &TaskEnv<'_>) -> ScrapeResult<TaskResult> {
        *self.calls.lock().unwrap().entry(task.id.clone()).or_insert(0) += 1;

        let slot = (env.job_id.to_string(), env.resource_id);
        if !self.active.lock().unwrap().insert(slot.clone()) {
            *self.shared_handles.lock().unwrap() += 1;
        }

        let behavior = self.behaviors.lock().unwrap().get(&task.id).cloned();
        let result = match behavior {
            Some(Behavior::Fail(message)) => Err(ScrapeError::Extraction(message)),
            Some(Behavior::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            None => {
                tokio::time::sleep(self.work).await;
                Ok(TaskResult {
                    data: serde_json::json!({ "model": task.id, "trims": ["base"] }),
                    summary: ResultSummary {
                        item_count: 1,
                        image_count: 2,
                    },
                })
            }
        };

        self.active.lock().unwrap().remove(&slot);
        result
    }
}

/// Config with every wait shortened and all paths inside `dir`
pub fn test_config(dir: &Path, brands: &[&str]) -> Config {
    let mut config = Config::default();
    let path = |name: &str| dir.join(name).to_string_lossy().into_owned();

    config.scheduler.max_concurrent_jobs = 2;
    config.scheduler.retry_attempts = 1;
    config.scheduler.retry_delay_ms = 0;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.status_interval_ms = 50;
    config.scheduler.cancel_grace_ms = 500;
    config.scheduler.priority = Vec::new();

    config.task.max_attempts = 3;
    config.task.retry_delay_ms = 0;
    config.task.acquire_poll_ms = 5;
    config.task.task_timeout_ms = 5_000;
    config.task.pool_size = 2;
    config.task.concurrency = 2;

    config.protocol.enable_timeout_ms = 500;
    config.protocol.retry_delay_ms = 0;
    config.protocol.reconnect_delay_ms = 0;

    config.recovery.max_error_count = 100;
    config.recovery.probe_timeout_ms = 500;
    config.recovery.waits = RecoveryWaits::uniform(0);

    config.output.data_dir = path("data");
    config.output.checkpoint_dir = path("checkpoints");
    config.output.status_path = path("status/scheduler-status.json");
    config.output.cursor_path = path("auto-progress.json");
    config.output.report_dir = path("reports");
    config.output.database_path = path("marque.db");

    config.brands = brands
        .iter()
        .map(|name| BrandEntry::new(*name, vec![format!("{}-id", name.to_lowercase())]))
        .collect();
    config
}

/// Everything one scheduler run needs, wired the way `run` wires it
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub driver: MemoryDriver,
    pub scraper: Arc<FakeScraper>,
    pub output: Arc<JsonFileStore>,
    pub shutdown: ShutdownCoordinator,
}

impl Harness {
    pub fn new(config: Config, dir: TempDir, scraper: FakeScraper) -> Self {
        let output = Arc::new(JsonFileStore::new(&config.output.data_dir));
        Self {
            dir,
            config: Arc::new(config),
            driver: MemoryDriver::new(),
            scraper: Arc::new(scraper),
            output,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        let runner = JobRunner::new(
            self.config.clone(),
            Arc::new(self.driver.clone()),
            self.scraper.clone(),
            self.output.clone(),
            Arc::new(StaticIdentity::new("marque-test")),
            HookRegistry::with_builtins(),
            Arc::new(ErrorRecovery::new(self.config.recovery.clone())),
            self.shutdown.clone(),
        );
        Scheduler::new(
            self.config.clone(),
            Arc::new(ConfigCatalog::new(&self.config)),
            Arc::new(runner),
            self.shutdown.clone(),
        )
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

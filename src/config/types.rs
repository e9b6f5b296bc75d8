use serde::Deserialize;
use std::time::Duration;

use crate::driver::ResourceKind;
use crate::state::Capability;

/// Main configuration structure for Marque
///
/// Every section has defaults, so a config file only needs the sections it
/// changes. `[site]` is the exception: `run` refuses to start without it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub task: TaskConfig,
    pub protocol: ProtocolConfig,
    pub recovery: RecoveryConfig,
    pub browser: BrowserConfig,
    pub site: Option<SiteConfig>,
    pub output: OutputConfig,
    #[serde(rename = "brand")]
    pub brands: Vec<BrandEntry>,
}

/// Job admission and retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs holding a running slot at once
    #[serde(rename = "max-concurrent-jobs")]
    pub max_concurrent_jobs: usize,

    /// Maximum number of admissions per job before it is recorded failed
    #[serde(rename = "retry-attempts")]
    pub retry_attempts: u32,

    /// Delay before a failed job is re-queued (milliseconds)
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Double the retry delay for every further attempt
    #[serde(rename = "exponential-backoff")]
    pub exponential_backoff: bool,

    /// Upper bound for exponential retry delays (milliseconds)
    #[serde(rename = "max-retry-delay-ms")]
    pub max_retry_delay_ms: u64,

    /// Admission loop poll interval (milliseconds)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// How often the status snapshot is written (milliseconds)
    #[serde(rename = "status-interval-ms")]
    pub status_interval_ms: u64,

    /// Wall-clock budget for one job admission (milliseconds)
    #[serde(rename = "timeout-per-job-ms")]
    pub timeout_per_job_ms: u64,

    /// How long a cancelled job may take to unwind before it is aborted
    #[serde(rename = "cancel-grace-ms")]
    pub cancel_grace_ms: u64,

    /// Cap on jobs taken from the catalog per `auto` session
    #[serde(rename = "max-brands-per-session")]
    pub max_brands_per_session: usize,

    /// `run` without a selector means `auto`
    #[serde(rename = "auto-mode")]
    pub auto_mode: bool,

    /// Job ids admitted first, in this order
    pub priority: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            retry_attempts: 3,
            retry_delay_ms: 60_000,
            exponential_backoff: false,
            max_retry_delay_ms: 600_000,
            poll_interval_ms: 5_000,
            status_interval_ms: 30_000,
            timeout_per_job_ms: 30 * 60 * 1000,
            cancel_grace_ms: 10_000,
            max_brands_per_session: 20,
            auto_mode: false,
            priority: ["BYD", "Tesla", "BMW", "Audi", "Benz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Per-task execution defaults (overridable per brand)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Attempts per task before it is reported failed
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Delay between task attempts (milliseconds)
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    #[serde(rename = "exponential-backoff")]
    pub exponential_backoff: bool,

    /// Concurrent tasks within one job (never more than the pool size)
    pub concurrency: usize,

    /// Automation sessions launched per job
    #[serde(rename = "pool-size")]
    pub pool_size: usize,

    /// Poll interval while waiting for a free pooled session (milliseconds)
    #[serde(rename = "acquire-poll-ms")]
    pub acquire_poll_ms: u64,

    /// Budget for one scrape call (milliseconds)
    #[serde(rename = "task-timeout-ms")]
    pub task_timeout_ms: u64,

    /// Launch attempts per pooled session
    #[serde(rename = "launch-attempts")]
    pub launch_attempts: u32,

    /// A job with fewer completed tasks than this is a failed job
    #[serde(rename = "min-completed-tasks")]
    pub min_completed_tasks: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
            exponential_backoff: false,
            concurrency: 2,
            pool_size: 2,
            acquire_poll_ms: 100,
            task_timeout_ms: 120_000,
            launch_attempts: 2,
            min_completed_tasks: 1,
        }
    }
}

/// Control-channel activation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Budget for a single activation attempt (milliseconds)
    #[serde(rename = "enable-timeout-ms")]
    pub enable_timeout_ms: u64,

    /// Activation attempts per capability
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Pause before a reconnect re-runs activation (milliseconds)
    #[serde(rename = "reconnect-delay-ms")]
    pub reconnect_delay_ms: u64,

    /// Capabilities activated on every new context
    pub capabilities: Vec<Capability>,

    /// Capabilities without which a context is not operational
    pub critical: Vec<Capability>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enable_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 2_000,
            reconnect_delay_ms: 3_000,
            capabilities: Capability::all(),
            critical: vec![Capability::Network, Capability::Page],
        }
    }
}

/// Error recovery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Occurrences of one error kind per job before tasks are skipped
    #[serde(rename = "max-error-count")]
    pub max_error_count: u32,

    /// Budget for the health probe run after each recovery action
    #[serde(rename = "probe-timeout-ms")]
    pub probe_timeout_ms: u64,

    /// Initial wait per error kind
    pub waits: RecoveryWaits,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_error_count: 5,
            probe_timeout_ms: 5_000,
            waits: RecoveryWaits::default(),
        }
    }
}

/// The "wait" action duration for each error kind (milliseconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryWaits {
    pub timeout: u64,
    pub connection: u64,
    pub protocol: u64,
    pub crash: u64,
    #[serde(rename = "resource-load")]
    pub resource_load: u64,
    #[serde(rename = "out-of-memory")]
    pub out_of_memory: u64,
    pub unknown: u64,
}

impl Default for RecoveryWaits {
    fn default() -> Self {
        Self {
            timeout: 5_000,
            connection: 5_000,
            protocol: 3_000,
            crash: 10_000,
            resource_load: 2_000,
            out_of_memory: 15_000,
            unknown: 2_000,
        }
    }
}

impl RecoveryWaits {
    /// Sets every wait to the same value
    pub fn uniform(ms: u64) -> Self {
        Self {
            timeout: ms,
            connection: ms,
            protocol: ms,
            crash: ms,
            resource_load: ms,
            out_of_memory: ms,
            unknown: ms,
        }
    }
}

/// Browser launch and context normalization settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,

    /// Explicit browser binary; auto-detected when absent
    pub executable: Option<String>,

    /// Extra command-line switches passed at launch
    pub args: Vec<String>,

    /// Default navigation timeout applied to new contexts (milliseconds)
    #[serde(rename = "default-timeout-ms")]
    pub default_timeout_ms: u64,

    #[serde(rename = "viewport-width")]
    pub viewport_width: u32,

    #[serde(rename = "viewport-height")]
    pub viewport_height: u32,

    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Request kinds every context refuses to load
    #[serde(rename = "block-resources")]
    pub block_resources: Vec<ResourceKind>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
            ],
            default_timeout_ms: 30_000,
            viewport_width: 1280,
            viewport_height: 800,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            block_resources: vec![ResourceKind::Media],
        }
    }
}

/// Target site description used by the script-driven scraper
///
/// URLs are templates: `{source_id}` and `{task_id}` are substituted before
/// navigation. The scripts are evaluated in the page and must return JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Brand listing page, e.g. `https://site/brand/{source_id}`
    #[serde(rename = "discovery-url")]
    pub discovery_url: String,

    /// Script returning `[{"id": ..., "name": ...}, ...]`
    #[serde(rename = "discovery-script")]
    pub discovery_script: String,

    /// Model page, e.g. `https://site/series/{task_id}`
    #[serde(rename = "task-url")]
    pub task_url: String,

    /// Script returning the model payload
    #[serde(rename = "extract-script")]
    pub extract_script: String,

    /// JSON pointer to the configuration list inside the payload
    #[serde(rename = "items-pointer", default = "default_items_pointer")]
    pub items_pointer: String,

    /// Per-configuration fields holding image lists
    #[serde(rename = "image-fields", default = "default_image_fields")]
    pub image_fields: Vec<String>,

    /// Pause after navigation before running a script (milliseconds)
    #[serde(rename = "settle-ms", default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_items_pointer() -> String {
    "/configs".to_string()
}

fn default_image_fields() -> Vec<String> {
    vec!["exteriorImages".to_string(), "interiorImages".to_string()]
}

fn default_settle_ms() -> u64 {
    1_000
}

/// Output locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// One JSON document per job
    #[serde(rename = "data-dir")]
    pub data_dir: String,

    #[serde(rename = "checkpoint-dir")]
    pub checkpoint_dir: String,

    /// Scheduler status snapshot
    #[serde(rename = "status-path")]
    pub status_path: String,

    /// Auto-mode resume cursor
    #[serde(rename = "cursor-path")]
    pub cursor_path: String,

    /// Final run reports
    #[serde(rename = "report-dir")]
    pub report_dir: String,

    /// SQLite run archive
    #[serde(rename = "database-path")]
    pub database_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            checkpoint_dir: "./checkpoints".to_string(),
            status_path: "./status/scheduler-status.json".to_string(),
            cursor_path: "./auto-progress.json".to_string(),
            report_dir: "./logs/scheduler".to_string(),
            database_path: "./marque.db".to_string(),
        }
    }
}

/// One catalog entry plus its per-job overrides
#[derive(Debug, Clone, Deserialize)]
pub struct BrandEntry {
    /// Brand name (the job id)
    pub name: String,

    /// Upstream identifiers for the brand
    #[serde(rename = "source-ids")]
    pub source_ids: Vec<String>,

    /// Alternative spellings stripped from model names by `strip-brand-prefix`
    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(rename = "timeout-ms", default)]
    pub timeout_ms: Option<u64>,

    #[serde(rename = "task-timeout-ms", default)]
    pub task_timeout_ms: Option<u64>,

    #[serde(rename = "task-concurrency", default)]
    pub task_concurrency: Option<usize>,

    #[serde(rename = "pool-size", default)]
    pub pool_size: Option<usize>,

    #[serde(rename = "max-task-attempts", default)]
    pub max_task_attempts: Option<u32>,

    #[serde(rename = "min-completed-tasks", default)]
    pub min_completed_tasks: Option<usize>,

    /// Named hooks applied to this job
    #[serde(default)]
    pub hooks: Vec<String>,
}

impl BrandEntry {
    pub fn new(name: impl Into<String>, source_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            source_ids,
            aliases: Vec::new(),
            timeout_ms: None,
            task_timeout_ms: None,
            task_concurrency: None,
            pool_size: None,
            max_task_attempts: None,
            min_completed_tasks: None,
            hooks: Vec::new(),
        }
    }
}

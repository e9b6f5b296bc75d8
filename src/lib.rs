//! Marque: a resumable vehicle catalog crawler
//!
//! This crate orchestrates per-brand crawl jobs over a pool of browser
//! automation sessions, checkpointing every task so an interrupted run can
//! resume without repeating finished work.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod driver;
pub mod output;
pub mod pool;
pub mod protocol;
pub mod recovery;
pub mod retry;
pub mod scrape;
pub mod shutdown;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Marque operations
#[derive(Debug, Error)]
pub enum MarqueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Automation driver error: {0}")]
    Driver(#[from] driver::DriverError),

    #[error("Resource pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Scrape error: {0}")]
    Scrape(#[from] scrape::ScrapeError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job {job} was interrupted")]
    Interrupted { job: String },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid environment override {name}: {message}")]
    Env { name: String, message: String },
}

/// Result type alias for Marque operations
pub type Result<T> = std::result::Result<T, MarqueError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Scheduler, ScheduleOptions, Selector};
pub use output::Report;
pub use state::{BrandJob, CarTask, JobStatus, TaskStatus};

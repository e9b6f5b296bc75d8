//! Scraping collaborator
//!
//! The engine never looks inside a page. It hands a prepared execution
//! context to a `Scraper`, which discovers a job's tasks and extracts one
//! task's data. `ScriptScraper` is the bundled implementation: it navigates
//! to URL templates and evaluates scripts, all taken from `[site]`.

mod script;

pub use script::ScriptScraper;

use crate::driver::{Context, DriverError};
use crate::state::{BrandJob, CarTask, ResultSummary};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a scraper
///
/// Messages reach the error classifier, so driver errors keep their
/// original text.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Result rejected: {0}")]
    Rejected(String),

    #[error("Page did not finish loading: readyState is {0}")]
    NotReady(String),
}

/// Result type for scraper operations
pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// A task found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSeed {
    pub id: String,
    pub display_name: String,
}

impl TaskSeed {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Everything discovery found for a job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub seeds: Vec<TaskSeed>,

    /// Brand-level metadata stored with the job's output
    pub auxiliary: Value,
}

/// Data extracted for one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub data: Value,
    pub summary: ResultSummary,
}

/// What a scraper gets to work with
pub struct TaskEnv<'a> {
    pub job_id: &'a str,

    /// Pool slot the context belongs to
    pub resource_id: usize,
    pub context: &'a dyn Context,
}

/// Discovers and scrapes tasks on a prepared context
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Lists the tasks of a job
    async fn discover(&self, job: &BrandJob, env: &TaskEnv<'_>) -> ScrapeResult<Discovery>;

    /// Extracts the data of one task
    async fn scrape(&self, task: &CarTask, env: &TaskEnv<'_>) -> ScrapeResult<TaskResult>;
}

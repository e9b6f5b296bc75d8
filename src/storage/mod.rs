//! Storage module for persisting run state
//!
//! This module handles everything the crawler keeps on disk apart from
//! scraped data:
//! - Atomic JSON file writes for checkpoints, status, cursor and reports
//! - The SQLite run archive (runs, job outcomes, failed tasks)

mod atomic;
mod schema;
mod sqlite;
mod traits;

pub use atomic::{read_json, remove_if_exists, write_json_atomic};
pub use sqlite::SqliteArchive;
pub use traits::{RunArchive, StorageError, StorageResult};

use crate::state::JobStatus;
use std::path::Path;

/// Initializes or opens the run archive
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteArchive)` - Successfully opened archive
/// * `Err(StorageError)` - Failed to open or initialize the database
pub fn open_archive(path: &Path) -> StorageResult<SqliteArchive> {
    SqliteArchive::new(path)
}

/// Represents a scheduler run in the archive
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub selector: String,
    pub status: RunStatus,
    pub totals: RunTotals,
}

/// Job counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

/// Outcome of one job within a run
#[derive(Debug, Clone, PartialEq)]
pub struct JobResultRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub duration_secs: Option<f64>,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub error_message: Option<String>,
}

/// A task that ended failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailureRecord {
    pub job_id: String,
    pub task_id: String,
    pub attempts: u32,
    pub error_message: Option<String>,
}

/// Status of a scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

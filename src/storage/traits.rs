//! Storage traits and error types
//!
//! This module defines the trait interface for the run archive and the
//! error type shared by every storage helper.

use crate::storage::{JobResultRecord, RunRecord, RunStatus, RunTotals, TaskFailureRecord};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Failed to persist {path}: {message}")]
    Persist { path: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for run archive backends
///
/// The archive keeps one row per scheduler run, one row per job outcome and
/// one row per task that ended failed. It is append-only apart from closing
/// a run.
pub trait RunArchive {
    // ===== Run Management =====

    /// Opens a new run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    /// * `selector` - What was asked for (job ids or "auto")
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str, selector: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Gets up to `limit` runs, newest first
    fn recent_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>>;

    /// Updates the status of a run
    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// Closes a run with its final status, totals and finish timestamp
    fn finish_run(&mut self, run_id: i64, status: RunStatus, totals: &RunTotals)
        -> StorageResult<()>;

    // ===== Job Results =====

    /// Records the outcome of one job
    fn record_job(&mut self, run_id: i64, job: &JobResultRecord) -> StorageResult<()>;

    /// Gets every job outcome of a run, in insertion order
    fn job_results(&self, run_id: i64) -> StorageResult<Vec<JobResultRecord>>;

    // ===== Task Failures =====

    /// Records one task that ended failed
    fn record_task_failure(&mut self, run_id: i64, failure: &TaskFailureRecord)
        -> StorageResult<()>;

    /// Gets the failed tasks of a run
    fn task_failures(&self, run_id: i64) -> StorageResult<Vec<TaskFailureRecord>>;

    // ===== Statistics =====

    /// Counts failed tasks per job over every run, most failures first
    fn failure_hotspots(&self, limit: usize) -> StorageResult<Vec<(String, u64)>>;
}

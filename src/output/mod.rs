//! Output module for scraped data and run reports
//!
//! This module handles:
//! - Storing completed task payloads in per-job JSON documents
//! - Building, saving and archiving the final run report
//! - Printing reports and run history

mod report;
pub mod stats;
mod store;

pub use report::{JobReport, Report, TaskReport};
pub use stats::{load_history, print_history, print_report, RunHistory};
pub use store::{JobDocument, JsonFileStore, OutputStore, Progress, TaskPayload};

use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Write(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

//! Checkpointing and resume
//!
//! Every task status change of a job is persisted to
//! `<checkpoint-dir>/<job>-checkpoint.json` through an atomic write. A run
//! that dies leaves the last snapshot behind; the next run adopts it and
//! executes only what is left.

mod manager;
mod types;

pub use manager::{CheckpointManager, StatusExtra};
pub use types::{Checkpoint, Completeness, IntegrityReport, ResumePlan, TaskCounts};

use crate::output::OutputError;
use crate::state::TaskStatus;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised by the checkpoint manager
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} is not tracked")]
    UnknownTask(String),

    #[error("Task {task_id} has used all {attempts} attempts")]
    AttemptCapReached { task_id: String, attempts: u32 },

    #[error("Task {0} completed without a payload")]
    MissingPayload(String),

    #[error("No tracking started for job {0}")]
    NotTracking(String),

    #[error("Failed to store output: {0}")]
    Output(#[from] OutputError),

    #[error("Failed to write checkpoint: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

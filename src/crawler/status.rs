//! Scheduler status snapshot
//!
//! The scheduler keeps a small ledger of where every job is. It is written
//! to the status file periodically and once at the end, so an operator can
//! see what a long run is doing.

use crate::storage::{write_json_atomic, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub running_jobs: Vec<String>,
    pub queued_jobs: Vec<String>,
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<String>,

    /// Most jobs ever running at once during this run
    pub peak_running: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Where each job of the current run is
#[derive(Debug, Default)]
pub struct SchedulerState {
    queued: Vec<String>,
    running: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    peak_running: usize,
}

fn remove(list: &mut Vec<String>, job_id: &str) {
    list.retain(|id| id != job_id);
}

impl SchedulerState {
    pub fn enqueue(&mut self, job_id: &str) {
        remove(&mut self.running, job_id);
        if !self.queued.iter().any(|id| id == job_id) {
            self.queued.push(job_id.to_string());
        }
    }

    pub fn start(&mut self, job_id: &str) {
        remove(&mut self.queued, job_id);
        self.running.push(job_id.to_string());
        self.peak_running = self.peak_running.max(self.running.len());
    }

    pub fn complete(&mut self, job_id: &str) {
        remove(&mut self.running, job_id);
        remove(&mut self.queued, job_id);
        self.completed.push(job_id.to_string());
    }

    pub fn fail(&mut self, job_id: &str) {
        remove(&mut self.running, job_id);
        remove(&mut self.queued, job_id);
        self.failed.push(job_id.to_string());
    }

    /// Drops a job from the ledger without recording an outcome
    pub fn forget(&mut self, job_id: &str) {
        remove(&mut self.running, job_id);
        remove(&mut self.queued, job_id);
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.running.len(),
            queued: self.queued.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            running_jobs: self.running.clone(),
            queued_jobs: self.queued.clone(),
            completed_jobs: self.completed.clone(),
            failed_jobs: self.failed.clone(),
            peak_running: self.peak_running,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Writes a snapshot to the status file
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> StorageResult<()> {
    write_json_atomic(path, snapshot)?;
    tracing::debug!(
        "Status: {} running, {} queued, {} completed, {} failed",
        snapshot.running,
        snapshot.queued,
        snapshot.completed,
        snapshot.failed
    );
    Ok(())
}

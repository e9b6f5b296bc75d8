//! Output store trait and the JSON document store
//!
//! Each job has one output document, `<data-dir>/<job>.json`. Completed task
//! payloads are merged into it as they arrive, so the document is usable
//! (tagged partial) even if the run dies halfway.

use crate::output::{OutputError, OutputResult};
use crate::state::ResultSummary;
use crate::storage::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Scraped data of one completed task, as stored and checkpointed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: String,
    pub display_name: String,
    pub data: Value,
    pub summary: ResultSummary,
    pub completed_at: DateTime<Utc>,
}

/// Completion progress of an output document
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 10000.0).round() / 100.0
        };
        Self {
            completed,
            total,
            percentage,
        }
    }
}

/// The per-job output document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    pub job_id: String,
    pub auxiliary_metadata: Value,
    pub tasks: Vec<TaskPayload>,
    pub progress: Progress,
    pub is_partial: bool,
    pub last_updated: DateTime<Utc>,
}

/// Destination for scraped task payloads
///
/// Writes must be durable once they return: the checkpoint records a task
/// completed only after `put_task` succeeded.
pub trait OutputStore: Send + Sync {
    /// Stores one completed task payload, replacing any earlier payload for
    /// the same task, and tags the job document partial
    ///
    /// # Arguments
    ///
    /// * `job_id` - Job the task belongs to
    /// * `auxiliary` - Job-level metadata recorded alongside the tasks
    /// * `payload` - The completed task
    /// * `total_tasks` - Number of tasks the job tracks, for progress
    fn put_task(
        &self,
        job_id: &str,
        auxiliary: &Value,
        payload: &TaskPayload,
        total_tasks: usize,
    ) -> OutputResult<()>;

    /// Loads a stored payload, if any
    fn load_task(&self, job_id: &str, task_id: &str) -> OutputResult<Option<TaskPayload>>;

    /// Marks the job document final (or still partial) and returns its progress
    fn finalize(&self, job_id: &str, complete: bool) -> OutputResult<Progress>;
}

/// Output store writing one JSON document per job
pub struct JsonFileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of a job's output document
    pub fn document_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", job_id))
    }

    /// Reads a job's output document
    pub fn load_document(&self, job_id: &str) -> OutputResult<Option<JobDocument>> {
        Ok(read_json(&self.document_path(job_id))?)
    }

    fn write_document(&self, path: &Path, document: &JobDocument) -> OutputResult<()> {
        write_json_atomic(path, document)?;
        Ok(())
    }

    fn guard(&self) -> OutputResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| OutputError::Write("output store lock poisoned".to_string()))
    }
}

impl OutputStore for JsonFileStore {
    fn put_task(
        &self,
        job_id: &str,
        auxiliary: &Value,
        payload: &TaskPayload,
        total_tasks: usize,
    ) -> OutputResult<()> {
        let _guard = self.guard()?;
        let path = self.document_path(job_id);

        let mut document = self.load_document(job_id)?.unwrap_or_else(|| JobDocument {
            job_id: job_id.to_string(),
            auxiliary_metadata: Value::Null,
            tasks: Vec::new(),
            progress: Progress::default(),
            is_partial: true,
            last_updated: Utc::now(),
        });

        if !auxiliary.is_null() {
            document.auxiliary_metadata = auxiliary.clone();
        }
        match document
            .tasks
            .iter_mut()
            .find(|t| t.task_id == payload.task_id)
        {
            Some(existing) => *existing = payload.clone(),
            None => document.tasks.push(payload.clone()),
        }

        let total = total_tasks.max(document.tasks.len());
        document.progress = Progress::new(document.tasks.len(), total);
        document.is_partial = true;
        document.last_updated = Utc::now();

        self.write_document(&path, &document)?;
        tracing::debug!(
            "Stored task {} for {} ({}/{})",
            payload.task_id,
            job_id,
            document.progress.completed,
            document.progress.total
        );
        Ok(())
    }

    fn load_task(&self, job_id: &str, task_id: &str) -> OutputResult<Option<TaskPayload>> {
        Ok(self
            .load_document(job_id)?
            .and_then(|doc| doc.tasks.into_iter().find(|t| t.task_id == task_id)))
    }

    fn finalize(&self, job_id: &str, complete: bool) -> OutputResult<Progress> {
        let _guard = self.guard()?;
        let path = self.document_path(job_id);

        let Some(mut document) = self.load_document(job_id)? else {
            return Ok(Progress::default());
        };
        document.is_partial = !complete;
        document.last_updated = Utc::now();
        self.write_document(&path, &document)?;

        tracing::info!(
            "Output for {} finalized: {} tasks ({}%){}",
            job_id,
            document.progress.completed,
            document.progress.percentage,
            if complete { "" } else { ", partial" }
        );
        Ok(document.progress)
    }
}

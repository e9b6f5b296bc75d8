//! Final scheduler report
//!
//! The report lists every job of a run with its task outcomes and the run
//! aggregates. It is written as JSON to the report directory and archived
//! into the SQLite run archive.

use crate::catalog::Cursor;
use crate::output::OutputResult;
use crate::state::{BrandJob, CarTask, JobStatus, TaskStatus};
use crate::storage::{
    write_json_atomic, JobResultRecord, RunArchive, RunStatus, RunTotals, TaskFailureRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10000.0).round() / 100.0
}

/// Outcome of one task as reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: String,
    pub display_name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub item_count: u32,
    pub image_count: u32,
    pub error: Option<String>,
}

impl From<&CarTask> for TaskReport {
    fn from(task: &CarTask) -> Self {
        let summary = task.result_summary.unwrap_or_default();
        Self {
            task_id: task.id.clone(),
            display_name: task.display_name.clone(),
            status: task.status,
            attempts: task.attempts,
            item_count: summary.item_count,
            image_count: summary.image_count,
            error: task.error_message.clone(),
        }
    }
}

/// Outcome of one job as reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub duration_secs: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,

    /// Tasks left pending or in progress (interrupted runs)
    pub unfinished_tasks: usize,

    /// Completed tasks as a percentage of all tasks
    pub task_success_rate: f64,
    pub tasks: Vec<TaskReport>,
    pub error: Option<String>,
}

impl JobReport {
    /// Builds a job report from the job record and its final task entries
    pub fn new(job: &BrandJob, tasks: &[CarTask], error: Option<String>) -> Self {
        let tasks: Vec<TaskReport> = tasks.iter().map(TaskReport::from).collect();
        let completed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let total_tasks = tasks.len();

        Self {
            job_id: job.id.clone(),
            status: job.status,
            attempts: job.attempts,
            duration_secs: job.duration_secs(),
            total_tasks,
            completed_tasks,
            failed_tasks,
            unfinished_tasks: total_tasks - completed_tasks - failed_tasks,
            task_success_rate: rate(completed_tasks, total_tasks),
            tasks,
            error,
        }
    }

    /// Report entry for a job that was never attempted
    pub fn not_attempted(job_id: &str, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            attempts: 0,
            duration_secs: 0.0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            unfinished_tasks: 0,
            task_success_rate: 0.0,
            tasks: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Report of one scheduler run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub generated_at: DateTime<Utc>,

    /// What was asked for: comma-separated job ids or "auto"
    pub selector: String,

    /// True if the run was cut short by a shutdown signal
    pub interrupted: bool,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub success_rate: f64,
    pub jobs: Vec<JobReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Report {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            generated_at: Utc::now(),
            selector: selector.into(),
            interrupted: false,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            success_rate: 0.0,
            jobs: Vec::new(),
            cursor: None,
        }
    }

    /// Adds one job and refreshes the aggregates
    pub fn push_job(&mut self, job: JobReport) {
        self.jobs.push(job);
        self.total_jobs = self.jobs.len();
        self.completed_jobs = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        self.failed_jobs = self.total_jobs - self.completed_jobs;
        self.success_rate = rate(self.completed_jobs, self.total_jobs);
    }

    pub fn job(&self, job_id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    /// True when every job in the report terminally succeeded
    pub fn all_succeeded(&self) -> bool {
        !self.interrupted && self.failed_jobs == 0
    }

    /// Run status to archive for this report
    pub fn run_status(&self) -> RunStatus {
        if self.interrupted {
            RunStatus::Interrupted
        } else if self.failed_jobs > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    /// Writes the report as `report-<timestamp>.json` into `dir`
    ///
    /// # Returns
    ///
    /// The path of the written file
    pub fn save(&self, dir: &Path) -> OutputResult<PathBuf> {
        let name = format!(
            "report-{}.json",
            self.generated_at.format("%Y%m%d-%H%M%S-%3f")
        );
        let path = dir.join(name);
        write_json_atomic(&path, self)?;
        tracing::info!("Report written to {}", path.display());
        Ok(path)
    }

    /// Records every job and failed task into the archive and closes the run
    pub fn archive(&self, archive: &mut dyn RunArchive, run_id: i64) -> OutputResult<()> {
        for job in &self.jobs {
            archive.record_job(
                run_id,
                &JobResultRecord {
                    job_id: job.job_id.clone(),
                    status: job.status,
                    attempts: job.attempts,
                    duration_secs: Some(job.duration_secs),
                    total_tasks: job.total_tasks as u64,
                    completed_tasks: job.completed_tasks as u64,
                    failed_tasks: job.failed_tasks as u64,
                    error_message: job.error.clone(),
                },
            )?;

            for task in job.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
                archive.record_task_failure(
                    run_id,
                    &TaskFailureRecord {
                        job_id: job.job_id.clone(),
                        task_id: task.task_id.clone(),
                        attempts: task.attempts,
                        error_message: task.error.clone(),
                    },
                )?;
            }
        }

        let totals = RunTotals {
            total_jobs: self.total_jobs as u64,
            completed_jobs: self.completed_jobs as u64,
            failed_jobs: self.failed_jobs as u64,
        };
        archive.finish_run(run_id, self.run_status(), &totals)?;
        Ok(())
    }
}

use crate::output::TaskPayload;
use crate::state::{CarTask, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of tracked tasks in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    /// Counts the statuses of `tasks`
    pub fn tally(tasks: &[CarTask]) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    fn slot(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        }
    }

    /// Moves one task from `from` to `to`
    pub fn shift(&mut self, from: TaskStatus, to: TaskStatus) {
        let source = self.slot(from);
        *source = source.saturating_sub(1);
        *self.slot(to) += 1;
    }
}

/// Durable snapshot of one job's task tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,

    /// Brand metadata found at discovery
    #[serde(default)]
    pub auxiliary: Value,

    /// One entry per task id, in discovery order
    pub tasks: Vec<CarTask>,
    pub counts: TaskCounts,

    /// Payloads of completed tasks, the fallback if the output store lost one
    #[serde(default)]
    pub partial_results: Vec<TaskPayload>,

    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn task(&self, task_id: &str) -> Option<&CarTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Ids of the tasks currently in `status`
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn partial_result(&self, task_id: &str) -> Option<&TaskPayload> {
        self.partial_results.iter().find(|p| p.task_id == task_id)
    }
}

/// Result of comparing expected task ids against completed ones
#[derive(Debug, Clone, PartialEq)]
pub struct Completeness {
    pub expected: usize,
    pub completed: usize,
    pub missing: Vec<String>,
    pub percentage: f64,
    pub is_complete: bool,
}

/// Work left for a resumed job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePlan {
    /// Tasks to execute, in checkpoint order
    pub pending: Vec<CarTask>,

    /// Payloads of tasks already completed
    pub completed: Vec<TaskPayload>,

    /// Tasks that stay failed because their attempts are used up
    pub exhausted: Vec<String>,

    /// Completed tasks whose payload was lost and that run again
    pub requeued: Vec<String>,
}

/// Consistency check of the current snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub job_id: String,

    /// Counters as stored
    pub counts: TaskCounts,

    /// Counters recomputed from the entries
    pub recounted: TaskCounts,
    pub entries: usize,

    /// Completed entries without a partial result
    pub missing_results: Vec<String>,
    pub consistent: bool,
}

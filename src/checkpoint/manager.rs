use crate::checkpoint::{
    Checkpoint, CheckpointError, CheckpointResult, Completeness, IntegrityReport, ResumePlan,
    TaskCounts,
};
use crate::output::{OutputStore, TaskPayload};
use crate::scrape::TaskSeed;
use crate::state::{CarTask, TaskStatus};
use crate::storage::{read_json, remove_if_exists, write_json_atomic};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Extra data carried by a status update
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    /// Required when moving to `Completed`
    pub payload: Option<TaskPayload>,

    /// Recorded when moving to `Failed`
    pub error: Option<String>,
}

impl StatusExtra {
    pub fn completed(payload: TaskPayload) -> Self {
        Self {
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Tracks the tasks of one job and persists every change
///
/// The manager is the single writer of the job's checkpoint file. Status
/// updates take one mutex for both the output write and the checkpoint
/// write, so a task is never recorded completed before its payload is
/// stored.
pub struct CheckpointManager {
    job_id: String,
    path: PathBuf,
    max_attempts: u32,
    output: Arc<dyn OutputStore>,
    state: Mutex<Option<Checkpoint>>,
}

impl CheckpointManager {
    /// Creates a manager for `job_id` writing into `dir`
    ///
    /// # Arguments
    ///
    /// * `dir` - Checkpoint directory
    /// * `job_id` - The job whose tasks are tracked
    /// * `max_attempts` - Attempt cap for the failed → pending edge
    /// * `output` - Store that receives completed payloads
    pub fn new(
        dir: &Path,
        job_id: impl Into<String>,
        max_attempts: u32,
        output: Arc<dyn OutputStore>,
    ) -> Self {
        let job_id = job_id.into();
        Self {
            path: dir.join(format!("{}-checkpoint.json", job_id)),
            job_id,
            max_attempts: max_attempts.max(1),
            output,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    // A poisoned lock still holds the latest tracking state, which is worth
    // more than failing every later update.
    fn lock(&self) -> MutexGuard<'_, Option<Checkpoint>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, checkpoint: &mut Checkpoint) -> CheckpointResult<()> {
        checkpoint.saved_at = Utc::now();
        write_json_atomic(&self.path, checkpoint)?;
        Ok(())
    }

    /// Starts tracking a freshly discovered task set
    ///
    /// Every seed becomes a pending entry; duplicate ids are dropped. The
    /// snapshot is persisted before returning.
    pub fn create_tracking(
        &self,
        seeds: &[TaskSeed],
        auxiliary: Value,
    ) -> CheckpointResult<Checkpoint> {
        let mut seen = HashSet::new();
        let tasks: Vec<CarTask> = seeds
            .iter()
            .filter(|seed| seen.insert(seed.id.clone()))
            .map(|seed| CarTask::new(seed.id.clone(), seed.display_name.clone()))
            .collect();

        let now = Utc::now();
        let mut checkpoint = Checkpoint {
            job_id: self.job_id.clone(),
            auxiliary,
            counts: TaskCounts::tally(&tasks),
            tasks,
            partial_results: Vec::new(),
            created_at: now,
            saved_at: now,
        };

        let mut guard = self.lock();
        self.persist(&mut checkpoint)?;
        *guard = Some(checkpoint.clone());

        tracing::info!(
            job = %self.job_id,
            "Tracking {} tasks in {}",
            checkpoint.tasks.len(),
            self.path.display()
        );
        Ok(checkpoint)
    }

    /// Moves one task to `status` and persists the change
    ///
    /// # Returns
    ///
    /// * `Ok(CarTask)` - The updated entry
    /// * `Err(CheckpointError)` - Unknown task, illegal transition, attempt
    ///   cap reached, missing payload, or a failed write
    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        extra: StatusExtra,
    ) -> CheckpointResult<CarTask> {
        let mut guard = self.lock();
        let checkpoint = guard
            .as_mut()
            .ok_or_else(|| CheckpointError::NotTracking(self.job_id.clone()))?;

        let index = checkpoint
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| CheckpointError::UnknownTask(task_id.to_string()))?;

        let current = checkpoint.tasks[index].status;
        if !current.can_transition_to(status) {
            return Err(CheckpointError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: status,
            });
        }
        let attempts = checkpoint.tasks[index].attempts;
        if current == TaskStatus::Failed && attempts >= self.max_attempts {
            return Err(CheckpointError::AttemptCapReached {
                task_id: task_id.to_string(),
                attempts,
            });
        }

        // Work on a copy so a failed write leaves memory matching disk
        let mut next = checkpoint.clone();
        let now = Utc::now();
        match status {
            TaskStatus::InProgress => {
                let entry = &mut next.tasks[index];
                entry.attempts += 1;
                entry.started_at = Some(now);
                entry.ended_at = None;
            }
            TaskStatus::Completed => {
                let payload = extra
                    .payload
                    .ok_or_else(|| CheckpointError::MissingPayload(task_id.to_string()))?;

                // Output first: the checkpoint must never claim a payload
                // that is not stored.
                self.output
                    .put_task(&self.job_id, &next.auxiliary, &payload, next.tasks.len())?;

                let entry = &mut next.tasks[index];
                entry.ended_at = Some(now);
                entry.result_summary = Some(payload.summary);
                entry.error_message = None;

                next.partial_results.retain(|p| p.task_id != task_id);
                next.partial_results.push(payload);
            }
            TaskStatus::Failed => {
                let entry = &mut next.tasks[index];
                entry.ended_at = Some(now);
                entry.error_message = extra.error;
            }
            TaskStatus::Pending => {}
        }

        next.tasks[index].status = status;
        next.counts.shift(current, status);
        self.persist(&mut next)?;
        *checkpoint = next;

        tracing::debug!(
            job = %self.job_id,
            task = %task_id,
            "{} -> {} (attempt {})",
            current,
            status,
            checkpoint.tasks[index].attempts
        );
        Ok(checkpoint.tasks[index].clone())
    }

    /// Reads the last persisted snapshot
    ///
    /// A missing file is `None`. An unreadable, corrupt or foreign file is
    /// logged and also treated as `None`, so the job starts over.
    pub fn load(&self) -> Option<Checkpoint> {
        match read_json::<Checkpoint>(&self.path) {
            Ok(Some(checkpoint)) if checkpoint.job_id == self.job_id => Some(checkpoint),
            Ok(Some(checkpoint)) => {
                tracing::warn!(
                    job = %self.job_id,
                    "Ignoring checkpoint {} recorded for job {}",
                    self.path.display(),
                    checkpoint.job_id
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    job = %self.job_id,
                    "Ignoring unreadable checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Current in-memory snapshot
    pub fn snapshot(&self) -> Option<Checkpoint> {
        self.lock().clone()
    }

    pub fn counts(&self) -> TaskCounts {
        self.lock()
            .as_ref()
            .map(|c| c.counts)
            .unwrap_or_default()
    }

    /// Deletes the checkpoint file and forgets the snapshot
    pub fn clear(&self) -> CheckpointResult<()> {
        let mut guard = self.lock();
        if remove_if_exists(&self.path)? {
            tracing::info!(job = %self.job_id, "Checkpoint cleared");
        }
        *guard = None;
        Ok(())
    }

    /// Compares expected task ids with completed ones
    pub fn validate_completeness(expected: &[String], completed: &[String]) -> Completeness {
        let done: HashSet<&String> = completed.iter().collect();
        let expected_set: HashSet<&String> = expected.iter().collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|id| !done.contains(id))
            .cloned()
            .collect();
        let completed_count = expected_set.iter().filter(|id| done.contains(*id)).count();

        let percentage = if expected_set.is_empty() {
            100.0
        } else {
            (completed_count as f64 / expected_set.len() as f64 * 10000.0).round() / 100.0
        };

        Completeness {
            expected: expected_set.len(),
            completed: completed_count,
            is_complete: missing.is_empty(),
            missing,
            percentage,
        }
    }

    /// Completeness of the current snapshot
    pub fn completeness(&self) -> Completeness {
        match self.lock().as_ref() {
            Some(checkpoint) => Self::validate_completeness(
                &checkpoint.task_ids(),
                &checkpoint.ids_with_status(TaskStatus::Completed),
            ),
            None => Self::validate_completeness(&[], &[]),
        }
    }

    /// Adopts a loaded snapshot and works out what is left to do
    ///
    /// In-progress entries go back to pending. Failed entries go back to
    /// pending while their attempts are under the cap; `fresh_session`
    /// resets their attempts first. Completed entries keep their payload,
    /// taken from the output store or the snapshot's partial results; a
    /// completed entry with neither runs again.
    pub fn prepare_resume(
        &self,
        mut checkpoint: Checkpoint,
        fresh_session: bool,
    ) -> CheckpointResult<ResumePlan> {
        let mut plan = ResumePlan::default();
        let mut kept_results = Vec::new();
        let previous_results = std::mem::take(&mut checkpoint.partial_results);

        for task in checkpoint.tasks.iter_mut() {
            match task.status {
                TaskStatus::Completed => {
                    let stored = match self.output.load_task(&self.job_id, &task.id) {
                        Ok(stored) => stored,
                        Err(e) => {
                            tracing::warn!(
                                job = %self.job_id,
                                task = %task.id,
                                "Could not read stored payload: {}",
                                e
                            );
                            None
                        }
                    };
                    let payload = stored.or_else(|| {
                        previous_results
                            .iter()
                            .find(|p| p.task_id == task.id)
                            .cloned()
                    });

                    match payload {
                        Some(payload) => {
                            kept_results.push(payload.clone());
                            plan.completed.push(payload);
                        }
                        None => {
                            tracing::warn!(
                                job = %self.job_id,
                                task = %task.id,
                                "Integrity: task marked completed but no payload found, re-queuing"
                            );
                            task.status = TaskStatus::Pending;
                            task.result_summary = None;
                            plan.requeued.push(task.id.clone());
                        }
                    }
                }
                TaskStatus::InProgress => {
                    task.status = TaskStatus::Pending;
                }
                TaskStatus::Failed => {
                    if fresh_session {
                        task.attempts = 0;
                    }
                    if task.attempts < self.max_attempts {
                        task.status = TaskStatus::Pending;
                    } else {
                        plan.exhausted.push(task.id.clone());
                    }
                }
                TaskStatus::Pending => {}
            }

            if task.status == TaskStatus::Pending {
                plan.pending.push(task.clone());
            }
        }

        checkpoint.partial_results = kept_results;
        checkpoint.counts = TaskCounts::tally(&checkpoint.tasks);

        let mut guard = self.lock();
        self.persist(&mut checkpoint)?;
        *guard = Some(checkpoint);

        tracing::info!(
            job = %self.job_id,
            "Resuming: {} completed, {} to run, {} exhausted",
            plan.completed.len(),
            plan.pending.len(),
            plan.exhausted.len()
        );
        Ok(plan)
    }

    /// Checks the stored counters and partial results against the entries
    pub fn integrity_report(&self) -> Option<IntegrityReport> {
        let guard = self.lock();
        let checkpoint = guard.as_ref()?;

        let recounted = TaskCounts::tally(&checkpoint.tasks);
        let missing_results: Vec<String> = checkpoint
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| checkpoint.partial_result(&t.id).is_none())
            .map(|t| t.id.clone())
            .collect();

        Some(IntegrityReport {
            job_id: checkpoint.job_id.clone(),
            counts: checkpoint.counts,
            recounted,
            entries: checkpoint.tasks.len(),
            consistent: checkpoint.counts == recounted && missing_results.is_empty(),
            missing_results,
        })
    }

    /// Re-persists the current snapshot
    ///
    /// # Returns
    ///
    /// True if there was a snapshot to write
    pub fn flush(&self) -> CheckpointResult<bool> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(checkpoint) => {
                self.persist(checkpoint)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::JsonFileStore;
    use crate::state::ResultSummary;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<JsonFileStore>,
        manager: CheckpointManager,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("data")));
        let manager = CheckpointManager::new(
            &dir.path().join("checkpoints"),
            "Acme",
            max_attempts,
            store.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            manager,
        }
    }

    fn seeds() -> Vec<TaskSeed> {
        (101..=105)
            .map(|n| TaskSeed::new(n.to_string(), format!("Model {}", n)))
            .collect()
    }

    fn payload(task_id: &str) -> TaskPayload {
        TaskPayload {
            task_id: task_id.to_string(),
            display_name: format!("Model {}", task_id),
            data: json!({"configs": [{}]}),
            summary: ResultSummary {
                item_count: 1,
                image_count: 0,
            },
            completed_at: Utc::now(),
        }
    }

    fn complete(manager: &CheckpointManager, task_id: &str) {
        manager
            .update_status(task_id, TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        manager
            .update_status(task_id, TaskStatus::Completed, StatusExtra::completed(payload(task_id)))
            .unwrap();
    }

    fn fail(manager: &CheckpointManager, task_id: &str) {
        manager
            .update_status(task_id, TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        manager
            .update_status(task_id, TaskStatus::Failed, StatusExtra::failed("ECONNREFUSED"))
            .unwrap();
    }

    #[test]
    fn test_failed_write_leaves_state_unchanged() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), json!({})).unwrap();

        // A plain file where the checkpoint directory should be
        let checkpoint_dir = f.manager.path().parent().unwrap().to_path_buf();
        std::fs::remove_dir_all(&checkpoint_dir).unwrap();
        std::fs::write(&checkpoint_dir, b"in the way").unwrap();

        let result = f
            .manager
            .update_status("101", TaskStatus::InProgress, StatusExtra::default());
        assert!(result.is_err());

        std::fs::remove_file(&checkpoint_dir).unwrap();
        let task = f
            .manager
            .update_status("101", TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        assert_eq!(task.attempts, 1);

        let loaded = f.manager.load().unwrap();
        assert_eq!(loaded.counts.in_progress, 1);
        assert_eq!(loaded.counts.pending, 4);
    }

    #[test]
    fn test_create_tracking_persists_pending_entries() {
        let f = fixture(3);
        let mut seeds = seeds();
        seeds.push(TaskSeed::new("101", "duplicate"));

        let checkpoint = f.manager.create_tracking(&seeds, json!({"brand": "Acme"})).unwrap();

        assert_eq!(checkpoint.tasks.len(), 5);
        assert_eq!(checkpoint.counts.pending, 5);
        let loaded = f.manager.load().unwrap();
        assert_eq!(loaded.task_ids(), checkpoint.task_ids());
        assert_eq!(loaded.auxiliary["brand"], "Acme");
    }

    #[test]
    fn test_completed_payload_reaches_output_first() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();

        complete(&f.manager, "101");

        assert!(f.store.load_task("Acme", "101").unwrap().is_some());
        let loaded = f.manager.load().unwrap();
        assert_eq!(loaded.task("101").unwrap().status, TaskStatus::Completed);
        assert_eq!(loaded.counts.completed, 1);
        assert_eq!(loaded.counts.pending, 4);
        assert_eq!(loaded.partial_results.len(), 1);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();

        let skip = f
            .manager
            .update_status("101", TaskStatus::Completed, StatusExtra::completed(payload("101")));
        assert!(matches!(skip, Err(CheckpointError::InvalidTransition { .. })));

        let unknown = f
            .manager
            .update_status("999", TaskStatus::InProgress, StatusExtra::default());
        assert!(matches!(unknown, Err(CheckpointError::UnknownTask(_))));

        f.manager
            .update_status("101", TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        let no_payload = f
            .manager
            .update_status("101", TaskStatus::Completed, StatusExtra::default());
        assert!(matches!(no_payload, Err(CheckpointError::MissingPayload(_))));
    }

    #[test]
    fn test_retry_edge_respects_attempt_cap() {
        let f = fixture(2);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();

        fail(&f.manager, "103");
        f.manager
            .update_status("103", TaskStatus::Pending, StatusExtra::default())
            .unwrap();
        fail(&f.manager, "103");

        let result = f
            .manager
            .update_status("103", TaskStatus::Pending, StatusExtra::default());
        assert!(matches!(
            result,
            Err(CheckpointError::AttemptCapReached { attempts: 2, .. })
        ));
        let entry = f.manager.snapshot().unwrap().task("103").unwrap().clone();
        assert_eq!(entry.error_message.as_deref(), Some("ECONNREFUSED"));
    }

    #[test]
    fn test_update_without_tracking_fails() {
        let f = fixture(3);
        let result = f
            .manager
            .update_status("101", TaskStatus::InProgress, StatusExtra::default());
        assert!(matches!(result, Err(CheckpointError::NotTracking(_))));
    }

    #[test]
    fn test_load_ignores_corrupt_file() {
        let f = fixture(3);
        std::fs::create_dir_all(f.manager.path().parent().unwrap()).unwrap();
        std::fs::write(f.manager.path(), "{\"jobId\": \"Acme\", \"tasks\": [").unwrap();

        assert!(f.manager.load().is_none());
    }

    #[test]
    fn test_clear_removes_file() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();

        f.manager.clear().unwrap();

        assert!(!f.manager.path().exists());
        assert!(f.manager.load().is_none());
        assert!(f.manager.snapshot().is_none());
    }

    #[test]
    fn test_validate_completeness() {
        let expected: Vec<String> = ["101", "102", "103"].iter().map(|s| s.to_string()).collect();
        let completed: Vec<String> = ["101", "103"].iter().map(|s| s.to_string()).collect();

        let result = CheckpointManager::validate_completeness(&expected, &completed);

        assert_eq!(result.missing, vec!["102".to_string()]);
        assert_eq!(result.completed, 2);
        assert_eq!(result.percentage, 66.67);
        assert!(!result.is_complete);

        let all = CheckpointManager::validate_completeness(&expected, &expected);
        assert!(all.is_complete);
        assert_eq!(all.percentage, 100.0);
    }

    #[test]
    fn test_prepare_resume_plans_remaining_work() {
        let f = fixture(2);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();
        complete(&f.manager, "101");
        complete(&f.manager, "102");
        f.manager
            .update_status("103", TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        fail(&f.manager, "104");
        let checkpoint = f.manager.load().unwrap();

        let resumed = CheckpointManager::new(
            f.manager.path().parent().unwrap(),
            "Acme",
            2,
            f.store.clone(),
        );
        let plan = resumed.prepare_resume(checkpoint, false).unwrap();

        let pending: Vec<&str> = plan.pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(pending, vec!["103", "104", "105"]);
        assert_eq!(plan.completed.len(), 2);
        assert!(plan.exhausted.is_empty());
        let counts = resumed.counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.in_progress, 0);
    }

    #[test]
    fn test_prepare_resume_keeps_exhausted_failures() {
        let f = fixture(1);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();
        fail(&f.manager, "103");
        let checkpoint = f.manager.load().unwrap();

        let plan = f.manager.prepare_resume(checkpoint.clone(), false).unwrap();
        assert_eq!(plan.exhausted, vec!["103".to_string()]);
        assert_eq!(plan.pending.len(), 4);

        // A new process session gets a fresh attempt budget
        let plan = f.manager.prepare_resume(checkpoint, true).unwrap();
        assert!(plan.exhausted.is_empty());
        assert_eq!(plan.pending.len(), 5);
        assert_eq!(f.manager.snapshot().unwrap().task("103").unwrap().attempts, 0);
    }

    #[test]
    fn test_prepare_resume_falls_back_to_partial_results() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();
        complete(&f.manager, "101");
        let mut checkpoint = f.manager.load().unwrap();
        std::fs::remove_file(f.store.document_path("Acme")).unwrap();

        let plan = f.manager.prepare_resume(checkpoint.clone(), false).unwrap();
        assert_eq!(plan.completed.len(), 1);
        assert!(plan.requeued.is_empty());

        // Neither the store nor the snapshot has it: run it again
        checkpoint.partial_results.clear();
        let plan = f.manager.prepare_resume(checkpoint, false).unwrap();
        assert_eq!(plan.requeued, vec!["101".to_string()]);
        assert_eq!(plan.pending.len(), 5);
    }

    #[test]
    fn test_integrity_report_and_flush() {
        let f = fixture(3);
        assert!(f.manager.integrity_report().is_none());
        assert!(!f.manager.flush().unwrap());

        f.manager.create_tracking(&seeds(), Value::Null).unwrap();
        complete(&f.manager, "101");

        let report = f.manager.integrity_report().unwrap();
        assert!(report.consistent);
        assert_eq!(report.entries, 5);
        assert_eq!(report.counts.completed, 1);
        assert!(f.manager.flush().unwrap());
    }

    #[test]
    fn test_completeness_of_snapshot() {
        let f = fixture(3);
        f.manager.create_tracking(&seeds(), Value::Null).unwrap();
        for id in ["101", "102", "103", "104", "105"] {
            complete(&f.manager, id);
        }
        assert!(f.manager.completeness().is_complete);
    }
}

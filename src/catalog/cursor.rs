use crate::state::BrandJob;
use crate::storage::{read_json, write_json_atomic, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Last known outcome of a job in auto mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

/// Auto-mode position in the catalog, persisted between sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Catalog index the next session starts from
    pub last_index: usize,

    /// Catalog size when the cursor was written
    pub total_jobs: usize,

    #[serde(default)]
    pub outcomes: BTreeMap<String, JobOutcome>,

    #[serde(default)]
    pub completed_jobs: Vec<String>,

    #[serde(default)]
    pub failed_jobs: Vec<String>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Hash of the config file the cursor was written under
    #[serde(default)]
    pub config_hash: Option<String>,
}

/// Jobs picked for one auto-mode session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoBatch {
    /// In catalog order, starting at the cursor
    pub jobs: Vec<BrandJob>,
    pub start_index: usize,

    /// Where the following session starts
    pub next_index: usize,

    /// Catalog jobs not yet completed, including the ones picked
    pub remaining: usize,
}

impl AutoBatch {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Cursor {
    /// Loads the cursor, starting fresh if it is missing or unreadable
    pub fn load(path: &Path) -> Self {
        match read_json::<Cursor>(path) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cursor {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Stamps `updated_at` and writes the cursor atomically
    pub fn save(&mut self, path: &Path) -> StorageResult<()> {
        self.updated_at = Some(Utc::now());
        write_json_atomic(path, self)?;
        tracing::info!(
            "Auto progress saved: {}/{} ({} completed, {} failed)",
            self.last_index,
            self.total_jobs,
            self.completed_jobs.len(),
            self.failed_jobs.len()
        );
        Ok(())
    }

    /// Logs when the config changed since the cursor was written
    ///
    /// # Returns
    ///
    /// True if a previous hash exists and differs from `hash`
    pub fn config_changed(&self, hash: &str) -> bool {
        match &self.config_hash {
            Some(previous) if previous != hash => {
                tracing::info!(
                    "Configuration changed since the last auto session ({} -> {})",
                    &previous[..previous.len().min(12)],
                    &hash[..hash.len().min(12)]
                );
                true
            }
            _ => false,
        }
    }

    pub fn is_completed(&self, job_id: &str) -> bool {
        self.outcomes.get(job_id) == Some(&JobOutcome::Completed)
    }

    /// Picks up to `max_jobs` jobs, walking the catalog from `last_index`
    ///
    /// The walk wraps around once and skips jobs recorded completed.
    pub fn next_batch(&self, catalog: &[BrandJob], max_jobs: usize) -> AutoBatch {
        let total = catalog.len();
        if total == 0 {
            return AutoBatch::default();
        }

        let start_index = if self.last_index < total {
            self.last_index
        } else {
            0
        };
        let max_jobs = max_jobs.max(1);
        let mut batch = AutoBatch {
            start_index,
            next_index: start_index,
            ..AutoBatch::default()
        };

        for offset in 0..total {
            let index = (start_index + offset) % total;
            let job = &catalog[index];
            if self.is_completed(&job.id) {
                continue;
            }
            batch.remaining += 1;
            if batch.jobs.len() < max_jobs {
                batch.jobs.push(job.clone());
                batch.next_index = (index + 1) % total;
            }
        }
        batch
    }

    /// Records the outcome of one job and refreshes the job lists
    pub fn record(&mut self, job_id: &str, outcome: JobOutcome) {
        self.outcomes.insert(job_id.to_string(), outcome);
        self.completed_jobs = self.ids_with(JobOutcome::Completed);
        self.failed_jobs = self.ids_with(JobOutcome::Failed);
    }

    /// Moves the cursor past a finished batch
    pub fn advance(&mut self, batch: &AutoBatch, total_jobs: usize, config_hash: Option<&str>) {
        self.last_index = batch.next_index;
        self.total_jobs = total_jobs;
        if let Some(hash) = config_hash {
            self.config_hash = Some(hash.to_string());
        }
    }

    fn ids_with(&self, outcome: JobOutcome) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == outcome)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog(ids: &[&str]) -> Vec<BrandJob> {
        ids.iter().map(|id| BrandJob::new(*id, vec![])).collect()
    }

    fn ids(batch: &AutoBatch) -> Vec<&str> {
        batch.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    #[test]
    fn test_fresh_cursor_starts_at_zero() {
        let cursor = Cursor::default();
        let batch = cursor.next_batch(&catalog(&["A", "B", "C"]), 2);

        assert_eq!(ids(&batch), vec!["A", "B"]);
        assert_eq!(batch.next_index, 2);
        assert_eq!(batch.remaining, 3);
    }

    #[test]
    fn test_wraps_around_and_skips_completed() {
        let mut cursor = Cursor {
            last_index: 2,
            ..Cursor::default()
        };
        cursor.record("A", JobOutcome::Completed);
        cursor.record("B", JobOutcome::Failed);

        let batch = cursor.next_batch(&catalog(&["A", "B", "C", "D"]), 5);
        assert_eq!(ids(&batch), vec!["C", "D", "B"]);
        assert_eq!(batch.next_index, 2);
        assert_eq!(batch.remaining, 3);
    }

    #[test]
    fn test_same_cursor_picks_same_batch() {
        let mut cursor = Cursor {
            last_index: 1,
            ..Cursor::default()
        };
        cursor.record("A", JobOutcome::Failed);
        let jobs = catalog(&["A", "B", "C"]);

        let first = cursor.next_batch(&jobs, 2);
        assert_eq!(first, cursor.next_batch(&jobs, 2));
        assert_eq!(first.jobs, vec![jobs[1].clone(), jobs[2].clone()]);
        assert_ne!(first, AutoBatch::default());
    }

    #[test]
    fn test_everything_completed_is_empty() {
        let mut cursor = Cursor::default();
        cursor.record("A", JobOutcome::Completed);
        cursor.record("B", JobOutcome::Completed);

        let batch = cursor.next_batch(&catalog(&["A", "B"]), 10);
        assert!(batch.is_empty());
        assert_eq!(batch.remaining, 0);
    }

    #[test]
    fn test_index_past_shrunken_catalog_restarts() {
        let cursor = Cursor {
            last_index: 9,
            ..Cursor::default()
        };
        let batch = cursor.next_batch(&catalog(&["A", "B"]), 1);
        assert_eq!(ids(&batch), vec!["A"]);
        assert_eq!(batch.start_index, 0);
    }

    #[test]
    fn test_record_overwrites_outcome() {
        let mut cursor = Cursor::default();
        cursor.record("A", JobOutcome::Failed);
        cursor.record("A", JobOutcome::Completed);

        assert_eq!(cursor.completed_jobs, vec!["A".to_string()]);
        assert!(cursor.failed_jobs.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auto-progress.json");

        let mut cursor = Cursor::default();
        let batch = cursor.next_batch(&catalog(&["A", "B", "C"]), 2);
        cursor.record("A", JobOutcome::Completed);
        cursor.advance(&batch, 3, Some("abc"));
        cursor.save(&path).unwrap();

        let loaded = Cursor::load(&path);
        assert_eq!(loaded.last_index, 2);
        assert_eq!(loaded.total_jobs, 3);
        assert_eq!(loaded.config_hash.as_deref(), Some("abc"));
        assert!(loaded.updated_at.is_some());
        assert!(loaded.config_changed("def"));
        assert!(!loaded.config_changed("abc"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["lastIndex"], 2);
        assert_eq!(raw["outcomes"]["A"], "completed");
    }

    #[test]
    fn test_corrupt_cursor_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auto-progress.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(Cursor::load(&path), Cursor::default());
    }
}

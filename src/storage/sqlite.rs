//! SQLite run archive
//!
//! This module provides a SQLite-based implementation of the RunArchive trait.

use crate::state::JobStatus;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{RunArchive, StorageError, StorageResult};
use crate::storage::{JobResultRecord, RunRecord, RunStatus, RunTotals, TaskFailureRecord};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, selector, status, \
                           total_jobs, completed_jobs, failed_jobs";

/// SQLite archive backend
pub struct SqliteArchive {
    conn: Connection,
}

impl SqliteArchive {
    /// Opens (or creates) the archive at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteArchive)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory archive
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
        Ok(RunRecord {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            config_hash: row.get(3)?,
            selector: row.get(4)?,
            status: RunStatus::from_db_string(&row.get::<_, String>(5)?)
                .unwrap_or(RunStatus::Running),
            totals: RunTotals {
                total_jobs: row.get::<_, i64>(6)? as u64,
                completed_jobs: row.get::<_, i64>(7)? as u64,
                failed_jobs: row.get::<_, i64>(8)? as u64,
            },
        })
    }
}

impl RunArchive for SqliteArchive {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str, selector: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, selector, status) VALUES (?1, ?2, ?3, ?4)",
            params![now, config_hash, selector, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![run_id], Self::run_from_row)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS);
        let run = self
            .conn
            .query_row(&sql, [], Self::run_from_row)
            .optional()?;
        Ok(run)
    }

    fn recent_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT ?1", RUN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![limit as i64], Self::run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        totals: &RunTotals,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, total_jobs = ?3,
             completed_jobs = ?4, failed_jobs = ?5 WHERE id = ?6",
            params![
                status.to_db_string(),
                now,
                totals.total_jobs as i64,
                totals.completed_jobs as i64,
                totals.failed_jobs as i64,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Job Results =====

    fn record_job(&mut self, run_id: i64, job: &JobResultRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO job_results (run_id, job_id, status, attempts, duration_secs,
             total_tasks, completed_tasks, failed_tasks, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id,
                job.job_id,
                job.status.to_db_string(),
                job.attempts,
                job.duration_secs,
                job.total_tasks as i64,
                job.completed_tasks as i64,
                job.failed_tasks as i64,
                job.error_message
            ],
        )?;
        Ok(())
    }

    fn job_results(&self, run_id: i64) -> StorageResult<Vec<JobResultRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, status, attempts, duration_secs, total_tasks, completed_tasks,
             failed_tasks, error_message FROM job_results WHERE run_id = ?1 ORDER BY id",
        )?;

        let jobs = stmt
            .query_map(params![run_id], |row| {
                Ok(JobResultRecord {
                    job_id: row.get(0)?,
                    status: JobStatus::from_db_string(&row.get::<_, String>(1)?)
                        .unwrap_or(JobStatus::Failed),
                    attempts: row.get(2)?,
                    duration_secs: row.get(3)?,
                    total_tasks: row.get::<_, i64>(4)? as u64,
                    completed_tasks: row.get::<_, i64>(5)? as u64,
                    failed_tasks: row.get::<_, i64>(6)? as u64,
                    error_message: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    // ===== Task Failures =====

    fn record_task_failure(
        &mut self,
        run_id: i64,
        failure: &TaskFailureRecord,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO task_failures (run_id, job_id, task_id, attempts, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                failure.job_id,
                failure.task_id,
                failure.attempts,
                failure.error_message
            ],
        )?;
        Ok(())
    }

    fn task_failures(&self, run_id: i64) -> StorageResult<Vec<TaskFailureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, task_id, attempts, error_message FROM task_failures
             WHERE run_id = ?1 ORDER BY id",
        )?;

        let failures = stmt
            .query_map(params![run_id], |row| {
                Ok(TaskFailureRecord {
                    job_id: row.get(0)?,
                    task_id: row.get(1)?,
                    attempts: row.get(2)?,
                    error_message: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(failures)
    }

    // ===== Statistics =====

    fn failure_hotspots(&self, limit: usize) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, COUNT(*) as count FROM task_failures
             GROUP BY job_id ORDER BY count DESC, job_id LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, status: JobStatus) -> JobResultRecord {
        JobResultRecord {
            job_id: id.to_string(),
            status,
            attempts: 1,
            duration_secs: Some(12.5),
            total_tasks: 5,
            completed_tasks: 4,
            failed_tasks: 1,
            error_message: None,
        }
    }

    fn failure(job_id: &str, task_id: &str) -> TaskFailureRecord {
        TaskFailureRecord {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            attempts: 3,
            error_message: Some("connection refused".to_string()),
        }
    }

    #[test]
    fn test_create_run() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let run_id = archive.create_run("abc123", "Acme").unwrap();

        let run = archive.get_run(run_id).unwrap();
        assert_eq!(run.config_hash, "abc123");
        assert_eq!(run.selector, "Acme");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_missing_run() {
        let archive = SqliteArchive::new_in_memory().unwrap();
        assert!(matches!(archive.get_run(42), Err(StorageError::RunNotFound(42))));
        assert!(archive.get_latest_run().unwrap().is_none());
    }

    #[test]
    fn test_finish_run_records_totals() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let run_id = archive.create_run("abc123", "auto").unwrap();
        let totals = RunTotals {
            total_jobs: 3,
            completed_jobs: 2,
            failed_jobs: 1,
        };

        archive.finish_run(run_id, RunStatus::Failed, &totals).unwrap();

        let run = archive.get_latest_run().unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.totals, totals);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_recent_runs_newest_first() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let first = archive.create_run("h", "BYD").unwrap();
        let second = archive.create_run("h", "Tesla").unwrap();
        let third = archive.create_run("h", "BMW").unwrap();

        let runs = archive.recent_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, third);
        assert_eq!(runs[1].id, second);
        assert!(runs.iter().all(|r| r.id != first));
    }

    #[test]
    fn test_job_results_roundtrip() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let run_id = archive.create_run("h", "Acme,Zeta").unwrap();

        archive.record_job(run_id, &job("Acme", JobStatus::Completed)).unwrap();
        archive.record_job(run_id, &job("Zeta", JobStatus::Failed)).unwrap();

        let jobs = archive.job_results(run_id).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0], job("Acme", JobStatus::Completed));
        assert_eq!(jobs[1].status, JobStatus::Failed);
    }

    #[test]
    fn test_task_failures_and_hotspots() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let run_id = archive.create_run("h", "auto").unwrap();

        archive.record_task_failure(run_id, &failure("Acme", "103")).unwrap();
        archive.record_task_failure(run_id, &failure("Acme", "104")).unwrap();
        archive.record_task_failure(run_id, &failure("Zeta", "9")).unwrap();

        let failures = archive.task_failures(run_id).unwrap();
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0], failure("Acme", "103"));

        let hotspots = archive.failure_hotspots(10).unwrap();
        assert_eq!(hotspots[0], ("Acme".to_string(), 2));
        assert_eq!(hotspots[1], ("Zeta".to_string(), 1));
    }

    #[test]
    fn test_update_unknown_run_fails() {
        let mut archive = SqliteArchive::new_in_memory().unwrap();
        let result = archive.update_run_status(7, RunStatus::Interrupted);
        assert!(matches!(result, Err(StorageError::RunNotFound(7))));
    }
}

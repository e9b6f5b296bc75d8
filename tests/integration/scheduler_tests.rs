//! End-to-end scheduler runs on the in-process driver

use crate::support::{ids, test_config, Behavior, FakeScraper, Harness};
use marque_crawler::checkpoint::CheckpointManager;
use marque_crawler::crawler::{ScheduleOptions, Selector};
use marque_crawler::output::OutputStore;
use marque_crawler::state::{JobStatus, TaskStatus};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const ACME_MODELS: &[&str] = &["101", "102", "103", "104", "105"];
const TWO_MODELS: &[&str] = &["1", "2"];
const ONE_MODEL: &[&str] = &["1"];

fn acme_harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &["Acme"]);
    Harness::new(config, dir, FakeScraper::new(&[("Acme", ACME_MODELS)]))
}

#[tokio::test]
async fn test_all_tasks_complete_without_failures() {
    let harness = acme_harness();

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = report.job("Acme").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_tasks, 5);
    assert_eq!(job.failed_tasks, 0);
    assert_eq!(job.task_success_rate, 100.0);
    assert!(report.all_succeeded());

    // Exactly one scrape per task when nothing fails
    assert_eq!(harness.scraper.total_calls(), 5);

    // A fully complete job leaves no checkpoint behind
    let checkpoint_dir = Path::new(&harness.config.output.checkpoint_dir);
    assert!(!checkpoint_dir.join("Acme-checkpoint.json").exists());
}

#[tokio::test]
async fn test_failing_task_is_retried_then_reported() {
    let harness = acme_harness();
    harness.scraper.set_behavior(
        "103",
        Behavior::Fail("connect ECONNREFUSED 127.0.0.1:9222".to_string()),
    );

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = report.job("Acme").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_tasks, 4);
    assert_eq!(job.failed_tasks, 1);
    assert_eq!(job.task_success_rate, 80.0);

    let failed = job.task("103").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.error.as_deref().unwrap().contains("ECONNREFUSED"));
    assert_eq!(harness.scraper.calls("103"), 3);

    // Every discovered task appears exactly once
    let reported: Vec<&str> = job.tasks.iter().map(|t| t.task_id.as_str()).collect();
    let unique: HashSet<&str> = reported.iter().copied().collect();
    assert_eq!(reported.len(), ACME_MODELS.len());
    assert_eq!(unique, ACME_MODELS.iter().copied().collect());
}

#[tokio::test]
async fn test_completed_payloads_survive_in_output_and_checkpoint() {
    let harness = acme_harness();
    harness
        .scraper
        .set_behavior("105", Behavior::Fail("Page crashed!".to_string()));

    harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let document = harness.output.load_document("Acme").unwrap().unwrap();
    assert!(document.is_partial);
    assert_eq!(document.tasks.len(), 4);
    assert_eq!(document.auxiliary_metadata["brand"], "Acme");

    let checkpoint = CheckpointManager::new(
        Path::new(&harness.config.output.checkpoint_dir),
        "Acme",
        3,
        harness.output.clone(),
    )
    .load()
    .unwrap();
    assert_eq!(checkpoint.counts.completed, 4);
    assert_eq!(checkpoint.counts.failed, 1);
    for task_id in checkpoint.ids_with_status(TaskStatus::Completed) {
        assert!(checkpoint.partial_result(&task_id).is_some());
        assert!(harness.output.load_task("Acme", &task_id).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_concurrent_jobs_never_exceed_limit() {
    let dir = TempDir::new().unwrap();
    let brands = ["Acme", "Birch", "Cobalt", "Delta", "Ember"];
    let mut config = test_config(dir.path(), &brands);
    config.scheduler.max_concurrent_jobs = 2;
    let models: Vec<(&str, &[&str])> = brands.iter().map(|b| (*b, TWO_MODELS)).collect();
    let scraper = FakeScraper::new(&models).with_work(Duration::from_millis(40));
    let harness = Harness::new(config, dir, scraper);

    let scheduler = harness.scheduler();
    let report = scheduler
        .schedule(Selector::Jobs(ids(&brands)), ScheduleOptions::default())
        .await
        .unwrap();

    assert_eq!(report.completed_jobs, 5);
    let snapshot = scheduler.snapshot();
    assert!(snapshot.peak_running >= 1);
    assert!(snapshot.peak_running <= 2);
    assert_eq!(snapshot.completed, 5);
    assert_eq!(snapshot.running, 0);
}

#[tokio::test]
async fn test_command_line_concurrency_overrides_config() {
    let dir = TempDir::new().unwrap();
    let brands = ["Acme", "Birch", "Cobalt"];
    let mut config = test_config(dir.path(), &brands);
    config.scheduler.max_concurrent_jobs = 3;
    let models: Vec<(&str, &[&str])> = brands.iter().map(|b| (*b, ONE_MODEL)).collect();
    let harness = Harness::new(config, dir, FakeScraper::new(&models));

    let scheduler = harness.scheduler();
    let options = ScheduleOptions {
        max_concurrent_jobs: Some(1),
        ..ScheduleOptions::default()
    };
    let report = scheduler
        .schedule(Selector::Jobs(ids(&brands)), options)
        .await
        .unwrap();

    assert_eq!(report.completed_jobs, 3);
    assert_eq!(scheduler.snapshot().peak_running, 1);
}

#[tokio::test]
async fn test_no_pooled_session_is_shared_between_tasks() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Acme"]);
    config.task.pool_size = 3;
    config.task.concurrency = 3;
    let models = ["1", "2", "3", "4", "5", "6", "7", "8", "9"];
    let scraper = FakeScraper::new(&[("Acme", &models[..])]).with_work(Duration::from_millis(20));
    let harness = Harness::new(config, dir, scraper);

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    assert_eq!(report.job("Acme").unwrap().completed_tasks, 9);
    assert_eq!(harness.scraper.shared_handles(), 0);
    // Three sessions for the pool; none were replaced
    assert_eq!(harness.driver.launches(), 3);
}

#[tokio::test]
async fn test_unknown_job_is_reported_not_attempted() {
    let harness = acme_harness();

    let report = harness
        .scheduler()
        .schedule(
            Selector::Jobs(ids(&["Acme", "Nonexistent", "Acme"])),
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.total_jobs, 2);
    let unknown = report.job("Nonexistent").unwrap();
    assert_eq!(unknown.status, JobStatus::Failed);
    assert_eq!(unknown.attempts, 0);
    assert_eq!(unknown.error.as_deref(), Some("unknown job"));
    assert_eq!(report.job("Acme").unwrap().status, JobStatus::Completed);
    assert_eq!(harness.scraper.discoveries("Acme"), 1);
    assert!(!report.all_succeeded());
}

#[tokio::test]
async fn test_job_with_no_tasks_fails_after_retries() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Empty"]);
    config.scheduler.retry_attempts = 2;
    let harness = Harness::new(config, dir, FakeScraper::new(&[]));

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Empty"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = report.job("Empty").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.as_deref(), Some("discovery found no tasks"));
    assert_eq!(harness.scraper.discoveries("Empty"), 2);
}

#[tokio::test]
async fn test_job_timeout_marks_in_flight_tasks_failed() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Slow"]);
    config.brands[0].timeout_ms = Some(200);
    let harness = Harness::new(config, dir, FakeScraper::new(&[("Slow", TWO_MODELS)]));
    harness.scraper.set_behavior("1", Behavior::Hang);
    harness.scraper.set_behavior("2", Behavior::Hang);

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Slow"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = report.job("Slow").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("job timed out"));
    for task in &job.tasks {
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("job timed out"));
    }
    assert!(!report.interrupted);
}

#[tokio::test]
async fn test_status_file_written_at_end() {
    let harness = acme_harness();

    harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let raw = std::fs::read_to_string(&harness.config.output.status_path).unwrap();
    let status: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(status["completedJobs"][0], "Acme");
    assert_eq!(status["running"], 0);
    assert_eq!(status["queued"], 0);
}

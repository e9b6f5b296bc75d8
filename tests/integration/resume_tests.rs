//! Resuming from checkpoints, graceful shutdown and auto-mode batches

use crate::support::{ids, test_config, Behavior, FakeScraper, Harness};
use chrono::Utc;
use marque_crawler::catalog::Cursor;
use marque_crawler::checkpoint::{CheckpointManager, StatusExtra};
use marque_crawler::crawler::{ScheduleOptions, Selector};
use marque_crawler::output::TaskPayload;
use marque_crawler::scrape::TaskSeed;
use marque_crawler::shutdown::ShutdownCoordinator;
use marque_crawler::state::{JobStatus, ResultSummary, TaskStatus};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ACME_MODELS: &[&str] = &["101", "102", "103", "104", "105"];
const ACME_ONLY: &[&str] = &["a1"];
const BIRCH_ONLY: &[&str] = &["b1"];
const COBALT_ONLY: &[&str] = &["c1"];

/// Writes an Acme checkpoint with the given tasks already completed
fn seed_checkpoint(harness: &Harness, completed: &[&str]) {
    let manager = CheckpointManager::new(
        Path::new(&harness.config.output.checkpoint_dir),
        "Acme",
        harness.config.task.max_attempts,
        harness.output.clone(),
    );
    let seeds: Vec<TaskSeed> = ACME_MODELS
        .iter()
        .map(|id| TaskSeed::new(*id, format!("Acme Model {}", id)))
        .collect();
    manager
        .create_tracking(&seeds, serde_json::json!({ "brand": "Acme" }))
        .unwrap();

    for id in completed {
        manager
            .update_status(id, TaskStatus::InProgress, StatusExtra::default())
            .unwrap();
        let payload = TaskPayload {
            task_id: id.to_string(),
            display_name: format!("Acme Model {}", id),
            data: serde_json::json!({ "model": id }),
            summary: ResultSummary {
                item_count: 1,
                image_count: 0,
            },
            completed_at: Utc::now(),
        };
        manager
            .update_status(id, TaskStatus::Completed, StatusExtra::completed(payload))
            .unwrap();
    }
}

fn acme_harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &["Acme"]);
    Harness::new(config, dir, FakeScraper::new(&[("Acme", ACME_MODELS)]))
}

#[tokio::test]
async fn test_resume_runs_only_unfinished_tasks() {
    let harness = acme_harness();
    seed_checkpoint(&harness, &["101", "102"]);

    let report = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let expected: HashSet<String> = ids(&["103", "104", "105"]).into_iter().collect();
    assert_eq!(harness.scraper.scraped_ids(), expected);
    assert_eq!(harness.scraper.discoveries("Acme"), 0);

    let job = report.job("Acme").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_tasks, 5);

    let document = harness.output.load_document("Acme").unwrap().unwrap();
    assert_eq!(document.tasks.len(), 5);
    assert!(!document.is_partial);
}

#[tokio::test]
async fn test_no_resume_rediscovers() {
    let harness = acme_harness();
    seed_checkpoint(&harness, &["101", "102"]);

    let options = ScheduleOptions {
        resume: false,
        ..ScheduleOptions::default()
    };
    harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), options)
        .await
        .unwrap();

    assert_eq!(harness.scraper.discoveries("Acme"), 1);
    assert_eq!(harness.scraper.total_calls(), 5);
}

#[tokio::test]
async fn test_exhausted_failures_get_fresh_attempts_in_new_session() {
    let harness = acme_harness();
    harness.scraper.set_behavior(
        "104",
        Behavior::Fail("net::ERR_CONNECTION_RESET".to_string()),
    );

    let first = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();
    assert_eq!(first.job("Acme").unwrap().failed_tasks, 1);
    assert_eq!(harness.scraper.calls("104"), 3);

    harness.scraper.clear_behaviors();
    let second = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = second.job("Acme").unwrap();
    assert_eq!(job.completed_tasks, 5);
    assert_eq!(job.task("104").unwrap().attempts, 1);
    assert_eq!(harness.scraper.calls("104"), 4);
    assert_eq!(harness.scraper.calls("101"), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_and_next_run_resumes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Acme"]);
    config.task.pool_size = 5;
    config.task.concurrency = 5;
    let mut harness = Harness::new(config, dir, FakeScraper::new(&[("Acme", ACME_MODELS)]));
    harness.scraper.set_behavior("104", Behavior::Hang);
    harness.scraper.set_behavior("105", Behavior::Hang);

    let scheduler = Arc::new(harness.scheduler());
    let run = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
                .await
        })
    };

    // Let the non-hanging tasks finish before pulling the plug
    tokio::time::timeout(Duration::from_secs(5), async {
        while ACME_MODELS.iter().any(|id| harness.scraper.calls(id) == 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.shutdown.shutdown().await;

    let report = run.await.unwrap().unwrap();
    assert!(report.interrupted);
    assert!(!report.all_succeeded());
    let job = report.job("Acme").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("interrupted by shutdown"));

    let saved = CheckpointManager::new(
        Path::new(&harness.config.output.checkpoint_dir),
        "Acme",
        3,
        harness.output.clone(),
    )
    .load()
    .unwrap();
    assert_eq!(saved.task("104").unwrap().status, TaskStatus::InProgress);
    assert_eq!(saved.counts.completed, 3);

    // A new process picks up the two interrupted tasks only
    harness.scraper.clear_behaviors();
    harness.shutdown = ShutdownCoordinator::new();
    let resumed = harness
        .scheduler()
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    assert_eq!(resumed.job("Acme").unwrap().completed_tasks, 5);
    assert_eq!(harness.scraper.calls("101"), 1);
    assert_eq!(harness.scraper.calls("104"), 2);
    assert_eq!(harness.scraper.discoveries("Acme"), 1);
}

#[tokio::test]
async fn test_auto_mode_walks_catalog_in_batches() {
    let dir = TempDir::new().unwrap();
    let brands = ["Acme", "Birch", "Cobalt"];
    let config = test_config(dir.path(), &brands);
    let models: Vec<(&str, &[&str])> = brands.iter().map(|b| (*b, &ACME_MODELS[..2])).collect();
    let harness = Harness::new(config, dir, FakeScraper::new(&models));
    let options = ScheduleOptions {
        batch_size: Some(2),
        ..ScheduleOptions::default()
    };

    let first = harness
        .scheduler()
        .with_config_hash("hash-1")
        .schedule(Selector::Auto, options.clone())
        .await
        .unwrap();
    let first_ids: Vec<&str> = first.jobs.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(first_ids, vec!["Acme", "Birch"]);

    let cursor = Cursor::load(Path::new(&harness.config.output.cursor_path));
    assert_eq!(cursor.last_index, 2);
    assert_eq!(cursor.total_jobs, 3);
    assert!(cursor.is_completed("Acme"));
    assert_eq!(cursor.config_hash.as_deref(), Some("hash-1"));

    let second = harness
        .scheduler()
        .with_config_hash("hash-1")
        .schedule(Selector::Auto, options.clone())
        .await
        .unwrap();
    let second_ids: Vec<&str> = second.jobs.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(second_ids, vec!["Cobalt"]);

    let third = harness
        .scheduler()
        .schedule(Selector::Auto, options)
        .await
        .unwrap();
    assert_eq!(third.total_jobs, 0);
    assert!(third.cursor.is_some());
    assert!(third.all_succeeded());
}

#[tokio::test]
async fn test_job_retry_recovers_from_failed_discovery() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Acme"]);
    config.scheduler.retry_attempts = 3;
    let harness = Harness::new(config, dir, FakeScraper::new(&[("Acme", ACME_MODELS)]));
    harness.scraper.fail_discoveries("Acme", 1);

    let scheduler = harness.scheduler();
    let report = scheduler
        .schedule(Selector::Jobs(ids(&["Acme"])), ScheduleOptions::default())
        .await
        .unwrap();

    let job = report.job("Acme").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.completed_tasks, 5);
    assert!(job.error.is_none());
    assert!(report.all_succeeded());
    assert_eq!(harness.scraper.discoveries("Acme"), 2);
    assert_eq!(harness.scraper.total_calls(), 5);

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.completed_jobs, ids(&["Acme"]));
    assert!(snapshot.failed_jobs.is_empty());
}

#[tokio::test]
async fn test_shutdown_during_retry_delay_fails_waiting_job() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &["Empty"]);
    config.scheduler.retry_attempts = 3;
    config.scheduler.retry_delay_ms = 5_000;
    let harness = Harness::new(config, dir, FakeScraper::new(&[]));

    let scheduler = Arc::new(harness.scheduler());
    let run = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Selector::Jobs(ids(&["Empty"])), ScheduleOptions::default())
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.scraper.discoveries("Empty") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.shutdown.shutdown().await;

    // Returns well before the retry delay would have elapsed
    let report = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.interrupted);
    let job = report.job("Empty").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some("interrupted by shutdown"));
    assert_eq!(harness.scraper.discoveries("Empty"), 1);

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.running, 0);

    let raw = std::fs::read_to_string(&harness.config.output.status_path).unwrap();
    let status: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(status["queuedJobs"], serde_json::json!([]));
}

#[tokio::test]
async fn test_auto_mode_after_interrupted_session_picks_up_unfinished_jobs() {
    let dir = TempDir::new().unwrap();
    let brands = ["Acme", "Birch", "Cobalt"];
    let mut config = test_config(dir.path(), &brands);
    config.scheduler.max_concurrent_jobs = 1;
    let scraper = FakeScraper::new(&[("Acme", ACME_ONLY), ("Birch", BIRCH_ONLY), ("Cobalt", COBALT_ONLY)]);
    let mut harness = Harness::new(config, dir, scraper);
    harness.scraper.set_behavior("b1", Behavior::Hang);
    let options = ScheduleOptions {
        batch_size: Some(3),
        ..ScheduleOptions::default()
    };

    let scheduler = Arc::new(harness.scheduler());
    let run = {
        let scheduler = scheduler.clone();
        let options = options.clone();
        tokio::spawn(async move { scheduler.schedule(Selector::Auto, options).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.scraper.calls("b1") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    harness.shutdown.shutdown().await;

    let first = run.await.unwrap().unwrap();
    assert!(first.interrupted);
    assert_eq!(first.job("Acme").unwrap().status, JobStatus::Completed);
    assert_eq!(
        first.job("Cobalt").unwrap().error.as_deref(),
        Some("interrupted before admission")
    );

    // Only the finished job has an outcome; the rest stay open
    let cursor = Cursor::load(Path::new(&harness.config.output.cursor_path));
    assert!(cursor.is_completed("Acme"));
    assert!(!cursor.outcomes.contains_key("Birch"));
    assert!(!cursor.outcomes.contains_key("Cobalt"));
    assert!(cursor.failed_jobs.is_empty());

    harness.scraper.clear_behaviors();
    harness.shutdown = ShutdownCoordinator::new();
    let second = harness
        .scheduler()
        .schedule(Selector::Auto, options.clone())
        .await
        .unwrap();

    let second_ids: Vec<&str> = second.jobs.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(second_ids, vec!["Birch", "Cobalt"]);
    assert!(second.all_succeeded());
    assert_eq!(harness.scraper.calls("a1"), 1);
    assert_eq!(harness.scraper.calls("b1"), 2);
    assert_eq!(harness.scraper.discoveries("Birch"), 1);

    let third = harness
        .scheduler()
        .schedule(Selector::Auto, options)
        .await
        .unwrap();
    assert_eq!(third.total_jobs, 0);
}

//! Console summaries of reports and of the run archive

use crate::output::{OutputResult, Report};
use crate::storage::{RunArchive, RunRecord};

/// Recent runs plus the jobs that fail most often
#[derive(Debug, Clone)]
pub struct RunHistory {
    pub runs: Vec<RunRecord>,

    /// Job id and number of failed tasks, most failures first
    pub hotspots: Vec<(String, u64)>,
}

/// Loads the run history from the archive
///
/// # Arguments
///
/// * `archive` - The archive to query
/// * `limit` - Maximum number of runs (and hotspots) to load
///
/// # Returns
///
/// * `Ok(RunHistory)` - Successfully loaded history
/// * `Err(OutputError)` - Failed to query the archive
pub fn load_history(archive: &dyn RunArchive, limit: usize) -> OutputResult<RunHistory> {
    let runs = archive.recent_runs(limit)?;
    let hotspots = archive.failure_hotspots(limit)?;
    Ok(RunHistory { runs, hotspots })
}

/// Prints a run report to stdout
///
/// # Arguments
///
/// * `report` - The report to display
pub fn print_report(report: &Report) {
    println!("=== Crawl Report ===\n");

    println!("Overview:");
    println!("  Selector: {}", report.selector);
    println!("  Jobs: {}", report.total_jobs);
    println!("  Completed: {}", report.completed_jobs);
    println!("  Failed: {}", report.failed_jobs);
    println!("  Success rate: {:.1}%", report.success_rate);
    if report.interrupted {
        println!("  Run was interrupted; unfinished jobs resume from their checkpoints");
    }
    println!();

    if !report.jobs.is_empty() {
        println!("Jobs:");
        for job in &report.jobs {
            println!(
                "  {} [{}] tasks {}/{} ({:.1}%), {} failed, {} attempt(s), {:.1}s",
                job.job_id,
                job.status,
                job.completed_tasks,
                job.total_tasks,
                job.task_success_rate,
                job.failed_tasks,
                job.attempts,
                job.duration_secs
            );
            if let Some(error) = &job.error {
                println!("    error: {}", error);
            }
            for task in job.tasks.iter().filter(|t| t.error.is_some()) {
                println!(
                    "    task {} ({}): {}",
                    task.task_id,
                    task.status,
                    task.error.as_deref().unwrap_or_default()
                );
            }
        }
        println!();
    }

    if let Some(cursor) = &report.cursor {
        println!(
            "Auto mode: next index {} of {} ({} completed, {} failed so far)",
            cursor.last_index,
            cursor.total_jobs,
            cursor.completed_jobs.len(),
            cursor.failed_jobs.len()
        );
    }
}

/// Prints the run history to stdout
pub fn print_history(history: &RunHistory) {
    println!("=== Run History ===\n");

    if history.runs.is_empty() {
        println!("No runs recorded yet");
        return;
    }

    for run in &history.runs {
        println!(
            "  #{} {} [{}] {}: {}/{} jobs completed, {} failed",
            run.id,
            run.started_at,
            run.status.to_db_string(),
            run.selector,
            run.totals.completed_jobs,
            run.totals.total_jobs,
            run.totals.failed_jobs
        );
    }
    println!();

    if !history.hotspots.is_empty() {
        println!("Most failed tasks by job:");
        for (job_id, count) in &history.hotspots {
            println!("  {}: {}", job_id, count);
        }
    }
}

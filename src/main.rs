//! Marque main entry point
//!
//! This is the command-line interface for the Marque vehicle catalog crawler.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use marque_crawler::catalog::{BrandLookup, ConfigCatalog, Cursor};
use marque_crawler::config::{load_config_with_hash, Config};
use marque_crawler::crawler::{HookRegistry, JobRunner, ScheduleOptions, Scheduler, Selector};
use marque_crawler::driver::{ChromiumDriver, StaticIdentity};
use marque_crawler::output::{load_history, print_history, print_report, JsonFileStore};
use marque_crawler::recovery::ErrorRecovery;
use marque_crawler::scrape::ScriptScraper;
use marque_crawler::shutdown::ShutdownCoordinator;
use marque_crawler::storage::{open_archive, RunArchive};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Marque: a resumable vehicle catalog crawler
///
/// Marque crawls brands as jobs and their models as tasks, on a pool of
/// browser sessions. Every task is checkpointed, so an interrupted run
/// picks up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "marque-crawler")]
#[command(version)]
#[command(about = "A resumable vehicle catalog crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, value_name = "CONFIG", default_value = "marque.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the given brands, or the next auto batch
    Run(RunArgs),

    /// Validate config and show what would be crawled without crawling
    Validate {
        /// Brand names, or `auto`
        jobs: Vec<String>,
    },

    /// Show recent runs from the archive
    Stats {
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Brand names, or `auto`
    jobs: Vec<String>,

    /// Maximum number of brands crawled at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Maximum number of brands taken in auto mode
    #[arg(long)]
    batch_size: Option<usize>,

    /// Resume from saved checkpoints (default behavior)
    #[arg(long, conflicts_with = "no_resume")]
    resume: bool,

    /// Ignore saved checkpoints and rediscover every brand
    #[arg(long)]
    no_resume: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Runs the chosen command
///
/// Errors returned from here are configuration or startup errors.
async fn dispatch(cli: Cli) -> Result<ExitCode> {
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::debug!("Configuration loaded (hash: {})", config_hash);

    match cli.command {
        Command::Run(args) => handle_run(config, config_hash, args).await,
        Command::Validate { jobs } => {
            handle_validate(&config, &jobs)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { limit } => {
            handle_stats(&config, limit)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("marque_crawler=info,warn"),
            1 => EnvFilter::new("marque_crawler=debug,info"),
            _ => EnvFilter::new("marque_crawler=trace,debug"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn selector_for(config: &Config, jobs: &[String]) -> Result<Selector> {
    match Selector::from_args(jobs, config.scheduler.auto_mode) {
        Some(selector) => Ok(selector),
        None => bail!("No brands given; pass brand names, `auto`, or set AUTO_MODE=true"),
    }
}

/// Handles `validate`: shows the resolved plan without crawling
fn handle_validate(config: &Config, jobs: &[String]) -> Result<()> {
    let catalog = ConfigCatalog::new(config);

    println!("=== Marque Dry Run ===\n");

    println!("Scheduler:");
    println!("  Max concurrent jobs: {}", config.scheduler.max_concurrent_jobs);
    println!("  Retry attempts: {}", config.scheduler.retry_attempts);
    println!("  Timeout per job: {}ms", config.scheduler.timeout_per_job_ms);
    println!("  Brands per auto session: {}", config.scheduler.max_brands_per_session);

    println!("\nOutput:");
    println!("  Data: {}", config.output.data_dir);
    println!("  Checkpoints: {}", config.output.checkpoint_dir);
    println!("  Reports: {}", config.output.report_dir);
    println!("  Database: {}", config.output.database_path);

    match &config.site {
        Some(site) => println!("\nSite: {}", site.discovery_url),
        None => println!("\nSite: not configured (`run` will refuse to start)"),
    }

    println!("\nCatalog ({} brands)", catalog.len());

    let mut planned = match Selector::from_args(jobs, config.scheduler.auto_mode) {
        Some(Selector::Auto) => {
            let cursor = Cursor::load(Path::new(&config.output.cursor_path));
            let batch = cursor.next_batch(&catalog.catalog(), config.scheduler.max_brands_per_session);
            println!(
                "Auto batch from index {}: {} of {} remaining brands",
                batch.start_index,
                batch.jobs.len(),
                batch.remaining
            );
            batch.jobs
        }
        Some(Selector::Jobs(ids)) => ids
            .iter()
            .filter_map(|id| {
                let job = catalog.resolve(id);
                if job.is_none() {
                    println!("  ! {}: unknown brand", id);
                }
                job
            })
            .collect(),
        None => catalog.catalog(),
    };

    marque_crawler::catalog::sort_by_priority(&mut planned);
    for job in &planned {
        let profile = config.profile_for(&job.id);
        println!(
            "  - {} (sources {}; {} sessions, {} tasks at once, {} attempts, timeout {}s{})",
            job.id,
            job.source_ids.join(", "),
            profile.pool_size,
            profile.task_concurrency,
            profile.max_task_attempts,
            profile.timeout.as_secs(),
            if profile.hooks.is_empty() {
                String::new()
            } else {
                format!(", hooks {}", profile.hooks.join(", "))
            }
        );
    }

    println!("\n✓ Configuration is valid");
    println!("✓ Would crawl {} brands", planned.len());
    Ok(())
}

/// Handles `stats`: shows recent runs from the archive
fn handle_stats(config: &Config, limit: usize) -> Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let archive = open_archive(Path::new(&config.output.database_path))
        .context("Failed to open run archive")?;
    let history = load_history(&archive, limit)?;
    print_history(&history);

    Ok(())
}

/// Handles `run`: crawls the selected brands
async fn handle_run(mut config: Config, config_hash: String, args: RunArgs) -> Result<ExitCode> {
    let selector = selector_for(&config, &args.jobs)?;
    let Some(site) = config.site.clone() else {
        bail!("The [site] section is required to run");
    };
    if let Some(concurrency) = args.concurrency {
        config.scheduler.max_concurrent_jobs = concurrency.max(1);
    }

    let mut archive = open_archive(Path::new(&config.output.database_path))
        .context("Failed to open run archive")?;
    let run_id = archive.create_run(&config_hash, &selector.label())?;

    let config = Arc::new(config);
    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.listen_for_signals();

    let runner = JobRunner::new(
        config.clone(),
        Arc::new(ChromiumDriver::new(config.browser.clone())),
        Arc::new(ScriptScraper::new(site)),
        Arc::new(JsonFileStore::new(&config.output.data_dir)),
        Arc::new(StaticIdentity::new(config.browser.user_agent.clone())),
        HookRegistry::with_builtins(),
        Arc::new(ErrorRecovery::new(config.recovery.clone())),
        shutdown.clone(),
    );
    let scheduler = Scheduler::new(
        config.clone(),
        Arc::new(ConfigCatalog::new(&config)),
        Arc::new(runner),
        shutdown.clone(),
    )
    .with_config_hash(config_hash);

    let options = ScheduleOptions {
        resume: args.resume || !args.no_resume,
        max_concurrent_jobs: args.concurrency,
        batch_size: args.batch_size,
    };
    tracing::info!("Run {} started ({})", run_id, selector.label());

    let report = match scheduler.schedule(selector, options).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            shutdown.shutdown().await;
            return Ok(ExitCode::from(1));
        }
    };

    if let Err(e) = report.save(Path::new(&config.output.report_dir)) {
        tracing::error!("Failed to write report: {}", e);
    }
    if let Err(e) = report.archive(&mut archive, run_id) {
        tracing::error!("Failed to archive run {}: {}", run_id, e);
    }
    print_report(&report);

    if shutdown.is_triggered() {
        shutdown.wait_finished().await;
    } else {
        signals.abort();
    }

    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

//! Crawl orchestration
//!
//! This module contains the engine that drives brand jobs:
//! - The scheduler admission loop with job timeouts and retries
//! - The per-job runner (pool, discovery or resume, task execution)
//! - Named hooks applied to discovery output and task results
//! - The scheduler status snapshot

mod hooks;
mod runner;
mod scheduler;
mod status;

pub use hooks::{HookChain, HookRegistry, HookScope, JobHook, RequireItems, StripBrandPrefix};
pub use runner::{JobEnd, JobRun, JobRunner, RunRequest};
pub use scheduler::{ScheduleOptions, Scheduler, Selector};
pub use status::{write_status, SchedulerState, StatusSnapshot};

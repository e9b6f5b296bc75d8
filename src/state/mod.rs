//! State module for tracking crawl progress
//!
//! This module provides the status machines for jobs, tasks and protocol
//! capabilities.
//!
//! # Components
//!
//! - `TaskStatus`: Tracks one car task (pending, in progress, completed, failed)
//! - `JobStatus`: Tracks one brand job through admission and completion
//! - `BrandJob` / `CarTask`: The records the scheduler and job runner pass around
//! - `Capability` / `CapabilityState`: Per-context protocol activation state

mod capability;
mod job_state;
mod task_state;

// Re-export main types
pub use capability::{Capability, CapabilityState};
pub use job_state::{BrandJob, CarTask, JobStatus, ResultSummary};
pub use task_state::TaskStatus;

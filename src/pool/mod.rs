//! Resource pool for automation sessions
//!
//! This module manages the heavyweight sessions a job's tasks run on:
//! - Launching the pool with partial-failure tolerance
//! - Exclusive borrowing through `acquire` / `release`
//! - Creating normalized execution contexts and recovering broken ones
//! - Best-effort teardown
//!
//! It also provides the task-level concurrency limiter, which recovery can
//! shrink at runtime.

mod limiter;
mod manager;

pub use limiter::TaskLimiter;
pub use manager::{PreparedContext, ResourceHandle, ResourcePool};

use crate::driver::DriverError;
use thiserror::Error;

/// Errors raised by the resource pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// No session could be launched; fatal for the job
    #[error("Resource pool exhausted: 0 of {attempted} sessions started (last error: {last_error})")]
    Exhausted { attempted: usize, last_error: String },

    #[error("Resource pool has no sessions; call init_pool first")]
    NotInitialized,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

//! Error classification and recovery
//!
//! Task errors are classified by message into a kind with a severity and a
//! fixed plan of recovery actions. The executor runs the plan against the
//! failing task's context and session, probing health after each step, and
//! keeps per-job error counters so a job that keeps failing the same way
//! stops retrying.

mod classify;
mod handler;

pub use classify::{classify, ErrorClass, ErrorKind, RecoveryAction, Severity};
pub use handler::{ErrorRecovery, RecoveryOutcome, RecoveryStatistics, RecoveryTarget};

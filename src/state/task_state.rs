/// Task status definitions for tracking per-model progress
///
/// This module defines all possible states a car task can be in, and which
/// transitions between them are legal.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current state of a car task within its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    // ===== Active States =====
    /// Task has been discovered and is waiting for a worker
    Pending,

    /// Task is currently being scraped
    InProgress,

    // ===== Terminal States =====
    /// Task payload was scraped and durably stored
    Completed,

    /// Task failed; may return to `Pending` while attempts remain
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state (no further processing needed)
    ///
    /// `Failed` counts as terminal here; whether it is retried is decided
    /// by the attempt cap, not by the state itself.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if this is an active state (task may still be processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns true if this represents a successful completion
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true if the regular task lifecycle allows moving to `next`
    ///
    /// Allowed: pending → in progress, in progress → completed/failed and
    /// failed → pending (retry). The caller still has to check the attempt
    /// cap for the retry edge.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from a database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all possible task states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

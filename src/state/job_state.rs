use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current state of a brand job in the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting in the ready queue (or for a retry delay to elapse)
    Queued,

    /// Admitted and holding a scheduler slot
    Running,

    /// Finished with enough completed tasks
    Completed,

    /// Failed after exhausting scheduler retries
    Failed,
}

impl JobStatus {
    /// Returns true if the job will not be scheduled again in this session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// One top-level crawl unit: a brand and the upstream ids it is listed under
///
/// The job owns the ordered set of car tasks discovered when it starts; the
/// tasks themselves live in the job's checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandJob {
    /// Brand name, also the job key used for files and error counters
    pub id: String,

    /// Upstream identifiers for this brand (one or more)
    pub source_ids: Vec<String>,

    pub status: JobStatus,

    /// Number of times the scheduler admitted this job
    pub attempts: u32,

    /// Position in the priority list, if listed
    pub priority_rank: Option<usize>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BrandJob {
    /// Creates a queued job that has never been admitted
    pub fn new(id: impl Into<String>, source_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            source_ids,
            status: JobStatus::Queued,
            attempts: 0,
            priority_rank: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Marks the job as admitted, bumping its attempt counter
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
    }

    /// Records a terminal (or retryable) end of one admission
    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock time of the last admission, in seconds
    pub fn duration_secs(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// Item counts reported for a scraped task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    /// Number of configurations (trims) found for the model
    pub item_count: u32,

    /// Number of images collected across all configurations
    pub image_count: u32,
}

/// One unit of scraping work: a vehicle model within a brand job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarTask {
    pub id: String,
    pub display_name: String,
    pub status: TaskStatus,

    /// Number of times this task has entered `InProgress`
    #[serde(default)]
    pub attempts: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result_summary: Option<ResultSummary>,

    #[serde(default)]
    pub error_message: Option<String>,
}

impl CarTask {
    /// Creates a pending task
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            result_summary: None,
            error_message: None,
        }
    }
}

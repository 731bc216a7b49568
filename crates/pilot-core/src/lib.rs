use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod payload;
pub mod reports;

pub use payload::TaskPayload;
pub use reports::{
    DeadLetterStats, Granularity, MetricTotals, MetricsSummary, QueueStats, TaskTypeCount,
    TaskTypeMetrics, TimelineBucket,
};

pub const DEFAULT_MAX_RETRIES: i64 = 5;
pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 500;
/// A running job untouched for this long is presumed abandoned by its worker.
pub const DEFAULT_STALE_MINUTES: u32 = 60;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_METRICS_DAYS: u32 = 7;
/// Metrics are diagnostic and kept longer than finished jobs.
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailedTaskStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

impl Default for FailedTaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl FailedTaskStatus {
    pub const ALL: [FailedTaskStatus; 4] = [
        FailedTaskStatus::Pending,
        FailedTaskStatus::Retrying,
        FailedTaskStatus::Resolved,
        FailedTaskStatus::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailedTaskStatus::Pending => "pending",
            FailedTaskStatus::Retrying => "retrying",
            FailedTaskStatus::Resolved => "resolved",
            FailedTaskStatus::Abandoned => "abandoned",
        }
    }

    /// Pending and retrying entries are still owed a retry.
    pub fn is_actionable(&self) -> bool {
        matches!(self, FailedTaskStatus::Pending | FailedTaskStatus::Retrying)
    }
}

impl fmt::Display for FailedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailedTaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(FailedTaskStatus::Pending),
            "retrying" => Ok(FailedTaskStatus::Retrying),
            "resolved" => Ok(FailedTaskStatus::Resolved),
            "abandoned" => Ok(FailedTaskStatus::Abandoned),
            other => Err(format!("Unknown dead-letter status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Success,
    Failure,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Success => "success",
            MetricStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "success" => Ok(MetricStatus::Success),
            "failure" => Ok(MetricStatus::Failure),
            other => Err(format!("Unknown metric status: {other}")),
        }
    }
}

/// A unit of deferrable work as stored in the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub task_type: String,
    pub task_data: Value,
    pub priority: i64,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn payload(&self) -> TaskPayload {
        TaskPayload::decode(&self.task_type, &self.task_data)
    }
}

/// Parameters for a new job. Everything but the task type has a default.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_type: String,
    pub priority: i64,
    pub blocked_by: Vec<i64>,
    pub task_data: Value,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            priority: 0,
            blocked_by: Vec::new(),
            task_data: Value::Object(Default::default()),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.blocked_by = ids.into_iter().collect();
        self
    }

    pub fn data(mut self, task_data: Value) -> Self {
        self.task_data = task_data;
        self
    }
}

/// Result of a claim attempt. `acquired == false` covers both an empty queue
/// and losing the race to another worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DequeueOutcome {
    pub job: Option<Job>,
    pub acquired: bool,
}

impl DequeueOutcome {
    pub fn claimed(job: Job) -> Self {
        Self {
            job: Some(job),
            acquired: true,
        }
    }

    pub fn nothing() -> Self {
        Self {
            job: None,
            acquired: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Dead-letter entry for a task that failed terminally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedTask {
    pub id: i64,
    pub task_type: String,
    pub task_data: Value,
    pub error_message: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: FailedTaskStatus,
}

impl FailedTask {
    /// Rebuilds a job request so a retry sweep can resubmit this task.
    pub fn to_new_job(&self) -> NewJob {
        NewJob::new(self.task_type.clone()).data(self.task_data.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedTaskFilter {
    pub status: Option<FailedTaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One immutable execution fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetric {
    pub id: i64,
    pub task_type: String,
    pub project_name: Option<String>,
    pub status: MetricStatus,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

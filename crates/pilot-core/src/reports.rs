//! Read-only aggregate views returned by the queue, dead-letter and metrics queries.

use crate::TaskMetric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTypeCount {
    pub task_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending_by_type: Vec<TaskTypeCount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub total: i64,
    pub pending: i64,
    pub retrying: i64,
    pub resolved: i64,
    pub abandoned: i64,
    /// Unresolved entries only.
    pub by_task_type: Vec<TaskTypeCount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricTotals {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    /// Percentage in `0.0..=100.0`, rounded to one decimal.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
}

impl MetricTotals {
    pub fn from_counts(success: i64, failure: i64, avg_duration_ms: Option<f64>) -> Self {
        let total = success + failure;
        let success_rate = if total == 0 {
            0.0
        } else {
            (success as f64 * 1000.0 / total as f64).round() / 10.0
        };
        Self {
            total,
            success,
            failure,
            success_rate,
            avg_duration_ms: avg_duration_ms.map(|avg| avg.round()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTypeMetrics {
    pub task_type: String,
    #[serde(flatten)]
    pub totals: MetricTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub totals: MetricTotals,
    pub by_task_type: Vec<TaskTypeMetrics>,
    pub recent_failures: Vec<TaskMetric>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "hour" | "hourly" => Ok(Granularity::Hour),
            "day" | "daily" => Ok(Granularity::Day),
            other => Err(format!("Unknown granularity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineBucket {
    /// `YYYY-MM-DD` or `YYYY-MM-DDTHH:00`, UTC.
    pub bucket: String,
    pub success: i64,
    pub failure: i64,
}

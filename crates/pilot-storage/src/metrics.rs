use crate::{cutoff_before, enum_column, format_timestamp, timestamp_column, StorageError, Store};
use chrono::{DateTime, Duration, Utc};
use pilot_core::{
    Granularity, MetricStatus, MetricTotals, MetricsSummary, TaskMetric, TaskTypeMetrics,
    TimelineBucket,
};
use rusqlite::{params, Connection, Row};

const RECENT_FAILURES_LIMIT: i64 = 10;

const METRIC_COLUMNS: &str =
    "id, task_type, project_name, status, duration_ms, error_message, created_at";

/// One execution outcome, written by the job queue's ack/nack paths only.
#[derive(Debug, Clone)]
pub(crate) struct MetricRecord<'a> {
    pub task_type: &'a str,
    pub project_name: Option<&'a str>,
    pub status: MetricStatus,
    pub duration_ms: Option<i64>,
    pub error_message: Option<&'a str>,
}

pub(crate) fn record_task_metric(
    conn: &Connection,
    record: &MetricRecord<'_>,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    conn.execute(
        "
        INSERT INTO task_metrics (
            task_type,
            project_name,
            status,
            duration_ms,
            error_message,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            record.task_type,
            record.project_name,
            record.status.as_str(),
            record.duration_ms,
            record.error_message,
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<TaskMetric> {
    Ok(TaskMetric {
        id: row.get(0)?,
        task_type: row.get(1)?,
        project_name: row.get(2)?,
        status: enum_column(row, 3)?,
        duration_ms: row.get(4)?,
        error_message: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

fn window_start(days: u32, now: DateTime<Utc>) -> String {
    cutoff_before(now, Duration::days(i64::from(days)))
}

impl Store {
    /// Totals, per-type breakdown and the latest failures over the last `days`.
    pub fn metrics_summary(&self, days: u32) -> Result<MetricsSummary, StorageError> {
        self.summarize(days, None)
    }

    pub fn project_metrics(&self, project: &str, days: u32) -> Result<MetricsSummary, StorageError> {
        self.summarize(days, Some(project))
    }

    fn summarize(&self, days: u32, project: Option<&str>) -> Result<MetricsSummary, StorageError> {
        let since = window_start(days, Utc::now());

        let totals = self.conn.query_row(
            "
            SELECT
                COALESCE(SUM(status = 'success'), 0),
                COALESCE(SUM(status = 'failure'), 0),
                AVG(duration_ms)
            FROM task_metrics
            WHERE created_at >= ?1 AND (?2 IS NULL OR project_name = ?2)
            ",
            params![since, project],
            |row| {
                Ok(MetricTotals::from_counts(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                ))
            },
        )?;

        let mut stmt = self.conn.prepare(
            "
            SELECT
                task_type,
                COALESCE(SUM(status = 'success'), 0),
                COALESCE(SUM(status = 'failure'), 0),
                AVG(duration_ms)
            FROM task_metrics
            WHERE created_at >= ?1 AND (?2 IS NULL OR project_name = ?2)
            GROUP BY task_type
            ORDER BY COUNT(*) DESC, task_type ASC
            ",
        )?;
        let by_task_type = stmt
            .query_map(params![since, project], |row| {
                Ok(TaskTypeMetrics {
                    task_type: row.get(0)?,
                    totals: MetricTotals::from_counts(row.get(1)?, row.get(2)?, row.get(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {METRIC_COLUMNS}
            FROM task_metrics
            WHERE status = 'failure'
              AND created_at >= ?1
              AND (?2 IS NULL OR project_name = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "
        ))?;
        let recent_failures = stmt
            .query_map(
                params![since, project, RECENT_FAILURES_LIMIT],
                metric_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MetricsSummary {
            days,
            project: project.map(str::to_string),
            totals,
            by_task_type,
            recent_failures,
        })
    }

    /// Success/failure counts per hour or per UTC day, oldest bucket first.
    pub fn metrics_timeline(
        &self,
        days: u32,
        granularity: Granularity,
    ) -> Result<Vec<TimelineBucket>, StorageError> {
        let bucket = match granularity {
            Granularity::Hour => "substr(created_at, 1, 13) || ':00'",
            Granularity::Day => "substr(created_at, 1, 10)",
        };
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT
                {bucket} AS bucket,
                COALESCE(SUM(status = 'success'), 0),
                COALESCE(SUM(status = 'failure'), 0)
            FROM task_metrics
            WHERE created_at >= ?1
            GROUP BY bucket
            ORDER BY bucket ASC
            "
        ))?;
        let buckets = stmt
            .query_map([window_start(days, Utc::now())], |row| {
                Ok(TimelineBucket {
                    bucket: row.get(0)?,
                    success: row.get(1)?,
                    failure: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    pub fn cleanup_old_metrics(&self, older_than_days: u32) -> Result<usize, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM task_metrics WHERE created_at < ?1",
            [window_start(older_than_days, Utc::now())],
        )?;
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn all_metrics(&self) -> Result<Vec<TaskMetric>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {METRIC_COLUMNS} FROM task_metrics ORDER BY id"))?;
        let rows = stmt
            .query_map([], metric_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Utc.from_utc_datetime(&midnight))
            .expect("midnight")
            - Duration::days(1)
            + Duration::hours(i64::from(hour))
            + Duration::minutes(i64::from(minute))
    }

    fn record(
        store: &Store,
        task_type: &str,
        project: Option<&str>,
        status: MetricStatus,
        duration_ms: Option<i64>,
        at: DateTime<Utc>,
    ) {
        let error_message = match status {
            MetricStatus::Failure => Some("boom"),
            MetricStatus::Success => None,
        };
        record_task_metric(
            &store.conn,
            &MetricRecord {
                task_type,
                project_name: project,
                status,
                duration_ms,
                error_message,
            },
            at,
        )
        .expect("record metric");
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let store = Store::open_in_memory().expect("open db");
        let summary = store.metrics_summary(7).expect("summary");
        assert_eq!(summary.days, 7);
        assert_eq!(summary.totals, MetricTotals::from_counts(0, 0, None));
        assert!(summary.by_task_type.is_empty());
        assert!(summary.recent_failures.is_empty());
    }

    #[test]
    fn summary_groups_by_task_type() {
        let store = Store::open_in_memory().expect("open db");
        let at = ts(9, 0);
        record(&store, "deploy", Some("site"), MetricStatus::Success, Some(100), at);
        record(&store, "deploy", Some("site"), MetricStatus::Failure, Some(300), at);
        record(&store, "deploy", Some("api"), MetricStatus::Success, None, at);
        record(&store, "cron", None, MetricStatus::Success, Some(50), at);

        let summary = store.metrics_summary(7).expect("summary");
        assert_eq!(summary.totals.total, 4);
        assert_eq!(summary.totals.success, 3);
        assert_eq!(summary.totals.failure, 1);
        assert_eq!(summary.totals.success_rate, 75.0);
        assert_eq!(summary.totals.avg_duration_ms, Some(150.0));

        assert_eq!(summary.by_task_type.len(), 2);
        assert_eq!(summary.by_task_type[0].task_type, "deploy");
        assert_eq!(summary.by_task_type[0].totals.total, 3);
        assert_eq!(summary.by_task_type[1].task_type, "cron");

        assert_eq!(summary.recent_failures.len(), 1);
        assert_eq!(summary.recent_failures[0].error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn summary_window_excludes_old_rows() {
        let store = Store::open_in_memory().expect("open db");
        record(&store, "deploy", None, MetricStatus::Success, None, Utc::now() - Duration::days(10));
        record(&store, "deploy", None, MetricStatus::Failure, None, Utc::now() - Duration::hours(1));

        let summary = store.metrics_summary(7).expect("summary");
        assert_eq!(summary.totals.total, 1);
        assert_eq!(summary.totals.failure, 1);
        assert_eq!(store.metrics_summary(30).expect("summary").totals.total, 2);
    }

    #[test]
    fn recent_failures_are_capped_and_newest_first() {
        let store = Store::open_in_memory().expect("open db");
        for minute in 0..15 {
            record(&store, "agent", None, MetricStatus::Failure, None, ts(8, minute));
        }
        let summary = store.metrics_summary(7).expect("summary");
        assert_eq!(summary.recent_failures.len(), 10);
        assert_eq!(summary.recent_failures[0].created_at, ts(8, 14));
    }

    #[test]
    fn project_metrics_filter_by_project() {
        let store = Store::open_in_memory().expect("open db");
        let at = ts(10, 0);
        record(&store, "deploy", Some("site"), MetricStatus::Success, Some(10), at);
        record(&store, "git_sync", Some("site"), MetricStatus::Failure, Some(30), at);
        record(&store, "deploy", Some("api"), MetricStatus::Success, Some(90), at);

        let summary = store.project_metrics("site", 7).expect("project summary");
        assert_eq!(summary.project.as_deref(), Some("site"));
        assert_eq!(summary.totals.total, 2);
        assert_eq!(summary.totals.avg_duration_ms, Some(20.0));
        assert_eq!(summary.recent_failures.len(), 1);

        let empty = store.project_metrics("unknown", 7).expect("empty summary");
        assert_eq!(empty.totals.total, 0);
        assert_eq!(empty.totals.success_rate, 0.0);
    }

    #[test]
    fn timeline_buckets_by_day_and_hour() {
        let store = Store::open_in_memory().expect("open db");
        record(&store, "deploy", None, MetricStatus::Success, None, ts(9, 5));
        record(&store, "deploy", None, MetricStatus::Failure, None, ts(9, 55));
        record(&store, "deploy", None, MetricStatus::Success, None, ts(13, 0));

        let day = ts(0, 0).format("%Y-%m-%d").to_string();

        let daily = store.metrics_timeline(7, Granularity::Day).expect("daily");
        assert_eq!(
            daily,
            vec![TimelineBucket {
                bucket: day.clone(),
                success: 2,
                failure: 1,
            }]
        );

        let hourly = store.metrics_timeline(7, Granularity::Hour).expect("hourly");
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].bucket, format!("{day}T09:00"));
        assert_eq!((hourly[0].success, hourly[0].failure), (1, 1));
        assert_eq!(hourly[1].bucket, format!("{day}T13:00"));
    }

    #[test]
    fn cleanup_removes_rows_past_retention() {
        let store = Store::open_in_memory().expect("open db");
        record(&store, "cron", None, MetricStatus::Success, None, Utc::now() - Duration::days(120));
        record(&store, "cron", None, MetricStatus::Success, None, Utc::now() - Duration::days(2));

        assert_eq!(store.cleanup_old_metrics(90).expect("cleanup"), 1);
        assert_eq!(store.all_metrics().expect("metrics").len(), 1);
    }

    #[test]
    fn unbounded_windows_cover_everything_and_delete_nothing() {
        let store = Store::open_in_memory().expect("open db");
        record(&store, "cron", None, MetricStatus::Success, None, Utc::now() - Duration::days(400));
        record(&store, "cron", None, MetricStatus::Failure, None, ts(9, 0));

        let summary = store.metrics_summary(u32::MAX).expect("summary");
        assert_eq!(summary.totals.total, 2);
        let daily = store
            .metrics_timeline(u32::MAX, Granularity::Day)
            .expect("timeline");
        assert_eq!(daily.len(), 2);
        assert_eq!(store.cleanup_old_metrics(u32::MAX).expect("cleanup"), 0);
        assert_eq!(store.all_metrics().expect("metrics").len(), 2);
    }
}

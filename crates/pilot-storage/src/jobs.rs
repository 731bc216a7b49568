use crate::dead_letter::insert_failed_task;
use crate::metrics::{record_task_metric, MetricRecord};
use crate::{
    cutoff_before, enum_column, format_timestamp, json_column, optional_timestamp_column,
    timestamp_column, to_json_text, StorageError, Store,
};
use chrono::{DateTime, Duration, Utc};
use pilot_core::{
    clamp_limit, DequeueOutcome, Job, JobFilter, JobStatus, MetricStatus, NewJob, QueueStats,
    TaskTypeCount, DEFAULT_MAX_RETRIES,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

const JOB_COLUMNS: &str = "id, task_type, task_data, priority, status, worker_id, blocked_by, \
     created_at, started_at, completed_at, error_message";

/// Highest priority first, then oldest, skipping jobs with an unfinished
/// dependency. Ids listed in `blocked_by` that no longer exist count as done.
const SELECT_CLAIMABLE: &str = "
    SELECT j.id
    FROM jobs j
    WHERE j.status = 'pending'
      AND NOT EXISTS (
          SELECT 1
          FROM json_each(COALESCE(j.blocked_by, '[]')) AS dep
          JOIN jobs d ON d.id = dep.value
          WHERE d.status != 'completed'
      )
    ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
    LIMIT 1
";

pub const CANCELLED_MESSAGE: &str = "cancelled";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let blocked_by = match row.get::<_, Option<String>>(6)? {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?,
        _ => Vec::new(),
    };

    Ok(Job {
        id: row.get(0)?,
        task_type: row.get(1)?,
        task_data: json_column(row, 2)?,
        priority: row.get(3)?,
        status: enum_column(row, 4)?,
        worker_id: row.get(5)?,
        blocked_by,
        created_at: timestamp_column(row, 7)?,
        started_at: optional_timestamp_column(row, 8)?,
        completed_at: optional_timestamp_column(row, 9)?,
        error_message: row.get(10)?,
    })
}

fn fetch_job(conn: &Connection, job_id: i64) -> Result<Option<Job>, StorageError> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [job_id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

fn encode_blocked_by(ids: &[i64]) -> Result<Option<String>, StorageError> {
    if ids.is_empty() {
        return Ok(None);
    }
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    serde_json::to_string(&ids)
        .map(Some)
        .map_err(|err| StorageError::Serialization(err.to_string()))
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    started_at.map(|started| (now - started).num_milliseconds().max(0))
}

impl Store {
    pub fn enqueue(&self, job: &NewJob) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO jobs (task_type, task_data, priority, status, blocked_by, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
            ",
            params![
                job.task_type,
                to_json_text(&job.task_data)?,
                job.priority,
                encode_blocked_by(&job.blocked_by)?,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claims the next eligible job for `worker_id`.
    ///
    /// Selection and the claim are separate statements; the conditional
    /// `UPDATE ... WHERE status = 'pending'` alone decides ownership. Losing
    /// that race returns `acquired: false` and the caller polls again.
    pub fn dequeue(&self, worker_id: &str) -> Result<DequeueOutcome, StorageError> {
        let tx = self.immediate_transaction()?;
        let candidate: Option<i64> = tx
            .query_row(SELECT_CLAIMABLE, [], |row| row.get(0))
            .optional()?;
        let job_id = match candidate {
            Some(job_id) => job_id,
            None => return Ok(DequeueOutcome::nothing()),
        };

        let claimed = tx.execute(
            "
            UPDATE jobs
            SET status = 'running', worker_id = ?1, started_at = ?2
            WHERE id = ?3 AND status = 'pending'
            ",
            params![worker_id, format_timestamp(Utc::now()), job_id],
        )?;
        if claimed == 0 {
            return Ok(DequeueOutcome::nothing());
        }

        let job = fetch_job(&tx, job_id)?;
        tx.commit()?;
        Ok(job.map_or_else(DequeueOutcome::nothing, DequeueOutcome::claimed))
    }

    /// Marks a running job completed and records a success metric. Returns
    /// `false` when the job is not running (already finished, or never claimed).
    pub fn ack(&self, job_id: i64, duration_ms: Option<i64>) -> Result<bool, StorageError> {
        let tx = self.immediate_transaction()?;
        let job = match fetch_job(&tx, job_id)? {
            Some(job) if job.status == JobStatus::Running => job,
            _ => return Ok(false),
        };
        let now = Utc::now();

        let changed = tx.execute(
            "
            UPDATE jobs
            SET status = 'completed', completed_at = ?1, worker_id = NULL, started_at = NULL
            WHERE id = ?2 AND status = 'running'
            ",
            params![format_timestamp(now), job_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        let payload = job.payload();
        record_task_metric(
            &tx,
            &MetricRecord {
                task_type: &job.task_type,
                project_name: payload.project_name(),
                status: MetricStatus::Success,
                duration_ms: duration_ms.or_else(|| elapsed_ms(job.started_at, now)),
                error_message: None,
            },
            now,
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Reports a failed attempt on a running job.
    ///
    /// With `retry` the job goes back to pending for another claim and nothing
    /// else is written. Without it the job fails terminally: the job update,
    /// one failure metric and one dead-letter entry commit together.
    pub fn nack(
        &self,
        job_id: i64,
        error_message: &str,
        retry: bool,
        duration_ms: Option<i64>,
    ) -> Result<bool, StorageError> {
        let tx = self.immediate_transaction()?;
        let job = match fetch_job(&tx, job_id)? {
            Some(job) if job.status == JobStatus::Running => job,
            _ => return Ok(false),
        };
        let now = Utc::now();

        if retry {
            let changed = tx.execute(
                "
                UPDATE jobs
                SET status = 'pending', worker_id = NULL, started_at = NULL, error_message = ?1
                WHERE id = ?2 AND status = 'running'
                ",
                params![error_message, job_id],
            )?;
            tx.commit()?;
            return Ok(changed > 0);
        }

        let changed = tx.execute(
            "
            UPDATE jobs
            SET status = 'failed',
                completed_at = ?1,
                worker_id = NULL,
                started_at = NULL,
                error_message = ?2
            WHERE id = ?3 AND status = 'running'
            ",
            params![format_timestamp(now), error_message, job_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        let payload = job.payload();
        record_task_metric(
            &tx,
            &MetricRecord {
                task_type: &job.task_type,
                project_name: payload.project_name(),
                status: MetricStatus::Failure,
                duration_ms: duration_ms.or_else(|| elapsed_ms(job.started_at, now)),
                error_message: Some(error_message),
            },
            now,
        )?;
        insert_failed_task(
            &tx,
            &self.backoff,
            &job.task_type,
            &job.task_data,
            error_message,
            DEFAULT_MAX_RETRIES,
            now,
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>, StorageError> {
        fetch_job(&self.conn, job_id)
    }

    /// Newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(|status| status.as_str()),
                    filter.task_type,
                    clamp_limit(filter.limit),
                    filter.offset.unwrap_or(0),
                ],
                job_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, StorageError> {
        let mut stats = QueueStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((enum_column::<JobStatus>(row, 0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in counts {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }

        let mut stmt = self.conn.prepare(
            "
            SELECT task_type, COUNT(*)
            FROM jobs
            WHERE status = 'pending'
            GROUP BY task_type
            ORDER BY COUNT(*) DESC, task_type ASC
            ",
        )?;
        stats.pending_by_type = stmt
            .query_map([], |row| {
                Ok(TaskTypeCount {
                    task_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Puts jobs that have been running longer than `stale_minutes` back in the
    /// queue. Covers workers that died without acking or nacking.
    pub fn cleanup_stale_jobs(&self, stale_minutes: u32) -> Result<usize, StorageError> {
        let cutoff = cutoff_before(Utc::now(), Duration::minutes(i64::from(stale_minutes)));
        let reset = self.conn.execute(
            "
            UPDATE jobs
            SET status = 'pending',
                error_message = printf(
                    'reset: worker %s held the job for more than %d minutes',
                    COALESCE(worker_id, 'unknown'),
                    ?1
                ),
                worker_id = NULL,
                started_at = NULL
            WHERE status = 'running' AND started_at < ?2
            ",
            params![stale_minutes, cutoff],
        )?;
        Ok(reset)
    }

    /// Deletes completed and failed jobs that finished more than
    /// `older_than_days` ago.
    pub fn cleanup_old_jobs(&self, older_than_days: u32) -> Result<usize, StorageError> {
        let cutoff = cutoff_before(Utc::now(), Duration::days(i64::from(older_than_days)));
        let removed = self.conn.execute(
            "
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed') AND completed_at < ?1
            ",
            [cutoff],
        )?;
        Ok(removed)
    }

    /// Withdraws a pending job. Claimed and finished jobs are left alone.
    pub fn cancel_job(&self, job_id: i64) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "
            UPDATE jobs
            SET status = 'failed', completed_at = ?1, error_message = ?2
            WHERE id = ?3 AND status = 'pending'
            ",
            params![format_timestamp(Utc::now()), CANCELLED_MESSAGE, job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_job_priority(&self, job_id: i64, priority: i64) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET priority = ?1 WHERE id = ?2 AND status = 'pending'",
            params![priority, job_id],
        )?;
        Ok(changed > 0)
    }
}

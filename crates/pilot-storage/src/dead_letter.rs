use crate::backoff::BackoffPolicy;
use crate::{
    cutoff_before, enum_column, format_timestamp, json_column, optional_timestamp_column,
    timestamp_column, to_json_text, StorageError, Store,
};
use chrono::{DateTime, Duration, Utc};
use pilot_core::{
    clamp_limit, DeadLetterStats, FailedTask, FailedTaskFilter, FailedTaskStatus, TaskTypeCount,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

const FAILED_TASK_COLUMNS: &str = "id, task_type, task_data, error_message, retry_count, \
     max_retries, next_retry_at, created_at, updated_at, resolved_at, status";

fn failed_task_from_row(row: &Row<'_>) -> rusqlite::Result<FailedTask> {
    Ok(FailedTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        task_data: json_column(row, 2)?,
        error_message: row.get(3)?,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        next_retry_at: optional_timestamp_column(row, 6)?,
        created_at: timestamp_column(row, 7)?,
        updated_at: timestamp_column(row, 8)?,
        resolved_at: optional_timestamp_column(row, 9)?,
        status: enum_column(row, 10)?,
    })
}

fn fetch_failed_task(conn: &Connection, id: i64) -> Result<Option<FailedTask>, StorageError> {
    let task = conn
        .query_row(
            &format!("SELECT {FAILED_TASK_COLUMNS} FROM failed_tasks WHERE id = ?1"),
            [id],
            failed_task_from_row,
        )
        .optional()?;
    Ok(task)
}

/// Inserts a dead-letter row scheduled by the backoff at retry count zero.
/// A budget of zero retries is abandoned on arrival.
pub(crate) fn insert_failed_task(
    conn: &Connection,
    backoff: &BackoffPolicy,
    task_type: &str,
    task_data: &Value,
    error_message: &str,
    max_retries: i64,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let (status, next_retry_at) = if max_retries <= 0 {
        (FailedTaskStatus::Abandoned, None)
    } else {
        (
            FailedTaskStatus::Pending,
            Some(format_timestamp(backoff.next_retry_at(0, now))),
        )
    };
    let stamp = format_timestamp(now);

    conn.execute(
        "
        INSERT INTO failed_tasks (
            task_type,
            task_data,
            error_message,
            retry_count,
            max_retries,
            next_retry_at,
            created_at,
            updated_at,
            status
        ) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6, ?7)
        ",
        params![
            task_type,
            to_json_text(task_data)?,
            error_message,
            max_retries,
            next_retry_at,
            stamp,
            status.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    pub fn add_failed_task(
        &self,
        task_type: &str,
        task_data: &Value,
        error_message: &str,
        max_retries: i64,
    ) -> Result<i64, StorageError> {
        insert_failed_task(
            &self.conn,
            &self.backoff,
            task_type,
            task_data,
            error_message,
            max_retries,
            Utc::now(),
        )
    }

    pub fn get_failed_task(&self, id: i64) -> Result<Option<FailedTask>, StorageError> {
        fetch_failed_task(&self.conn, id)
    }

    /// Newest first.
    pub fn list_failed_tasks(
        &self,
        filter: &FailedTaskFilter,
    ) -> Result<Vec<FailedTask>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {FAILED_TASK_COLUMNS}
            FROM failed_tasks
            WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "
        ))?;
        let tasks = stmt
            .query_map(
                params![
                    filter.status.map(|status| status.as_str()),
                    filter.task_type,
                    clamp_limit(filter.limit),
                    filter.offset.unwrap_or(0),
                ],
                failed_task_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Entries whose retry is due, earliest schedule first. Polled by an
    /// external sweep that resubmits `task_data` to the job queue.
    pub fn get_retryable_tasks(&self) -> Result<Vec<FailedTask>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {FAILED_TASK_COLUMNS}
            FROM failed_tasks
            WHERE status IN ('pending', 'retrying')
              AND retry_count < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY next_retry_at ASC, id ASC
            "
        ))?;
        let tasks = stmt
            .query_map([format_timestamp(Utc::now())], failed_task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Counts one more retry attempt. The entry moves to `retrying` with a new
    /// backoff slot, or to `abandoned` once the count reaches `max_retries`.
    /// Returns `false` for resolved/abandoned/missing rows and lost races.
    pub fn increment_retry(&self, id: i64) -> Result<bool, StorageError> {
        let tx = self.immediate_transaction()?;
        let task = match fetch_failed_task(&tx, id)? {
            Some(task) if task.status.is_actionable() => task,
            _ => return Ok(false),
        };
        let now = Utc::now();
        let retry_count = task.retry_count + 1;
        let (status, next_retry_at) = if retry_count >= task.max_retries {
            (FailedTaskStatus::Abandoned, None)
        } else {
            (
                FailedTaskStatus::Retrying,
                Some(format_timestamp(self.backoff.next_retry_at(retry_count, now))),
            )
        };

        let changed = tx.execute(
            "
            UPDATE failed_tasks
            SET retry_count = ?1, status = ?2, next_retry_at = ?3, updated_at = ?4
            WHERE id = ?5 AND retry_count = ?6 AND status IN ('pending', 'retrying')
            ",
            params![
                retry_count,
                status.as_str(),
                next_retry_at,
                format_timestamp(now),
                id,
                task.retry_count,
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Operator marks the underlying problem fixed.
    pub fn resolve_task(&self, id: i64) -> Result<bool, StorageError> {
        let now = format_timestamp(Utc::now());
        let changed = self.conn.execute(
            "
            UPDATE failed_tasks
            SET status = 'resolved', resolved_at = ?1, next_retry_at = NULL, updated_at = ?1
            WHERE id = ?2 AND status != 'resolved'
            ",
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    /// Operator override: due immediately, regardless of the backoff schedule.
    /// Abandoned entries have to be resolved or deleted instead.
    pub fn retry_task_now(&self, id: i64) -> Result<bool, StorageError> {
        let now = format_timestamp(Utc::now());
        let changed = self.conn.execute(
            "
            UPDATE failed_tasks
            SET status = 'pending', next_retry_at = ?1, updated_at = ?1
            WHERE id = ?2 AND status IN ('pending', 'retrying')
            ",
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_failed_task(&self, id: i64) -> Result<bool, StorageError> {
        let changed = self
            .conn
            .execute("DELETE FROM failed_tasks WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Deletes resolved entries older than the retention window. Abandoned
    /// entries are kept until someone resolves or deletes them.
    pub fn cleanup_resolved_tasks(&self, older_than_days: u32) -> Result<usize, StorageError> {
        let cutoff = cutoff_before(Utc::now(), Duration::days(i64::from(older_than_days)));
        let removed = self.conn.execute(
            "DELETE FROM failed_tasks WHERE status = 'resolved' AND resolved_at < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }

    pub fn dead_letter_stats(&self) -> Result<DeadLetterStats, StorageError> {
        let mut stats = DeadLetterStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM failed_tasks GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((
                    enum_column::<FailedTaskStatus>(row, 0)?,
                    row.get::<_, i64>(1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in counts {
            match status {
                FailedTaskStatus::Pending => stats.pending = count,
                FailedTaskStatus::Retrying => stats.retrying = count,
                FailedTaskStatus::Resolved => stats.resolved = count,
                FailedTaskStatus::Abandoned => stats.abandoned = count,
            }
            stats.total += count;
        }

        let mut stmt = self.conn.prepare(
            "
            SELECT task_type, COUNT(*)
            FROM failed_tasks
            WHERE status != 'resolved'
            GROUP BY task_type
            ORDER BY COUNT(*) DESC, task_type ASC
            ",
        )?;
        stats.by_task_type = stmt
            .query_map([], |row| {
                Ok(TaskTypeCount {
                    task_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::DEFAULT_MAX_RETRIES;
    use serde_json::json;

    fn make_due(store: &Store, id: i64) {
        store
            .conn
            .execute(
                "UPDATE failed_tasks SET next_retry_at = ?1 WHERE id = ?2",
                params![format_timestamp(Utc::now() - Duration::seconds(5)), id],
            )
            .expect("make due");
    }

    #[test]
    fn new_entry_is_scheduled_one_backoff_step_out() {
        let store = Store::open_in_memory().expect("open db");
        let before = Utc::now();
        let id = store
            .add_failed_task("deploy", &json!({"project": "site"}), "timeout", DEFAULT_MAX_RETRIES)
            .expect("add");

        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.status, FailedTaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 5);
        assert!(task.resolved_at.is_none());
        let delay = (task.next_retry_at.expect("scheduled") - before).num_seconds();
        assert!((59..=79).contains(&delay), "delay {delay}");
    }

    #[test]
    fn zero_retry_budget_is_abandoned_on_arrival() {
        let store = Store::open_in_memory().expect("open db");
        let id = store
            .add_failed_task("cron", &json!({}), "bad config", 0)
            .expect("add");
        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.status, FailedTaskStatus::Abandoned);
        assert!(task.next_retry_at.is_none());
        assert!(!store.increment_retry(id).expect("increment"));
    }

    #[test]
    fn retryable_tasks_are_due_and_ordered() {
        let store = Store::open_in_memory().expect("open db");
        let later = store.add_failed_task("deploy", &json!({}), "a", 5).expect("later");
        let due = store.add_failed_task("deploy", &json!({}), "b", 5).expect("due");
        let resolved = store.add_failed_task("deploy", &json!({}), "c", 5).expect("resolved");
        make_due(&store, due);
        make_due(&store, resolved);
        store.resolve_task(resolved).expect("resolve");

        let retryable = store.get_retryable_tasks().expect("retryable");
        assert_eq!(retryable.iter().map(|task| task.id).collect::<Vec<_>>(), vec![due]);

        assert!(store.retry_task_now(later).expect("retry now"));
        let retryable = store.get_retryable_tasks().expect("retryable");
        assert_eq!(retryable.len(), 2);
        assert_eq!(retryable[0].id, due, "earliest schedule first");
    }

    #[test]
    fn increment_retry_backs_off_then_abandons_at_budget() {
        let store = Store::open_in_memory().expect("open db");
        let id = store
            .add_failed_task("agent", &json!({"project": "site"}), "crashed", 3)
            .expect("add");

        assert!(store.increment_retry(id).expect("first"));
        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, FailedTaskStatus::Retrying);
        let first_slot = task.next_retry_at.expect("scheduled");

        assert!(store.increment_retry(id).expect("second"));
        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.status, FailedTaskStatus::Retrying);
        assert!(task.next_retry_at.expect("scheduled") > first_slot);

        assert!(store.increment_retry(id).expect("third"));
        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.status, FailedTaskStatus::Abandoned);
        assert!(task.next_retry_at.is_none());

        assert!(!store.increment_retry(id).expect("after abandon"));
        assert!(!store.retry_task_now(id).expect("retry abandoned"));
        assert!(store.get_retryable_tasks().expect("retryable").is_empty());
    }

    #[test]
    fn resolve_is_a_single_transition() {
        let store = Store::open_in_memory().expect("open db");
        let id = store.add_failed_task("deploy", &json!({}), "x", 5).expect("add");

        assert!(store.resolve_task(id).expect("resolve"));
        assert!(!store.resolve_task(id).expect("resolve twice"));
        assert!(!store.increment_retry(id).expect("increment resolved"));
        assert!(!store.retry_task_now(id).expect("retry resolved"));

        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.status, FailedTaskStatus::Resolved);
        assert!(task.resolved_at.is_some());
        assert!(task.next_retry_at.is_none());
    }

    #[test]
    fn abandoned_entries_can_still_be_resolved() {
        let store = Store::open_in_memory().expect("open db");
        let id = store.add_failed_task("deploy", &json!({}), "x", 1).expect("add");
        assert!(store.increment_retry(id).expect("increment"));
        assert!(store.resolve_task(id).expect("resolve abandoned"));
    }

    #[test]
    fn retry_now_ignores_backoff() {
        let store = Store::open_in_memory().expect("open db");
        let id = store.add_failed_task("deploy", &json!({}), "x", 5).expect("add");
        store.increment_retry(id).expect("increment");
        store.increment_retry(id).expect("increment");

        assert!(store.retry_task_now(id).expect("retry now"));
        let task = store.get_failed_task(id).expect("get").expect("task");
        assert_eq!(task.status, FailedTaskStatus::Pending);
        assert_eq!(task.retry_count, 2);
        assert!(task.next_retry_at.expect("due") <= Utc::now());
        assert_eq!(store.get_retryable_tasks().expect("retryable").len(), 1);
    }

    #[test]
    fn cleanup_keeps_abandoned_and_recent_entries() {
        let store = Store::open_in_memory().expect("open db");
        let old_resolved = store.add_failed_task("deploy", &json!({}), "a", 5).expect("a");
        let new_resolved = store.add_failed_task("deploy", &json!({}), "b", 5).expect("b");
        let abandoned = store.add_failed_task("deploy", &json!({}), "c", 0).expect("c");
        store.resolve_task(old_resolved).expect("resolve");
        store.resolve_task(new_resolved).expect("resolve");
        let aged = format_timestamp(Utc::now() - Duration::days(60));
        store
            .conn
            .execute(
                "UPDATE failed_tasks SET resolved_at = ?1, created_at = ?1, updated_at = ?1 WHERE id IN (?2, ?3)",
                params![aged, old_resolved, abandoned],
            )
            .expect("age rows");

        assert_eq!(store.cleanup_resolved_tasks(30).expect("cleanup"), 1);
        assert!(store.get_failed_task(old_resolved).expect("get").is_none());
        assert!(store.get_failed_task(new_resolved).expect("get").is_some());
        assert!(store.get_failed_task(abandoned).expect("get").is_some());
    }

    #[test]
    fn unbounded_cleanup_window_keeps_resolved_entries() {
        let store = Store::open_in_memory().expect("open db");
        let id = store.add_failed_task("deploy", &json!({}), "a", 5).expect("add");
        store.resolve_task(id).expect("resolve");
        let aged = format_timestamp(Utc::now() - Duration::days(400));
        store
            .conn
            .execute("UPDATE failed_tasks SET resolved_at = ?1 WHERE id = ?2", params![aged, id])
            .expect("age row");

        assert_eq!(store.cleanup_resolved_tasks(u32::MAX).expect("cleanup"), 0);
        assert!(store.get_failed_task(id).expect("get").is_some());
    }

    #[test]
    fn delete_removes_entry() {
        let store = Store::open_in_memory().expect("open db");
        let id = store.add_failed_task("deploy", &json!({}), "x", 5).expect("add");
        assert!(store.delete_failed_task(id).expect("delete"));
        assert!(!store.delete_failed_task(id).expect("delete twice"));
    }

    #[test]
    fn stats_breakdown_skips_resolved() {
        let store = Store::open_in_memory().expect("open db");
        let a = store.add_failed_task("deploy", &json!({}), "a", 5).expect("a");
        store.add_failed_task("deploy", &json!({}), "b", 5).expect("b");
        store.add_failed_task("cron", &json!({}), "c", 0).expect("c");
        let resolved = store.add_failed_task("agent", &json!({}), "d", 5).expect("d");
        store.increment_retry(a).expect("increment");
        store.resolve_task(resolved).expect("resolve");

        let stats = store.dead_letter_stats().expect("stats");
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(
            stats.by_task_type,
            vec![
                TaskTypeCount {
                    task_type: "deploy".to_string(),
                    count: 2,
                },
                TaskTypeCount {
                    task_type: "cron".to_string(),
                    count: 1,
                },
            ]
        );
    }

    #[test]
    fn list_filters_by_status_and_type() {
        let store = Store::open_in_memory().expect("open db");
        store.add_failed_task("deploy", &json!({}), "a", 5).expect("a");
        let b = store.add_failed_task("cron", &json!({}), "b", 5).expect("b");
        store.resolve_task(b).expect("resolve");

        let resolved = store
            .list_failed_tasks(&FailedTaskFilter {
                status: Some(FailedTaskStatus::Resolved),
                ..Default::default()
            })
            .expect("list resolved");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, b);

        let deploys = store
            .list_failed_tasks(&FailedTaskFilter {
                task_type: Some("deploy".to_string()),
                ..Default::default()
            })
            .expect("list deploy");
        assert_eq!(deploys.len(), 1);
        assert_eq!(deploys[0].to_new_job().task_type, "deploy");
    }
}

//! Embedded store for the task queue, the dead-letter queue and task metrics.
//!
//! Every call round-trips through SQLite; nothing mutable is cached in the
//! process, so the long-lived hub and short-lived CLI invocations can share
//! one file. State transitions are `UPDATE ... WHERE status = <expected>`
//! statements inside IMMEDIATE transactions, and zero affected rows is reported
//! as `false` (another caller got there first), never as an error.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

mod backoff;
mod dead_letter;
mod jobs;
mod metrics;

pub use backoff::BackoffPolicy;

pub const QUEUE_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct Store {
    conn: Connection,
    backoff: BackoffPolicy,
}

impl Store {
    /// Opens (or creates) the store file in WAL mode and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )?;
        let store = Self {
            conn,
            backoff: BackoffPolicy::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            backoff: BackoffPolicy::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn journal_mode(&self) -> Result<String, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > QUEUE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: QUEUE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let tx = self.immediate_transaction()?;
            tx.execute_batch(include_str!("../migrations/0001_task_queue.sql"))?;
            tx.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            tx.commit()?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Takes the write lock up front so the read-then-update inside the
    /// transaction cannot be invalidated by a concurrent writer.
    pub(crate) fn immediate_transaction(&self) -> Result<Transaction<'_>, StorageError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Start of a window reaching `span` back from `now`. Spans longer than the
/// calendar allows clamp to the Unix epoch, which precedes every stored row.
pub(crate) fn cutoff_before(now: DateTime<Utc>, span: chrono::Duration) -> String {
    let cutoff = now
        .checked_sub_signed(span)
        .map_or(DateTime::UNIX_EPOCH, |cutoff| cutoff.max(DateTime::UNIX_EPOCH));
    format_timestamp(cutoff)
}

pub(crate) fn to_json_text(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(value) => DateTime::parse_from_rfc3339(&value)
            .map(|timestamp| Some(timestamp.with_timezone(&Utc)))
            .map_err(|err| conversion_error(idx, err)),
        None => Ok(None),
    }
}

pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let value: Option<String> = row.get(idx)?;
    match value {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(&text).map_err(|err| conversion_error(idx, err))
        }
        _ => Ok(Value::Object(Default::default())),
    }
}

pub(crate) fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let value: String = row.get(idx)?;
    value.parse::<T>().map_err(|err| conversion_error(idx, err))
}

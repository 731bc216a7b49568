//! HTTP front for the task queue. Every handler hands one unit of store work
//! to the blocking pool and maps the result to JSON.

use axum::{
    routing::{get, patch, post},
    Router,
};
use pilot_storage::Store;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

pub mod config;
mod dead_letter;
mod error;
mod metrics;
mod queue;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<Store>>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Runs `work` against the store on the blocking pool. SQLite calls block
    /// on disk and on `busy_timeout`, so they stay off the async workers.
    pub async fn run<T, F>(&self, work: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, ApiError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            // Open transactions roll back on unwind, so a poisoned store is still consistent.
            let guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            work(&guard)
        })
        .await
        .map_err(|err| ApiError::Internal(format!("store task failed: {err}")))?
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/queue/enqueue", post(queue::enqueue))
        .route("/queue/dequeue", post(queue::dequeue))
        .route("/queue/stats", get(queue::stats))
        .route("/queue/cleanup", post(queue::cleanup))
        .route("/queue/jobs", get(queue::list))
        .route("/queue/jobs/:id", get(queue::get_job).delete(queue::cancel))
        .route("/queue/jobs/:id/ack", post(queue::ack))
        .route("/queue/jobs/:id/nack", post(queue::nack))
        .route("/queue/jobs/:id/priority", patch(queue::update_priority))
        .route("/deadletter", get(dead_letter::list))
        .route("/deadletter/stats", get(dead_letter::stats))
        .route("/deadletter/retryable", get(dead_letter::retryable))
        .route("/deadletter/cleanup", post(dead_letter::cleanup))
        .route(
            "/deadletter/:id",
            get(dead_letter::get_task).delete(dead_letter::delete),
        )
        .route("/deadletter/:id/retry", post(dead_letter::retry_now))
        .route("/deadletter/:id/resolve", post(dead_letter::resolve))
        .route("/metrics/summary", get(metrics::summary))
        .route("/metrics/timeline", get(metrics::timeline))
        .route("/metrics/projects/:name", get(metrics::project))
        .route("/metrics/cleanup", post(metrics::cleanup))
        .with_state(state)
}

/// Empty query values count as absent.
pub(crate) fn parse_optional<T>(field: &str, raw: Option<String>) -> Result<Option<T>, ApiError>
where
    T: FromStr<Err = String>,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err| ApiError::BadRequest(format!("invalid {field}: {err}"))),
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::{JobStatus, NewJob};

    fn state() -> AppState {
        AppState::new(Store::open_in_memory().expect("open db"))
    }

    #[tokio::test]
    async fn store_work_runs_on_the_blocking_pool() {
        let state = state();
        let id = state
            .run(|store| Ok(store.enqueue(&NewJob::new("deploy"))?))
            .await
            .expect("enqueue");
        let job = state
            .run(move |store| Ok(store.get_job(id)?))
            .await
            .expect("get")
            .expect("job exists");
        assert_eq!(job.task_type, "deploy");
    }

    #[tokio::test]
    async fn work_errors_pass_through_unchanged() {
        let err = state()
            .run(|_| Err::<(), _>(ApiError::NotFound("job 4 not found".to_string())))
            .await
            .expect_err("not found");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn panicking_work_is_an_internal_error_and_the_store_stays_usable() {
        let state = state();
        let err = state
            .run(|_| -> Result<(), ApiError> { panic!("handler bug") })
            .await
            .expect_err("panic");
        assert!(matches!(err, ApiError::Internal(_)));

        let stats = state
            .run(|store| Ok(store.queue_stats()?))
            .await
            .expect("stats after panic");
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn blank_query_values_are_absent() {
        let parsed: Option<JobStatus> = parse_optional("status", Some(" ".to_string())).expect("ok");
        assert_eq!(parsed, None);
        let parsed: Option<JobStatus> = parse_optional("status", None).expect("ok");
        assert_eq!(parsed, None);
    }

    #[test]
    fn unknown_values_are_bad_requests() {
        let err = parse_optional::<JobStatus>("status", Some("done".to_string()))
            .expect_err("unknown status");
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(err.to_string().starts_with("invalid status"));
    }
}

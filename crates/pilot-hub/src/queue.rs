use crate::{parse_optional, require_non_empty, ApiError, AppState};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use pilot_core::{
    DequeueOutcome, Job, JobFilter, JobStatus, NewJob, QueueStats, DEFAULT_RETENTION_DAYS,
    DEFAULT_STALE_MINUTES,
};
use pilot_storage::Store;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub task_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub blocked_by: Vec<i64>,
    #[serde(default)]
    pub task_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub worker_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackRequest {
    pub error_message: String,
    #[serde(default)]
    pub retry: bool,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    pub stale_minutes: Option<u32>,
    pub older_than_days: Option<u32>,
}

pub async fn enqueue(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    require_non_empty("taskType", &request.task_type)?;
    let job = NewJob::new(request.task_type)
        .priority(request.priority)
        .blocked_by(request.blocked_by)
        .data(request.task_data.unwrap_or_else(|| json!({})));
    let (id, job) = state
        .run(move |store| Ok((store.enqueue(&job)?, job)))
        .await?;
    info!(
        event = "job_enqueued",
        job_id = id,
        task_type = %job.task_type,
        priority = job.priority
    );
    Ok(Json(json!({ "id": id })))
}

pub async fn dequeue(
    State(state): State<AppState>,
    payload: Result<Json<DequeueRequest>, JsonRejection>,
) -> Result<Json<DequeueOutcome>, ApiError> {
    let Json(request) = payload?;
    require_non_empty("workerId", &request.worker_id)?;
    let worker_id = request.worker_id.clone();
    let outcome = state
        .run(move |store| Ok(store.dequeue(&worker_id)?))
        .await?;
    if let Some(job) = outcome.job.as_ref().filter(|_| outcome.acquired) {
        info!(
            event = "job_claimed",
            job_id = job.id,
            task_type = %job.task_type,
            worker_id = %request.worker_id
        );
    }
    Ok(Json(outcome))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.run(move |store| require_job(store, id)).await?))
}

pub async fn ack(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Option<Json<AckRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let success = state
        .run(move |store| {
            require_job(store, id)?;
            Ok(store.ack(id, request.duration_ms)?)
        })
        .await?;
    Ok(Json(json!({ "success": success })))
}

pub async fn nack(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<NackRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    require_non_empty("errorMessage", &request.error_message)?;
    let error_message = request.error_message.clone();
    let (job, success) = state
        .run(move |store| {
            let job = require_job(store, id)?;
            let success =
                store.nack(id, &error_message, request.retry, request.duration_ms)?;
            Ok((job, success))
        })
        .await?;
    if success && !request.retry {
        warn!(
            event = "job_failed",
            job_id = id,
            task_type = %job.task_type,
            error = %request.error_message
        );
    }
    Ok(Json(json!({ "success": success })))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.run(|store| Ok(store.queue_stats()?)).await?))
}

pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let filter = JobFilter {
        status: parse_optional::<JobStatus>("status", query.status)?,
        task_type: query.task_type.filter(|value| !value.trim().is_empty()),
        limit: query.limit,
        offset: query.offset,
    };
    let jobs = state.run(move |store| Ok(store.list_jobs(&filter)?)).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let success = state
        .run(move |store| {
            require_job(store, id)?;
            Ok(store.cancel_job(id)?)
        })
        .await?;
    Ok(Json(json!({ "success": success })))
}

pub async fn update_priority(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<PriorityRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let success = state
        .run(move |store| {
            require_job(store, id)?;
            Ok(store.update_job_priority(id, request.priority)?)
        })
        .await?;
    Ok(Json(json!({ "success": success })))
}

pub async fn cleanup(
    State(state): State<AppState>,
    query: Result<Query<CleanupQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let stale_minutes = query.stale_minutes.unwrap_or(DEFAULT_STALE_MINUTES);
    let older_than_days = query.older_than_days.unwrap_or(DEFAULT_RETENTION_DAYS);
    let (stale_reset, old_deleted) = state
        .run(move |store| {
            let stale_reset = store.cleanup_stale_jobs(stale_minutes)?;
            let old_deleted = store.cleanup_old_jobs(older_than_days)?;
            Ok((stale_reset, old_deleted))
        })
        .await?;
    info!(
        event = "cleanup",
        scope = "jobs",
        stale_reset,
        old_deleted,
        stale_minutes,
        older_than_days
    );
    Ok(Json(json!({
        "stale_reset": stale_reset,
        "old_deleted": old_deleted,
    })))
}

fn require_job(store: &Store, id: i64) -> Result<Job, ApiError> {
    store
        .get_job(id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

use crate::{parse_optional, ApiError, AppState};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use pilot_core::{
    DeadLetterStats, FailedTask, FailedTaskFilter, FailedTaskStatus, DEFAULT_RETENTION_DAYS,
};
use pilot_storage::Store;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DaysQuery {
    pub days: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let filter = FailedTaskFilter {
        status: parse_optional::<FailedTaskStatus>("status", query.status)?,
        task_type: query.task_type.filter(|value| !value.trim().is_empty()),
        limit: query.limit,
        offset: query.offset,
    };
    let tasks = state
        .run(move |store| Ok(store.list_failed_tasks(&filter)?))
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<DeadLetterStats>, ApiError> {
    Ok(Json(state.run(|store| Ok(store.dead_letter_stats()?)).await?))
}

pub async fn retryable(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tasks = state.run(|store| Ok(store.get_retryable_tasks()?)).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<FailedTask>, ApiError> {
    Ok(Json(state.run(move |store| require_task(store, id)).await?))
}

pub async fn retry_now(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let success = state
        .run(move |store| {
            require_task(store, id)?;
            Ok(store.retry_task_now(id)?)
        })
        .await?;
    Ok(Json(json!({ "success": success })))
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let success = state
        .run(move |store| {
            require_task(store, id)?;
            Ok(store.resolve_task(id)?)
        })
        .await?;
    Ok(Json(json!({ "success": success })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .run(move |store| Ok(store.delete_failed_task(id)?))
        .await?;
    if !deleted {
        return Err(not_found(id));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn cleanup(
    State(state): State<AppState>,
    query: Result<Query<DaysQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_RETENTION_DAYS);
    let deleted = state
        .run(move |store| Ok(store.cleanup_resolved_tasks(days)?))
        .await?;
    info!(event = "cleanup", scope = "deadletter", deleted, days);
    Ok(Json(json!({ "deleted": deleted })))
}

fn require_task(store: &Store, id: i64) -> Result<FailedTask, ApiError> {
    store.get_failed_task(id)?.ok_or_else(|| not_found(id))
}

fn not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("failed task {id} not found"))
}

use crate::{parse_optional, ApiError, AppState};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use pilot_core::{
    Granularity, MetricsSummary, DEFAULT_METRICS_DAYS, DEFAULT_METRICS_RETENTION_DAYS,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    pub days: Option<u32>,
    pub granularity: Option<String>,
}

pub async fn summary(
    State(state): State<AppState>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricsSummary>, ApiError> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_METRICS_DAYS);
    let summary = state.run(move |store| Ok(store.metrics_summary(days)?)).await?;
    Ok(Json(summary))
}

pub async fn timeline(
    State(state): State<AppState>,
    query: Result<Query<TimelineQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_METRICS_DAYS);
    let granularity =
        parse_optional::<Granularity>("granularity", query.granularity)?.unwrap_or_default();
    let buckets = state
        .run(move |store| Ok(store.metrics_timeline(days, granularity)?))
        .await?;
    Ok(Json(json!({
        "days": days,
        "granularity": granularity,
        "buckets": buckets,
    })))
}

pub async fn project(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<MetricsSummary>, ApiError> {
    let Query(query) = query?;
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("project name must not be empty".to_string()));
    }
    let days = query.days.unwrap_or(DEFAULT_METRICS_DAYS);
    let summary = state
        .run(move |store| Ok(store.project_metrics(&name, days)?))
        .await?;
    Ok(Json(summary))
}

pub async fn cleanup(
    State(state): State<AppState>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_METRICS_RETENTION_DAYS);
    let deleted = state
        .run(move |store| Ok(store.cleanup_old_metrics(days)?))
        .await?;
    info!(event = "cleanup", scope = "metrics", deleted, days);
    Ok(Json(json!({ "deleted": deleted })))
}

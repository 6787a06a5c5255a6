//! JSON endpoint handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, AppState, DownloadDto};
use crate::orchestrator::{BatchAction, BatchError, HealthReport};
use crate::store::{DownloadStatus, ListQuery};

/// Default page size for listings.
const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    track_id: String,
    #[serde(default)]
    priority: i64,
    scheduled_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueAlbumBody {
    album_id: String,
    source: String,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReprioritizeBody {
    priority: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    order: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    ids: Vec<i64>,
    action: BatchAction,
    priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    items: Vec<DownloadDto>,
    total: i64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    success_count: u64,
    failed_count: u64,
    errors: Vec<BatchError>,
}

/// POST /downloads
pub async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<Response, ApiError> {
    let row = state
        .orchestrator
        .enqueue(&body.track_id, body.priority, body.scheduled_start)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "download": DownloadDto::from(row) })),
    )
        .into_response())
}

/// POST /downloads/album
pub async fn enqueue_album(
    State(state): State<AppState>,
    Json(body): Json<EnqueueAlbumBody>,
) -> Result<Response, ApiError> {
    let rows = state
        .orchestrator
        .enqueue_album(&body.album_id, &body.source, body.priority)
        .await?;
    let dtos: Vec<DownloadDto> = rows.into_iter().map(DownloadDto::from).collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "downloads": dtos })),
    )
        .into_response())
}

/// DELETE /downloads/{id}
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /downloads/{id}
pub async fn reprioritize(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ReprioritizeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = state.orchestrator.reprioritize(id, body.priority).await?;
    Ok(Json(json!({ "download": DownloadDto::from(row) })))
}

/// PATCH /downloads/reorder
pub async fn reorder(
    State(state): State<AppState>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated_count = state.orchestrator.reorder(&body.order).await?;
    Ok(Json(json!({ "updated_count": updated_count })))
}

/// POST /downloads/batch
pub async fn batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Result<Json<BatchResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .batch(body.action, &body.ids, body.priority)
        .await?;
    Ok(Json(BatchResponse {
        success_count: outcome.success_count,
        failed_count: outcome.failed_count,
        errors: outcome.errors,
    }))
}

/// GET /downloads
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<DownloadStatus>() {
            Ok(status) => Some(status),
            Err(message) => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": message, "reason": "InvalidStatus" })),
                )
                    .into_response());
            }
        },
    };

    let query = ListQuery {
        status,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(0),
        offset: params.offset.unwrap_or(0).max(0),
    };
    let (rows, total) = state.orchestrator.list(&query).await?;
    let items: Vec<DownloadDto> = rows.into_iter().map(DownloadDto::from).collect();
    Ok(Json(ListResponse { items, total }).into_response())
}

/// GET /downloads/{id}
pub async fn get_download(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = state.orchestrator.get(id).await?;
    Ok(Json(json!({ "download": DownloadDto::from(row) })))
}

/// GET /downloads/health
pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, ApiError> {
    Ok(Json(state.orchestrator.health().await?))
}

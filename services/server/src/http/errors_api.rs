//! Direct ingestion plus the conventional read/write surface over the
//! Store (spec.md §6 "Direct ingestion" and "List / detail / related /
//! bulk-delete / stats / services").

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap},
    Json,
};
use errly_protocol::{ErrorGroup, ListFilters, Severity, Source, TimeRange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::HttpError;
use crate::grouper::{self, Occurrence};
use crate::http::response::HttpResult;
use crate::store::error_groups::{self, Pagination};
use errly_ingest::fingerprint;

const SESSION_COOKIE_NAME: &str = "errly_session";
const INGEST_BODY_LIMIT: usize = 262_144;
const DEFAULT_LIST_LIMIT: i64 = 50;
const RELATED_WINDOW_MINUTES: i64 = 15;
const RELATED_LIMIT: i64 = 10;
const BULK_DELETE_CAP: usize = 500;

async fn require_session(state: &crate::state::AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::Unauthorized("missing session cookie".to_owned()))?;
    let raw_token = crate::auth::extract_session_cookie(cookie_header, SESSION_COOKIE_NAME)
        .ok_or_else(|| HttpError::Unauthorized("missing session cookie".to_owned()))?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    if crate::auth::validate_session(&state.pool, &raw_token, now_ms).await {
        Ok(())
    } else {
        Err(HttpError::Unauthorized("session expired".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Direct ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBody {
    pub service: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub severity: Option<Severity>,
    pub endpoint: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub id: Uuid,
    pub fingerprint: String,
    pub is_new: bool,
}

pub async fn ingest(
    State(state): State<crate::state::AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> HttpResult<(axum::http::StatusCode, Json<IngestResponse>)> {
    if body.len() > INGEST_BODY_LIMIT {
        return Err(HttpError::BadRequest("request body too large".to_owned()));
    }

    let token = headers
        .get("x-errly-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::Unauthorized("missing X-Errly-Token header".to_owned()))?;
    if !crate::store::settings::integration_token_matches(&state.pool, token).await? {
        return Err(HttpError::Unauthorized("invalid integration token".to_owned()));
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    if !state.ingest_rate_limiter.check(addr.ip(), now_ms) {
        return Err(HttpError::Unavailable("rate limit exceeded".to_owned()));
    }

    let payload: IngestBody = serde_json::from_slice(&body)
        .map_err(|e| HttpError::BadRequest(format!("invalid request body: {e}")))?;
    if payload.service.trim().is_empty() || payload.message.trim().is_empty() {
        return Err(HttpError::BadRequest("service and message are required".to_owned()));
    }

    let fp = fingerprint::fingerprint(&payload.service, &payload.message, payload.stack_trace.as_deref());
    let occurrence = Occurrence {
        service: payload.service,
        deployment_id: String::new(),
        message: payload.message,
        stack_trace: payload.stack_trace,
        severity: payload.severity.unwrap_or(Severity::Error),
        endpoint: payload.endpoint,
        raw_log: String::new(),
        source: Source::Direct,
        metadata: payload.metadata,
    };

    let result = grouper::process(&state.pool, &occurrence, &fp, now_ms).await?;

    let event = if result.is_new {
        errly_protocol::PushEvent::NewError(Box::new(result.group.clone()))
    } else {
        errly_protocol::PushEvent::ErrorUpdated(Box::new(result.group.clone()))
    };
    state.hub.publish(event).await;

    if result.is_new {
        if let Ok(Some(webhook_url)) = crate::store::settings::get_webhook_url(&state.pool).await {
            crate::webhook::dispatch_new_error(&state.http, &webhook_url, &result.group, now_ms).await;
        }
    }

    Ok((
        axum::http::StatusCode::CREATED,
        Json(IngestResponse { id: result.group.id, fingerprint: fp, is_new: result.is_new }),
    ))
}

// ---------------------------------------------------------------------------
// List / detail / related
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub service: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub time_range: Option<String>,
    pub query: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(
    State(state): State<crate::state::AppState>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> HttpResult<Json<Vec<ErrorGroup>>> {
    require_session(&state, &headers).await?;
    let filters = ListFilters {
        service: q.service,
        severity: q.severity.as_deref().and_then(Severity::parse),
        status: q.status.as_deref().and_then(errly_protocol::Status::parse),
        time_range: q.time_range.as_deref().and_then(TimeRange::parse),
        query: q.query,
    };
    let pagination = Pagination { limit: q.limit.unwrap_or(DEFAULT_LIST_LIMIT), offset: q.offset.unwrap_or(0) };
    let now_ms = chrono::Utc::now().timestamp_millis();
    let groups = error_groups::list(&state.pool, &filters, pagination, now_ms).await?;
    Ok(Json(groups))
}

pub async fn detail(
    State(state): State<crate::state::AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> HttpResult<Json<ErrorGroup>> {
    require_session(&state, &headers).await?;
    let group = error_groups::get_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| HttpError::NotFound("no such error group".to_owned()))?;
    Ok(Json(group))
}

pub async fn related(
    State(state): State<crate::state::AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> HttpResult<Json<Vec<ErrorGroup>>> {
    require_session(&state, &headers).await?;
    let group = error_groups::get_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| HttpError::NotFound("no such error group".to_owned()))?;
    let related = error_groups::related(&state.pool, &group, RELATED_WINDOW_MINUTES, RELATED_LIMIT).await?;
    Ok(Json(related))
}

// ---------------------------------------------------------------------------
// Bulk delete
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBody {
    #[serde(default)]
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub deleted: u64,
}

pub async fn delete(
    State(state): State<crate::state::AppState>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> HttpResult<Json<DeleteResponse>> {
    require_session(&state, &headers).await?;

    if body.ids.is_empty() {
        if !body.confirm {
            return Err(HttpError::BadRequest("deleting all error groups requires confirm: true".to_owned()));
        }
        let deleted = error_groups::delete_all(&state.pool).await?;
        state.hub.publish(errly_protocol::PushEvent::BulkCleared {}).await;
        return Ok(Json(DeleteResponse { deleted }));
    }

    if body.ids.len() > BULK_DELETE_CAP {
        return Err(HttpError::BadRequest(format!("cannot delete more than {BULK_DELETE_CAP} ids at once")));
    }

    let deleted = error_groups::delete_by_ids(&state.pool, &body.ids).await?;
    state.hub.publish(errly_protocol::PushEvent::ErrorCleared { ids: body.ids }).await;
    Ok(Json(DeleteResponse { deleted }))
}

// ---------------------------------------------------------------------------
// Stats / services
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total: i64,
    pub new: i64,
    pub investigating: i64,
    pub in_progress: i64,
    pub resolved: i64,
}

pub async fn stats(State(state): State<crate::state::AppState>, headers: HeaderMap) -> HttpResult<Json<StatsResponse>> {
    require_session(&state, &headers).await?;
    let stats = error_groups::stats(&state.pool).await?;
    Ok(Json(StatsResponse {
        total: stats.total,
        new: stats.new,
        investigating: stats.investigating,
        in_progress: stats.in_progress,
        resolved: stats.resolved,
    }))
}

pub async fn services(State(state): State<crate::state::AppState>, headers: HeaderMap) -> HttpResult<Json<Vec<String>>> {
    require_session(&state, &headers).await?;
    let services = error_groups::list_services(&state.pool).await?;
    Ok(Json(services))
}

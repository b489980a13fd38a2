use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{ApiError, AppState};
use crate::code::{Code, CodeType, Language};
use crate::codelog::DEFAULT_PAGE_LIMIT;
use crate::coderun::RunFilter;
use crate::coderunner::{InvocationMode, InvocationRequest};
use crate::error::Error;

type ApiResult<T> = Result<T, ApiError>;

/// 503 while any configured backend fails its ping.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let report = state.health.check().await;
    let stats = state.pool.stats();
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": report.status,
            "timestamp": report.timestamp,
            "uptime_secs": report.uptime_secs,
            "services": report.services,
            "workerpool": {
                "workers": stats.workers,
                "busy": stats.busy,
                "queued": stats.queued,
                "capacity": stats.capacity,
            },
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug, Deserialize)]
pub struct CreateCodeRequest {
    pub name: String,
    pub source: String,
    pub language: String,
    #[serde(rename = "type")]
    pub code_type: String,
    pub project_uuid: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub timeout: Option<i64>,
}

pub async fn create_code(
    State(state): State<AppState>,
    Json(req): Json<CreateCodeRequest>,
) -> ApiResult<(StatusCode, Json<Code>)> {
    let code_type: CodeType = req.code_type.parse()?;
    let language: Language = req.language.parse()?;

    let mut code = Code::new(req.name, code_type, language, req.source, req.project_uuid);
    code.url = req.url;
    if let Some(timeout) = req.timeout {
        code.timeout = timeout;
    }

    let code = state.codes.create(code).await?;
    Ok((StatusCode::CREATED, Json(code)))
}

#[derive(Debug, Deserialize)]
pub struct ListCodesQuery {
    #[serde(default)]
    pub project_uuid: String,
    #[serde(rename = "type")]
    pub code_type: Option<String>,
}

pub async fn list_codes(
    State(state): State<AppState>,
    Query(query): Query<ListCodesQuery>,
) -> ApiResult<Json<Vec<Code>>> {
    let code_type = match query.code_type.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<CodeType>()?),
    };
    let codes = state
        .codes
        .list_by_project(&query.project_uuid, code_type)
        .await?;
    Ok(Json(codes))
}

pub async fn get_code(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Code>> {
    Ok(Json(state.codes.get_by_id(&id).await?))
}

pub async fn delete_code(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.codes.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Synchronous invocation; the run result is the response body.
pub async fn action_endpoint(
    State(state): State<AppState>,
    Path(code_id): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request = invocation_request(query, &headers, &body);
    let invocation = state
        .runner
        .invoke_endpoint(&code_id, request, InvocationMode::Sync)
        .await?;

    let run = invocation.run();
    let status = run
        .status_code()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let content_type = match run.response_content_type() {
        "json" => "application/json; charset=UTF-8",
        "html" => "text/html; charset=UTF-8",
        _ => "text/plain; charset=UTF-8",
    };

    Ok((status, [(header::CONTENT_TYPE, content_type)], run.result.clone()).into_response())
}

/// Fire-and-forget invocation.
pub async fn run_code(
    State(state): State<AppState>,
    Path(code_id): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = invocation_request(query, &headers, &body);
    let invocation = state
        .runner
        .invoke(&code_id, request, InvocationMode::Async)
        .await?;

    let run = invocation.run();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "id": run.id,
            "code_id": run.code_id,
            "status": run.status,
        })),
    ))
}

/// First value wins for repeated query keys; header values are kept as lists.
fn invocation_request(query: Vec<(String, String)>, headers: &HeaderMap, body: &Bytes) -> InvocationRequest {
    let mut params = Map::new();
    for (key, value) in query {
        params.entry(key).or_insert(Value::String(value));
    }

    let mut header_map = Map::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let entry = header_map
            .entry(name.as_str().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.to_string()));
        }
    }

    InvocationRequest {
        params,
        body: String::from_utf8_lossy(body).to_string(),
        headers: header_map,
    }
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(state.runs.get_by_id(&id).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub code_id: String,
    pub after: Option<String>,
    pub before: Option<String>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Response> {
    let filter = RunFilter {
        after: parse_time("after", query.after.as_deref())?,
        before: parse_time("before", query.before.as_deref())?,
    };
    let runs = state.runs.list_by_code_id(&query.code_id, filter).await?;
    Ok(Json(runs).into_response())
}

fn parse_time(name: &str, raw: Option<&str>) -> ApiResult<Option<DateTime<Utc>>> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|_| ApiError::bad_request(format!("{} must be an RFC 3339 timestamp", name))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListLogsQuery {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub code_id: String,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<ListLogsQuery>,
) -> ApiResult<Json<Value>> {
    if query.run_id.is_empty() && query.code_id.is_empty() {
        return Err(Error::validation("valid run_id or code_id is required").into());
    }

    let code_id = if query.code_id.is_empty() {
        state.runs.get_by_id(&query.run_id).await?.code_id
    } else {
        query.code_id
    };

    let page = query.page.unwrap_or(1).max(1);
    let limit = match query.limit {
        Some(limit) if limit >= 1 => limit,
        _ => DEFAULT_PAGE_LIMIT,
    };

    let logs = state
        .logs
        .list_run_logs(&query.run_id, &code_id, limit, page)
        .await?;
    let total = state.logs.count(&query.run_id, &code_id).await?;
    let last_page = (total + limit - 1) / limit;

    Ok(Json(json!({
        "data": logs,
        "total": total,
        "page": page,
        "last_page": last_page,
    })))
}

pub async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(state.logs.get_by_id(&id).await?).into_response())
}

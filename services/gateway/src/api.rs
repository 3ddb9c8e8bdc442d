//! Governed account endpoints
//!
//! Every upstream call made here goes through the shared `GovernedClient`,
//! so it is admitted by the account's rate limiter, classified and retried
//! before a response is produced. Typed failures become JSON error bodies:
//! `{"error":{"type":..,"message":..,"request_id":"req_.."}}`.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use governor::{ApiError, FailureKind, PageParams, RemoteDetail, process_batches};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::AppState;

/// Query keys consumed by the gateway rather than forwarded upstream.
const MAX_PAGES_PARAM: &str = "max_pages";
const MAX_ITEMS_PARAM: &str = "max_items";

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// HTTP status for a classified failure. Exhausted retries answer with the
/// status of the kind that kept failing.
pub fn status_for(err: &ApiError) -> StatusCode {
    match err.kind() {
        FailureKind::RateLimit | FailureKind::ApplicationLimit | FailureKind::UserLimit => {
            StatusCode::TOO_MANY_REQUESTS
        }
        FailureKind::Auth => StatusCode::UNAUTHORIZED,
        FailureKind::Permission => StatusCode::FORBIDDEN,
        FailureKind::Validation => StatusCode::BAD_REQUEST,
        FailureKind::Processing => StatusCode::BAD_GATEWAY,
    }
}

/// JSON error response for a classified failure.
pub fn error_response(err: &ApiError, request_id: &str) -> Response {
    let status = status_for(err);
    let mut error = json!({
        "type": err.kind().label(),
        "message": err.to_string(),
        "request_id": request_id,
    });
    let detail = err.detail();
    if let Some(code) = detail.code {
        error["code"] = code.into();
    }
    if let Some(subcode) = detail.subcode {
        error["error_subcode"] = subcode.into();
    }
    if let ApiError::RetriesExhausted { retries, .. } = err {
        error["retries"] = (*retries).into();
    }

    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        json!({ "error": error }).to_string(),
    )
        .into_response();

    if let Some(wait) = err.retry_after() {
        let secs = wait.as_millis().div_ceil(1000);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn invalid_request(message: String) -> ApiError {
    ApiError::Validation {
        message,
        detail: RemoteDetail::default(),
    }
}

fn is_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Upstream path `{account_id}/{edge}`.
///
/// Segments are limited to `[A-Za-z0-9_.-]` and may not be `.` or `..`, so
/// URL resolution can never move the call under another account while the
/// score is charged to this one.
fn account_path(account_id: &str, edge: &str) -> Result<String, ApiError> {
    if !is_path_segment(account_id) {
        return Err(invalid_request(format!("invalid account id {account_id:?}")));
    }
    if !edge.split('/').all(is_path_segment) {
        return Err(invalid_request(format!("invalid edge path {edge:?}")));
    }
    Ok(format!("{account_id}/{edge}"))
}

/// Pull an optional positive ceiling out of the query, capped at `limit`.
fn take_limit(params: &mut PageParams, key: &str, limit: usize) -> Result<usize, ApiError> {
    match params.remove(key) {
        None => Ok(limit),
        Some(raw) => match raw.parse::<usize>() {
            Ok(0) | Err(_) => Err(invalid_request(format!(
                "{key} must be a positive integer, got {raw:?}"
            ))),
            Ok(value) => Ok(value.min(limit)),
        },
    }
}

fn finish(route: &'static str, started: Instant, response: Response) -> Response {
    crate::metrics::record_request(route, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

fn failed(route: &'static str, started: Instant, account_id: &str, err: &ApiError) -> Response {
    let request_id = new_request_id();
    error!(
        request_id = %request_id,
        account_id,
        kind = err.kind().label(),
        status = err.http_status(),
        error = %err,
        "governed request failed"
    );
    finish(route, started, error_response(err, &request_id))
}

/// GET /accounts/{account_id}/usage
pub async fn usage(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    let started = Instant::now();
    let limiter = state.client.limiter();
    let usage = limiter.snapshot(&account_id).await;
    let body = json!({
        "account_id": account_id,
        "tier": limiter.tier(),
        "max_score": limiter.config().max_score,
        "usage": usage,
    });
    finish("usage", started, (StatusCode::OK, Json(body)).into_response())
}

/// DELETE /accounts/{account_id}/usage
pub async fn reset_usage(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    let started = Instant::now();
    let reset = state.client.limiter().reset_account(&account_id).await;
    let body = json!({ "account_id": account_id, "reset": reset });
    finish("usage", started, (StatusCode::OK, Json(body)).into_response())
}

/// GET /accounts/{account_id}/edges/{*path}
///
/// Collects the edge through cursor pagination. `max_pages` and `max_items`
/// may lower the configured ceilings; every other query parameter is
/// forwarded upstream.
pub async fn edges(
    State(state): State<AppState>,
    Path((account_id, edge)): Path<(String, String)>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Response {
    let started = Instant::now();

    let path = match account_path(&account_id, &edge) {
        Ok(path) => path,
        Err(e) => return failed("edges", started, &account_id, &e),
    };
    let limits = take_limit(&mut params, MAX_PAGES_PARAM, state.paging.max_pages).and_then(
        |max_pages| {
            take_limit(&mut params, MAX_ITEMS_PARAM, state.paging.max_items)
                .map(|max_items| (max_pages, max_items))
        },
    );
    let (max_pages, max_items) = match limits {
        Ok(limits) => limits,
        Err(e) => return failed("edges", started, &account_id, &e),
    };

    match state
        .client
        .collect_edge::<Value>(&account_id, &path, params, max_pages, max_items)
        .await
    {
        Ok(data) => {
            info!(
                account_id,
                edge,
                count = data.len(),
                max_pages,
                max_items,
                "edge collected"
            );
            let body = json!({ "count": data.len(), "data": data });
            finish("edges", started, (StatusCode::OK, Json(body)).into_response())
        }
        Err(e) => failed("edges", started, &account_id, &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<Value>,
}

/// POST /accounts/{account_id}/batches/{*path}
///
/// Posts `items` upstream in chunks of `paging.batch_size`, each as
/// `{"data": [...]}`, pausing `paging.batch_delay_ms` between chunks. The
/// first failing chunk stops the run.
pub async fn submit_batches(
    State(state): State<AppState>,
    Path((account_id, edge)): Path<(String, String)>,
    Json(request): Json<BatchRequest>,
) -> Response {
    let started = Instant::now();
    let path = match account_path(&account_id, &edge) {
        Ok(path) => path,
        Err(e) => return failed("batches", started, &account_id, &e),
    };
    let total = request.items.len();

    let client = &state.client;
    let account = account_id.as_str();
    let path = path.as_str();
    let result = process_batches(
        request.items,
        move |batch: Vec<Value>| async move {
            client
                .post_json(account, path, json!({ "data": batch }))
                .await
                .map(|response| vec![response])
        },
        state.paging.batch_size,
        state.paging.batch_delay(),
    )
    .await;

    match result {
        Ok(results) => {
            info!(
                account_id,
                edge,
                items = total,
                batches = results.len(),
                "batches submitted"
            );
            let body = json!({ "batches": results.len(), "results": results });
            finish("batches", started, (StatusCode::OK, Json(body)).into_response())
        }
        Err(e) => failed("batches", started, &account_id, &e),
    }
}

//! Read-only HTTP API over the trace store, consumed by the web UI and
//! external tooling.
//!
//! Each endpoint is a thin axum handler over an inner function that takes
//! plain arguments and returns `Result<Value>`; the inner functions are
//! directly testable without going through axum dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::events::now_ms;
use crate::storage::{ListRunsFilter, RunStatus, TraceStore, MAX_LIST_LIMIT};

const DEFAULT_PAGE_SIZE: usize = 20;
const RATE_WINDOW_SECS: u64 = 60;

#[derive(Clone)]
pub struct ApiState {
    pub store: TraceStore,
    pub config: Arc<TraceConfig>,
    /// Fixed-window request counter per client IP.
    rate: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
}

impl ApiState {
    pub fn new(store: TraceStore, config: TraceConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            rate: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/runs", get(list_runs_handler))
        .route("/runs/:run_id", get(get_run_handler))
        .route("/runs/:run_id/steps", get(get_steps_handler))
        .route("/runs/:run_id/timeline", get(get_timeline_handler))
        .route("/runs/:run_id/steps/:step_id/data", get(get_step_data_handler))
        .route("/runs/:run_id/export", get(export_run_handler))
        .route("/stats", get(stats_handler))
        .layer(middleware::from_fn_with_state(state.clone(), guard_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(middleware::from_fn_with_state(state.clone(), cors_middleware))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: ApiState) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.api_host, state.config.api_port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{addr}");
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Rate limiting plus optional API-key auth for the `/v1` surface.
async fn guard_middleware(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let client_ip = addr.ip().to_string();

    {
        let mut rate = state.rate.lock().await;
        if let Some(retry_after) = note_request(
            &mut rate,
            &client_ip,
            state.config.api_rate_limit_per_min,
            Instant::now(),
        ) {
            warn!(ip = %client_ip, "rate limited");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                Json(json!({"error": "too many requests"})),
            )
                .into_response();
        }
    }

    if state.config.api_key_required {
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let expected = state.config.api_key.as_deref().unwrap_or("");
        if presented.is_empty() || !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!(ip = %client_ip, "rejected request with missing or bad API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid or missing API key"})),
            )
                .into_response();
        }
    }

    next.run(request).await
}

async fn cors_middleware(
    State(state): State<ApiState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let preflight = request.method() == &axum::http::Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(origin) = state.config.api_cors_origins.first() {
        let headers = response.headers_mut();
        if let Ok(value) = origin.parse() {
            headers.insert("Access-Control-Allow-Origin", value);
            headers.insert(
                "Access-Control-Allow-Headers",
                "Content-Type, X-API-Key".parse().unwrap(),
            );
            headers.insert("Access-Control-Allow-Methods", "GET, OPTIONS".parse().unwrap());
        }
    }
    response
}

/// Record a request in the fixed window; `Some(retry_after_secs)` when the
/// caller is over the limit.
fn note_request(
    rate: &mut HashMap<String, (u32, Instant)>,
    ip: &str,
    limit_per_min: u32,
    now: Instant,
) -> Option<u64> {
    if limit_per_min == 0 {
        return None;
    }
    let entry = rate.entry(ip.to_string()).or_insert((0, now));
    let elapsed = now.duration_since(entry.1).as_secs();
    if elapsed >= RATE_WINDOW_SECS {
        *entry = (0, now);
    }
    entry.0 += 1;
    if entry.0 > limit_per_min {
        Some(RATE_WINDOW_SECS.saturating_sub(now.duration_since(entry.1).as_secs()).max(1))
    } else {
        None
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn error_response(e: TraceError) -> Response {
    let (status, message) = match &e {
        TraceError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        TraceError::Config(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        TraceError::Decode(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("stored data could not be decoded: {msg}"),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        ),
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("request failed: {e}");
    }
    (status, Json(json!({"error": message}))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<ApiState>) -> Response {
    let body = health_inner(&state.store).await;
    let status = if body["database"] == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn health_inner(store: &TraceStore) -> Value {
    let database = match store.ping().await {
        Ok(()) => "ok",
        Err(_) => "down",
    };
    json!({
        "status": if database == "ok" { "healthy" } else { "unhealthy" },
        "timestamp": now_ms(),
        "database": database,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub search: Option<String>,
    pub started_after: Option<i64>,
    pub started_before: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub page: Option<usize>,
}

async fn list_runs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    match list_runs_inner(&state.store, query).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_runs_inner(store: &TraceStore, query: ListRunsQuery) -> Result<Value> {
    let status = match &query.status {
        Some(raw) => Some(RunStatus::parse(raw).ok_or_else(|| {
            TraceError::config(format!("unknown status filter '{raw}'"))
        })?),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_LIST_LIMIT);
    let offset = match (query.offset, query.page) {
        (Some(offset), _) => offset,
        (None, Some(page)) => page.saturating_sub(1) * limit,
        (None, None) => 0,
    };

    let filter = ListRunsFilter {
        status,
        user_id: query.user_id,
        session_id: query.session_id,
        search: query.search,
        started_after: query.started_after,
        started_before: query.started_before,
        limit,
        offset,
    };
    let (runs, total) = store.list_runs(&filter).await?;
    Ok(json!({
        "runs": runs,
        "total": total,
        "page": offset / limit + 1,
        "page_size": limit,
    }))
}

async fn get_run_handler(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.get_run(&run_id).await {
        Ok(detail) => Json(serde_json::to_value(detail).unwrap_or_default()).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StepsQuery {
    pub event_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn get_steps_handler(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    Query(query): Query<StepsQuery>,
) -> Response {
    match get_steps_inner(&state.store, &run_id, query).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_steps_inner(store: &TraceStore, run_id: &str, query: StepsQuery) -> Result<Value> {
    let steps = store
        .get_steps(
            run_id,
            query.event_type.as_deref(),
            query.limit,
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(json!({
        "run_id": run_id,
        "total": steps.len(),
        "steps": steps,
    }))
}

async fn get_timeline_handler(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.get_timeline(&run_id).await {
        Ok(timeline) => Json(json!({
            "run_id": run_id,
            "total": timeline.len(),
            "events": timeline,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_step_data_handler(
    State(state): State<ApiState>,
    Path((run_id, step_id)): Path<(String, i64)>,
) -> Response {
    match state.store.get_step_data(&run_id, step_id).await {
        Ok(data) => Json(json!({"step_id": step_id, "data": data})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn export_run_handler(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.export_run(&run_id).await {
        Ok(export) => Json(serde_json::to_value(export).unwrap_or_default()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stats_handler(State(state): State<ApiState>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(serde_json::to_value(stats).unwrap_or_default()).into_response(),
        Err(e) => error_response(e),
    }
}

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use cloudhop_contract::MigrationRequest;
use cloudhop_storage::RunStatus;
use cloudhop_workflow::{MigrationRuntime, RunEvent};
use futures::stream::StreamExt;
use http::{header, HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub http_bind: String,
    pub http_auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseUpdate {
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub since: Option<String>,
    pub level: Option<String>,
    pub contains: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubmitMigration {
    run_id: Option<String>,
    request: MigrationRequest,
}

#[derive(Debug, Default, Deserialize)]
struct ResumeMigration {
    /// Replaces the stored request when present.
    #[serde(default)]
    request: Option<MigrationRequest>,
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: MigrationRuntime,
    pub settings: Arc<ControlSettings>,
    pub sse_bus: broadcast::Sender<SseUpdate>,
    pub log_buffer: Arc<RwLock<Vec<LogLine>>>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(runtime: MigrationRuntime, settings: ControlSettings, require_bearer: bool) -> Self {
        let (sse_bus, _) = broadcast::channel(256);
        Self {
            runtime,
            settings: Arc::new(settings),
            sse_bus,
            log_buffer: Arc::new(RwLock::new(Vec::new())),
            require_bearer,
        }
    }

    /// Republishes workflow events on the SSE bus and in the log buffer.
    pub fn spawn_event_relay(&self) -> JoinHandle<()> {
        let state = self.clone();
        let mut events = self.runtime.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => relay(&state, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        write_log(&state, "warn", &format!("event relay skipped {skipped} events")).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/v1/migrations", get(list_migrations).post(submit_migration))
        .route("/v1/migrations/{run_id}", get(get_migration))
        .route("/v1/migrations/{run_id}/state", get(get_migration_state))
        .route("/v1/migrations/{run_id}/resume", post(resume_migration))
        .route("/v1/logs", get(get_logs))
        .route("/v1/logs/stream", get(stream_logs))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn list_migrations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let limit = query.limit.unwrap_or(100);
    let runs = state
        .runtime
        .storage()
        .list_runs(limit)
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::OK, Json(json!({ "items": runs }))))
}

async fn submit_migration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitMigration>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers, true)?;

    let run = state
        .runtime
        .submit(&payload.request, payload.run_id.as_deref())
        .await
        .map_err(internal_error)?;
    write_log(
        &state,
        "info",
        &format!("migration {} submitted for instance {}", run.run_id, run.instance_name),
    )
    .await;

    start_run(&state, run.run_id.clone(), None);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run.run_id.clone(),
            "submitted_at": run.submitted_at,
            "status_url": format!("/v1/migrations/{}", run.run_id)
        })),
    ))
}

async fn get_migration(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let run = state
        .runtime
        .storage()
        .get_run(&run_id)
        .await
        .map_err(internal_error)?;
    match run {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(not_found("run_not_found")),
    }
}

async fn get_migration_state(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let checkpoint = state
        .runtime
        .storage()
        .load_checkpoint(&run_id)
        .await
        .map_err(internal_error)?;
    match checkpoint {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(not_found("checkpoint_not_found")),
    }
}

async fn resume_migration(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ResumeMigration>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers, true)?;

    let run = state
        .runtime
        .storage()
        .get_run(&run_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("run_not_found"))?;
    if !resumable(&run.status) {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"error":"run_in_progress"})),
        ));
    }

    write_log(&state, "info", &format!("migration {run_id} resumed")).await;
    start_run(&state, run_id.clone(), payload.request);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id.clone(),
            "status_url": format!("/v1/migrations/{}", run_id)
        })),
    ))
}

/// Queued runs already have an executor on the way; running ones hold it.
fn resumable(status: &str) -> bool {
    status != RunStatus::Queued.as_str() && status != RunStatus::Running.as_str()
}

fn start_run(state: &AppState, run_id: String, supplied: Option<MigrationRequest>) {
    let state_for_task = state.clone();
    tokio::spawn(async move {
        match state_for_task.runtime.execute(&run_id, supplied).await {
            Ok(instance) => {
                write_log(
                    &state_for_task,
                    "info",
                    &format!("migration {run_id} finished as instance {}", instance.id),
                )
                .await;
            }
            Err(err) => {
                error!(run_id = %run_id, error = %format!("{err:#}"), "migration failed");
                write_log(&state_for_task, "error", &format!("migration {run_id} failed: {err:#}"))
                    .await;
            }
        }
    });
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let logs = state.log_buffer.read().await;
    Json(json!({ "items": filter_logs(&logs, &query) }))
}

fn filter_logs(logs: &[LogLine], query: &LogQuery) -> Vec<LogLine> {
    let limit = query.limit.unwrap_or(200);
    let level_filter = query.level.as_deref().map(str::to_ascii_lowercase);

    let mut items: Vec<LogLine> = logs
        .iter()
        .filter(|entry| {
            if let Some(level) = &level_filter {
                if entry.level.to_ascii_lowercase() != *level {
                    return false;
                }
            }
            if let Some(needle) = &query.contains {
                if !entry.message.contains(needle.as_str()) {
                    return false;
                }
            }
            if let Some(since) = &query.since {
                if entry.timestamp < *since {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    if items.len() > limit {
        let start = items.len() - limit;
        items = items.split_off(start);
    }
    items
}

async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.sse_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(update) => {
                let data = serde_json::to_string(&update.data).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(update.event_type).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    write_operation: bool,
) -> Result<(), (StatusCode, Json<Value>)> {
    if !write_operation || !state.require_bearer {
        return Ok(());
    }

    let token = state.settings.http_auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == format!("Bearer {token}") {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn not_found(code: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": code })))
}

fn internal_error(error: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}

async fn relay(state: &AppState, event: RunEvent) {
    let message = match &event {
        RunEvent::StatusChanged { run_id, status, reason } => match reason {
            Some(reason) => format!("run {run_id} is {status}: {reason}"),
            None => format!("run {run_id} is {status}"),
        },
        RunEvent::StepCompleted { run_id, step } => format!("run {run_id} completed {step}"),
        RunEvent::StepFailed { run_id, step, error } => {
            format!("run {run_id} failed at {step}: {error}")
        }
    };
    let level = match &event {
        RunEvent::StepFailed { .. } => "error",
        _ => "info",
    };
    write_log(state, level, &message).await;

    let data = serde_json::to_value(&event).unwrap_or_else(|_| json!({ "run_id": event.run_id() }));
    let _ = state.sse_bus.send(SseUpdate {
        event_type: event.kind().to_string(),
        data,
    });
}

async fn write_log(state: &AppState, level: &str, message: &str) {
    info!(level = %level, message = %message, "control-plane log entry");
    let mut buffer = state.log_buffer.write().await;
    buffer.push(LogLine {
        timestamp: Utc::now().to_rfc3339(),
        level: level.to_string(),
        message: message.to_string(),
    });

    if buffer.len() > LOG_CAPACITY {
        let keep_start = buffer.len() - LOG_CAPACITY;
        let trimmed = buffer.split_off(keep_start);
        *buffer = trimmed;
    }
}

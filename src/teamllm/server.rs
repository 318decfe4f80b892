//! HTTP API surface.
//!
//! Exposes the execution engine over axum (enable the `server` feature):
//! team registration, execution start/status/stop/list, Server-Sent-Event
//! streaming, and result retrieval/formatting. Every response uses the
//! `{ success, code, message, data? }` envelope with a stable machine
//! code per outcome.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/api/v1/executions/health` | Liveness probe |
//! | POST | `/api/v1/hierarchical-teams` | Validate + register a team spec |
//! | POST | `/api/v1/hierarchical-teams/{team_id}/execute` | Start an execution |
//! | GET | `/api/v1/executions/{execution_id}` | Status and progress |
//! | DELETE | `/api/v1/executions/{execution_id}` | Stop (graceful by default) |
//! | GET | `/api/v1/executions` | Paginated listing |
//! | GET | `/api/v1/executions/{execution_id}/stream` | SSE event stream |
//! | GET | `/api/v1/executions/{execution_id}/results` | StandardizedOutput |
//! | POST | `/api/v1/executions/{execution_id}/results/format` | Template formatting |
//!
//! Id shapes are validated before the store is touched: execution ids are
//! `exec_` + 12 alphanumerics (length 17), team ids `ht_` + 9 hex (length
//! 12); a malformed id is a 404.

use crate::teamllm::config::{ExecutionConfig, HierarchicalTeam};
use crate::teamllm::engine::ExecutionEngine;
use crate::teamllm::event_bus::{EventBus, EventSubscriber};
use crate::teamllm::formatter::OutputFormatter;
use crate::teamllm::model::ExecutionStatus;
use crate::teamllm::state_store::StateStore;
use crate::teamllm::team_builder::TeamBuilder;
use crate::teamllm::template::{TemplateError, TemplateProcessor};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shared state behind every handler.
pub struct ServerState {
    /// The engine running sessions.
    pub engine: ExecutionEngine,
    /// The store handlers read execution state from.
    pub store: StateStore,
    /// The bus SSE handlers subscribe to.
    pub bus: EventBus,
    /// Validates and builds registered team specs.
    pub builder: TeamBuilder,
    /// Registered team definitions keyed by `ht_` team id.
    pub teams: RwLock<HashMap<String, HierarchicalTeam>>,
}

impl ServerState {
    /// Assemble server state around an engine and a team builder. The store
    /// and bus handles are taken from the engine.
    pub fn new(engine: ExecutionEngine, builder: TeamBuilder) -> Self {
        let store = engine.store().clone();
        let bus = engine.bus().clone();
        Self {
            engine,
            store,
            bus,
            builder,
            teams: RwLock::new(HashMap::new()),
        }
    }
}

/// Handler-shared state alias.
pub type SharedState = Arc<ServerState>;

/// Build the API router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/executions/health", get(health_check))
        .route("/api/v1/hierarchical-teams", post(create_team))
        .route(
            "/api/v1/hierarchical-teams/{team_id}/execute",
            post(execute_team),
        )
        .route("/api/v1/executions", get(list_executions))
        .route("/api/v1/executions/{execution_id}", get(get_execution_status))
        .route("/api/v1/executions/{execution_id}", delete(stop_execution))
        .route(
            "/api/v1/executions/{execution_id}/stream",
            get(stream_execution_events),
        )
        .route(
            "/api/v1/executions/{execution_id}/results",
            get(get_execution_results),
        )
        .route(
            "/api/v1/executions/{execution_id}/results/format",
            post(format_execution_results),
        )
        .with_state(state)
}

/// Bind `addr` and serve the API on a background task. Returns the bound
/// address (useful with port 0) and the server task handle.
pub async fn start_server(
    state: SharedState,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            log::error!("HTTP server error: {}", err);
        }
    });
    log::info!("API listening on {}", addr);
    Ok((addr, handle))
}

// ── Envelope helpers ────────────────────────────────────────────────────

fn envelope(success: bool, code: &str, message: &str, data: Option<Value>) -> Value {
    let mut body = json!({
        "success": success,
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        body["data"] = data;
    }
    body
}

fn ok_response(code: &str, message: &str, data: Value) -> Response {
    (StatusCode::OK, Json(envelope(true, code, message, Some(data)))).into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str, detail: &str) -> Response {
    let mut body = envelope(false, code, message, None);
    body["detail"] = Value::String(detail.to_string());
    (status, Json(body)).into_response()
}

fn not_found_execution(execution_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "EXECUTION_NOT_FOUND",
        "Execution not found",
        &format!("Execution with ID '{}' not found", execution_id),
    )
}

fn valid_execution_id(execution_id: &str) -> bool {
    execution_id.len() == 17
        && execution_id.starts_with("exec_")
        && execution_id[5..].chars().all(|c| c.is_ascii_alphanumeric())
}

fn valid_team_id(team_id: &str) -> bool {
    team_id.len() == 12
        && team_id.starts_with("ht_")
        && team_id[3..].chars().all(|c| c.is_ascii_alphanumeric())
}

fn generate_team_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("ht_{}", &hex[..9])
}

fn iso_z(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health_check() -> Response {
    ok_response(
        "HEALTHY",
        "Executions API is healthy",
        json!({
            "status": "healthy",
            "timestamp": iso_z(Utc::now()),
            "version": env!("CARGO_PKG_VERSION"),
            "components": {
                "engine": "initialized",
                "state_store": "initialized",
            }
        }),
    )
}

/// Parse a request body as JSON, treating an empty body as `{}`.
fn parse_body(body: &Bytes) -> Result<Value, Response> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "Invalid request",
            &format!("Request body must be valid JSON: {}", err),
        )
    })
}

async fn create_team(State(state): State<SharedState>, body: Bytes) -> Response {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let team: HierarchicalTeam = match serde_json::from_value(body) {
        Ok(team) => team,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "TEAM_BUILD_ERROR",
                "Team build failed",
                &format!("Invalid team definition: {}", err),
            )
        }
    };

    if let Err(err) = state.builder.validate(&team) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "TEAM_BUILD_ERROR",
            "Team build failed",
            &err.to_string(),
        );
    }

    let team_id = generate_team_id();
    let team_name = team.team_name.clone();
    state.teams.write().await.insert(team_id.clone(), team);
    log::info!("Registered team '{}' as {}", team_name, team_id);

    ok_response(
        "TEAM_CREATED",
        "Team created",
        json!({
            "team_id": team_id,
            "team_name": team_name,
            "created_at": iso_z(Utc::now()),
        }),
    )
}

async fn execute_team(
    State(state): State<SharedState>,
    Path(team_id): Path<String>,
    body: Bytes,
) -> Response {
    if !valid_team_id(&team_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "TEAM_NOT_FOUND",
            "Team not found",
            &format!("Invalid team ID format: {}", team_id),
        );
    }

    let team = match state.teams.read().await.get(&team_id).cloned() {
        Some(team) => team,
        None => {
            return error_response(
                StatusCode::NOT_FOUND,
                "TEAM_NOT_FOUND",
                "Team not found",
                &format!("Team with ID '{}' not found", team_id),
            )
        }
    };

    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let config_value = body
        .get("execution_config")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let execution_config: ExecutionConfig = match serde_json::from_value(config_value) {
        Ok(config) => config,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "Invalid request",
                &format!("Invalid execution configuration: {}", err),
            )
        }
    };
    if let Err(err) = execution_config.validate() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "Invalid request",
            &format!("Invalid execution configuration: {}", err),
        );
    }

    let built = match state.builder.build(team) {
        Ok(built) => Arc::new(built),
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "TEAM_BUILD_ERROR",
                "Team build failed",
                &err.to_string(),
            )
        }
    };

    let session = match state
        .engine
        .start_execution(built, &team_id, execution_config)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            log::error!("Failed to start execution for team {}: {}", team_id, err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                "Failed to start execution",
                "Failed to start execution",
            );
        }
    };

    let data = json!({
        "execution_id": session.execution_id,
        "team_id": team_id,
        "status": "started",
        "started_at": iso_z(session.started_at()),
        "stream_url": format!("/api/v1/executions/{}/stream", session.execution_id),
        "estimated_duration": state.engine.config().estimated_duration_secs,
    });
    (
        StatusCode::ACCEPTED,
        Json(envelope(true, "EXECUTION_STARTED", "Execution started", Some(data))),
    )
        .into_response()
}

async fn get_execution_status(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> Response {
    if !valid_execution_id(&execution_id) {
        return not_found_execution(&execution_id);
    }

    let execution_state = match state.store.get_execution_state(&execution_id).await {
        Ok(Some(execution_state)) => execution_state,
        Ok(None) => return not_found_execution(&execution_id),
        Err(err) => {
            log::error!("Failed to read execution state: {}", err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to retrieve execution status",
            );
        }
    };

    let total_teams = execution_state.team_states.len().max(1);
    let completed_teams = execution_state
        .team_states
        .values()
        .filter(|team_state| team_state.execution_status.is_terminal())
        .count();
    let progress = (completed_teams * 100 / total_teams).min(100) as u64;

    let current_team = execution_state
        .team_states
        .values()
        .find(|team_state| team_state.execution_status == ExecutionStatus::Running)
        .map(|team_state| team_state.team_id.clone());

    let estimated_completion = if execution_state.status == ExecutionStatus::Running && progress > 0
    {
        let elapsed = (Utc::now() - execution_state.created_at).num_seconds().max(0);
        let estimated_total = elapsed * 100 / progress as i64;
        Some(iso_z(
            execution_state.created_at + chrono::Duration::seconds(estimated_total),
        ))
    } else {
        None
    };

    let mut data = json!({
        "execution_id": execution_id,
        "team_id": execution_state.team_id,
        "status": execution_state.status.as_str(),
        "started_at": iso_z(execution_state.created_at),
        "progress": progress,
        "current_team": current_team,
        "teams_completed": completed_teams,
        "total_teams": total_teams,
        "estimated_completion": estimated_completion,
    });
    if execution_state.status.is_terminal() {
        data["completed_at"] = Value::String(iso_z(execution_state.updated_at));
        data["duration"] = Value::from(
            (execution_state.updated_at - execution_state.created_at)
                .num_seconds()
                .max(0),
        );
    }

    ok_response("EXECUTION_FOUND", "Execution status retrieved", data)
}

async fn stop_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !valid_execution_id(&execution_id) {
        return not_found_execution(&execution_id);
    }
    let graceful = params
        .get("graceful")
        .map(|value| value != "false")
        .unwrap_or(true);

    if !state.engine.stop_execution(&execution_id, graceful).await {
        return error_response(
            StatusCode::NOT_FOUND,
            "EXECUTION_NOT_FOUND",
            "Execution not found",
            &format!(
                "Execution with ID '{}' not found or already stopped",
                execution_id
            ),
        );
    }
    (
        StatusCode::OK,
        Json(envelope(true, "EXECUTION_STOPPED", "Execution stopped", None)),
    )
        .into_response()
}

async fn list_executions(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let page = params
        .get("page")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);
    let page_size = params
        .get("page_size")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(10)
        .clamp(1, 100);
    let team_id = params.get("team_id").map(|s| s.as_str());

    let status_filter = match params.get("execution_status") {
        Some(raw) => match ExecutionStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_PARAMETER",
                    "Invalid parameter",
                    &format!("Invalid status: {}", raw),
                )
            }
        },
        None => None,
    };

    let execution_ids = match state
        .store
        .list_executions(team_id, status_filter, page_size * 10)
        .await
    {
        Ok(ids) => ids,
        Err(err) => {
            log::error!("Failed to list executions: {}", err);
            Vec::new()
        }
    };

    let start = (page - 1) * page_size;
    let mut executions = Vec::new();
    for execution_id in execution_ids.iter().skip(start).take(page_size) {
        let execution_state = match state.store.get_execution_state(execution_id).await {
            Ok(Some(execution_state)) => execution_state,
            _ => continue,
        };
        let mut info = json!({
            "execution_id": execution_id,
            "team_id": execution_state.team_id,
            "status": execution_state.status.as_str(),
            "started_at": iso_z(execution_state.created_at),
        });
        if execution_state.status.is_terminal() {
            info["completed_at"] = Value::String(iso_z(execution_state.updated_at));
            info["duration"] = Value::from(
                (execution_state.updated_at - execution_state.created_at)
                    .num_seconds()
                    .max(0),
            );
        }
        executions.push(info);
    }

    ok_response(
        "EXECUTIONS_LISTED",
        "Executions listed",
        json!({
            "executions": executions,
            "total_count": execution_ids.len(),
            "page": page,
            "page_size": page_size,
        }),
    )
}

/// Per-connection state for the SSE generator.
struct SseStreamCtx {
    subscriber: EventSubscriber,
    finished: bool,
}

async fn stream_execution_events(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
) -> Response {
    if !valid_execution_id(&execution_id) {
        return not_found_execution(&execution_id);
    }
    match state.store.get_execution_state(&execution_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found_execution(&execution_id),
        Err(err) => {
            log::error!("Failed to check execution before streaming: {}", err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to establish event stream",
            );
        }
    }

    // The subscriber replays the buffered events first, then live events.
    let subscriber = match state.bus.subscribe(Some(&execution_id)).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            log::warn!("SSE subscription rejected for {}: {}", execution_id, err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                &err.to_string(),
            );
        }
    };

    let stream_execution_id = execution_id.clone();
    let ctx = SseStreamCtx {
        subscriber,
        finished: false,
    };
    let stream = futures_util::stream::unfold(ctx, move |mut ctx| {
        let execution_id = stream_execution_id.clone();
        async move {
            if ctx.finished {
                return None;
            }
            match ctx.subscriber.recv().await {
                Some(event) => {
                    if event.event_type == "execution_completed" {
                        ctx.finished = true;
                    }
                    let frame = format!(
                        "event: {}\ndata: {}\n\n",
                        event.event_type,
                        event.to_sse_json()
                    );
                    Some((Ok::<Bytes, Infallible>(Bytes::from(frame)), ctx))
                }
                None => {
                    // The subscriber was closed under us: emit a terminal
                    // stream_error frame, then end. The stream never closes
                    // silently.
                    ctx.finished = true;
                    let error_payload = json!({
                        "timestamp": iso_z(Utc::now()),
                        "event_type": "stream_error",
                        "source_type": "system",
                        "execution_id": execution_id,
                        "content": "Event stream encountered an error",
                        "status": "error",
                    });
                    let frame = format!("event: stream_error\ndata: {}\n\n", error_payload);
                    Some((Ok::<Bytes, Infallible>(Bytes::from(frame)), ctx))
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Cache-Control")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| {
            log::error!("Failed to build SSE response: {}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to establish event stream",
            )
        })
}

async fn get_execution_results(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !valid_execution_id(&execution_id) {
        return not_found_execution(&execution_id);
    }
    let format = params.get("format").map(|s| s.as_str()).unwrap_or("json");
    if !matches!(format, "json" | "xml" | "markdown") {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_FORMAT",
            "Invalid format",
            &format!(
                "Unsupported format: {}. Supported formats: json, xml, markdown",
                format
            ),
        );
    }

    let execution_state = match state.store.get_execution_state(&execution_id).await {
        Ok(Some(execution_state)) => execution_state,
        Ok(None) => return not_found_execution(&execution_id),
        Err(err) => {
            log::error!("Failed to read execution state: {}", err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to retrieve execution results",
            );
        }
    };

    if !execution_state.status.is_terminal() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "EXECUTION_NOT_COMPLETED",
            "Execution not completed",
            &format!(
                "Execution is in '{}' status. Results are only available for completed executions.",
                execution_state.status
            ),
        );
    }

    let output = OutputFormatter::new().format_state(&execution_state);
    match serde_json::to_value(&output) {
        Ok(data) => ok_response("RESULTS_RETRIEVED", "Execution results retrieved", data),
        Err(err) => {
            log::error!("Failed to serialize results: {}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to retrieve execution results",
            )
        }
    }
}

async fn format_execution_results(
    State(state): State<SharedState>,
    Path(execution_id): Path<String>,
    body: Bytes,
) -> Response {
    if !valid_execution_id(&execution_id) {
        return not_found_execution(&execution_id);
    }

    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let output_template = match body.get("output_template") {
        Some(template) if !template.is_null() => template.clone(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_TEMPLATE",
                "Missing template",
                "output_template is required",
            )
        }
    };
    let extraction_rules = match body.get("extraction_rules") {
        Some(rules) if !rules.is_null() => rules.clone(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_RULES",
                "Missing extraction rules",
                "extraction_rules is required",
            )
        }
    };

    let execution_state = match state.store.get_execution_state(&execution_id).await {
        Ok(Some(execution_state)) => execution_state,
        Ok(None) => return not_found_execution(&execution_id),
        Err(err) => {
            log::error!("Failed to read execution state: {}", err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
                "Failed to format execution results",
            );
        }
    };
    if !execution_state.status.is_terminal() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "EXECUTION_NOT_COMPLETED",
            "Execution not completed",
            &format!(
                "Execution is in '{}' status. Formatting is only available for completed executions.",
                execution_state.status
            ),
        );
    }

    let results = OutputFormatter::new().format_state(&execution_state);
    let processor = TemplateProcessor::new();
    match processor.process(&output_template, &extraction_rules, &results) {
        Ok(formatted) => ok_response(
            "FORMATTED_RESULTS_GENERATED",
            "Formatted results generated",
            formatted,
        ),
        Err(err) => {
            let (code, message) = match &err {
                TemplateError::InvalidTemplate(_) => ("INVALID_TEMPLATE", "Invalid template"),
                TemplateError::InvalidRules(_) => ("INVALID_RULES", "Invalid extraction rules"),
                TemplateError::Extraction(_) => ("EXTRACTION_ERROR", "Information extraction failed"),
            };
            error_response(StatusCode::BAD_REQUEST, code, message, &err.to_string())
        }
    }
}

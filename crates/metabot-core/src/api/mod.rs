//! HTTP control plane.
//!
//! Thin stateless layer over the registry, the bridges, and the scheduler.
//! With a shared secret configured every route requires
//! `Authorization: Bearer <secret>` and the server may bind publicly;
//! without one it binds loopback only.

#[cfg(test)]
mod tests;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::ApiTaskOptions;
use crate::config::{load_bots_file, save_bots_file, BotConfig};
use crate::cost::CostTracker;
use crate::metrics::Metrics;
use crate::registry::BotRegistry;
use crate::scheduler::{
    ScheduleRecurringRequest, ScheduleTaskRequest, SchedulerError, TaskScheduler,
    UpdateRecurringRequest, UpdateTaskRequest,
};

/// Request body cap.
const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<BotRegistry>,
    pub scheduler: TaskScheduler,
    pub costs: Arc<CostTracker>,
    pub metrics: Arc<Metrics>,
    pub secret: Option<String>,
    pub bots_file: Option<PathBuf>,
    pub started_at: Instant,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/bots", get(list_bots).post(create_bot))
        .route("/api/bots/:name", get(get_bot).delete(delete_bot))
        .route("/api/tasks", post(run_task))
        .route("/api/schedule", get(list_schedule).post(create_schedule))
        .route(
            "/api/schedule/:id",
            axum::routing::patch(update_schedule).delete(delete_schedule),
        )
        .route("/api/schedule/:id/pause", post(pause_schedule))
        .route("/api/schedule/:id/resume", post(resume_schedule))
        .route("/api/stats", get(stats))
        .route("/api/metrics", get(metrics_text))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

/// Serve until `cancel` fires. Binds loopback unless a secret is set.
pub async fn serve(state: ApiState, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let host = if state.secret.is_some() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Control API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn auth(
    State(state): State<ApiState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(secret) = &state.secret {
        let expected = format!("Bearer {secret}");
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    next.run(req).await
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({"error": message.to_string()}))).into_response()
}

fn scheduler_error(err: SchedulerError) -> Response {
    match err {
        SchedulerError::TaskNotFound(_) => error_response(StatusCode::NOT_FOUND, err),
        _ => error_response(StatusCode::BAD_REQUEST, err),
    }
}

/// Unpack a JSON body. Malformed payloads become a plain 400; the body
/// size limit keeps its 413.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            Err(error_response(status, rejection.body_text()))
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "bots": state.registry.len(),
        "scheduledTasks": state.scheduler.task_count(),
    }))
}

async fn list_bots(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({"bots": state.registry.list()}))
}

async fn create_bot(
    State(state): State<ApiState>,
    payload: Result<Json<BotConfig>, JsonRejection>,
) -> Response {
    let bot = match body(payload) {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let Some(bots_file) = &state.bots_file else {
        return error_response(StatusCode::BAD_REQUEST, "bot management is disabled (no bots file)");
    };

    let mut bots = load_bots_file(bots_file).unwrap_or_default();
    if bots.iter().any(|b| b.name == bot.name) || state.registry.get(&bot.name).is_some() {
        return error_response(StatusCode::CONFLICT, format!("bot {} already exists", bot.name));
    }

    let name = bot.name.clone();
    bots.push(bot);
    if let Err(e) = save_bots_file(bots_file, &bots) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    info!(name, "Bot added to config; it activates on the next restart");
    (
        StatusCode::CREATED,
        Json(json!({"name": name, "note": "bot registers on next restart"})),
    )
        .into_response()
}

async fn get_bot(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let registered = state.registry.get(&name);
    let configured = state
        .bots_file
        .as_ref()
        .and_then(|path| load_bots_file(path).ok())
        .and_then(|bots| bots.into_iter().find(|b| b.name == name));

    if registered.is_none() && configured.is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("bot {name} not found"));
    }

    let mut details = json!({"name": name, "registered": registered.is_some()});
    if let Some(bot) = &registered {
        details["platform"] = json!(bot.platform);
        details["workingDirectory"] = json!(bot.config.default_working_directory);
        details["allowedTools"] = json!(bot.config.allowed_tools);
    }
    if let Some(config) = configured {
        details["model"] = json!(config.model);
        details["maxTurns"] = json!(config.max_turns);
        details["authorizedUserIds"] = json!(config.authorized_user_ids);
        details["authorizedChatIds"] = json!(config.authorized_chat_ids);
    }
    Json(details).into_response()
}

async fn delete_bot(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let Some(bots_file) = &state.bots_file else {
        return error_response(StatusCode::BAD_REQUEST, "bot management is disabled (no bots file)");
    };
    let mut bots = load_bots_file(bots_file).unwrap_or_default();
    let before = bots.len();
    bots.retain(|b| b.name != name);
    if bots.len() == before && state.registry.get(&name).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("bot {name} not found"));
    }
    if bots.is_empty() && state.registry.len() <= 1 {
        return error_response(StatusCode::BAD_REQUEST, "cannot remove the last bot");
    }
    if let Err(e) = save_bots_file(bots_file, &bots) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    state.registry.deregister(&name);
    Json(json!({"deleted": name})).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunTaskBody {
    bot_name: String,
    chat_id: String,
    prompt: String,
    #[serde(default)]
    send_cards: bool,
}

async fn run_task(
    State(state): State<ApiState>,
    payload: Result<Json<RunTaskBody>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }
    let Some(bot) = state.registry.get(&req.bot_name) else {
        return error_response(StatusCode::NOT_FOUND, format!("bot {} not found", req.bot_name));
    };

    let result = bot
        .bridge
        .clone()
        .execute_api_task(ApiTaskOptions {
            prompt: req.prompt,
            chat_id: req.chat_id,
            user_id: "api".into(),
            send_cards: req.send_cards,
        })
        .await;

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleBody {
    bot_name: String,
    chat_id: String,
    prompt: String,
    delay_seconds: Option<i64>,
    cron_expr: Option<String>,
    timezone: Option<String>,
    #[serde(default = "default_send_cards")]
    send_cards: bool,
    label: Option<String>,
}

fn default_send_cards() -> bool {
    true
}

async fn create_schedule(
    State(state): State<ApiState>,
    payload: Result<Json<ScheduleBody>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }

    match (req.cron_expr, req.delay_seconds) {
        (Some(cron_expr), _) => {
            match state.scheduler.schedule_recurring(ScheduleRecurringRequest {
                bot_name: req.bot_name,
                chat_id: req.chat_id,
                prompt: req.prompt,
                cron_expr,
                timezone: req.timezone,
                send_cards: req.send_cards,
                label: req.label,
            }) {
                Ok(task) => (StatusCode::CREATED, Json(json!({"recurring": task}))).into_response(),
                Err(e) => scheduler_error(e),
            }
        }
        (None, Some(delay_seconds)) => {
            if delay_seconds <= 0 {
                return error_response(StatusCode::BAD_REQUEST, "delaySeconds must be positive");
            }
            let task = state.scheduler.schedule_task(ScheduleTaskRequest {
                bot_name: req.bot_name,
                chat_id: req.chat_id,
                prompt: req.prompt,
                delay_seconds,
                send_cards: req.send_cards,
                label: req.label,
            });
            (StatusCode::CREATED, Json(json!({"task": task}))).into_response()
        }
        (None, None) => {
            error_response(StatusCode::BAD_REQUEST, "either delaySeconds or cronExpr is required")
        }
    }
}

async fn list_schedule(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "tasks": state.scheduler.list_tasks(),
        "recurringTasks": state.scheduler.list_recurring(),
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateScheduleBody {
    prompt: Option<String>,
    delay_seconds: Option<i64>,
    cron_expr: Option<String>,
    timezone: Option<String>,
    label: Option<String>,
    send_cards: Option<bool>,
}

async fn update_schedule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateScheduleBody>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    if state.scheduler.get_task(&id).is_some() {
        return match state.scheduler.update_task(
            &id,
            UpdateTaskRequest {
                prompt: req.prompt,
                delay_seconds: req.delay_seconds,
                label: req.label,
                send_cards: req.send_cards,
            },
        ) {
            Ok(task) => Json(json!({"task": task})).into_response(),
            Err(e) => scheduler_error(e),
        };
    }

    match state.scheduler.update_recurring(
        &id,
        UpdateRecurringRequest {
            prompt: req.prompt,
            cron_expr: req.cron_expr,
            timezone: req.timezone,
            label: req.label,
            send_cards: req.send_cards,
        },
    ) {
        Ok(task) => Json(json!({"recurring": task})).into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn delete_schedule(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.scheduler.cancel_task(&id) {
        return Json(json!({"cancelled": id})).into_response();
    }
    match state.scheduler.cancel_recurring(&id) {
        Ok(()) => Json(json!({"cancelled": id})).into_response(),
        Err(SchedulerError::TaskNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, format!("task {id} not found"))
        }
        Err(e) => scheduler_error(e),
    }
}

async fn pause_schedule(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.scheduler.pause_recurring(&id) {
        Ok(task) => Json(json!({"recurring": task})).into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn resume_schedule(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.scheduler.resume_recurring(&id) {
        Ok(task) => Json(json!({"recurring": task})).into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn stats(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.costs.snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to serialize cost snapshot");
        json!({})
    }))
}

async fn metrics_text(State(state): State<ApiState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

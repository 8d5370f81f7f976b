//! HTTP surface: the OpenAI-compatible `/v1/*` endpoints, the
//! bearer-authed `/admin/*` namespace, and the unauthenticated `/public/*`
//! namespace, built on the usual axum 0.8 `Router::new()...with_state(state)`
//! idiom.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Body, Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use acctrelay_core::model::{Account, TaskKind};
use acctrelay_core::storage::KEY_ACCOUNTS;
use acctrelay_core::time::now_ts;

use crate::api_keys::{memory_binding_key, verify_bearer, KeyMode};
use crate::app::AppState;
use crate::error::GatewayError;
use crate::models::{is_known_model, ALLOWED_MODELS};
use crate::openai_wire::{chunk_id, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::orchestrator::{OrchestratorOutcome, OrchestratorRequest};
use crate::refresh_loop::{register_request_template, subprocess_request_for};
use crate::stream_engine::AttemptEvent;
use crate::task_queue::WorkItem;

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/accounts", get(admin_list_accounts).post(admin_create_account))
        .route(
            "/accounts/{account_id}",
            get(admin_get_account).put(admin_update_account).delete(admin_delete_account),
        )
        .route("/settings", get(admin_get_settings).put(admin_update_settings))
        .route("/tasks", get(admin_list_tasks))
        .route("/tasks/register", post(admin_start_register))
        .route("/tasks/refresh", post(admin_start_refresh))
        .route("/tasks/current/{kind}", get(admin_current_task))
        .route("/tasks/{task_id}", get(admin_get_task))
        .route("/tasks/{task_id}/cancel", post(admin_cancel_task))
        .route("/refresh/pause", post(admin_pause_refresh))
        .route("/refresh/resume", post(admin_resume_refresh))
        .route("/log", get(admin_log_tail))
        .route("/stats", get(admin_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    let public_routes = Router::new()
        .route("/stats", get(public_stats))
        .route("/log", get(public_log))
        .route("/uptime", get(public_uptime))
        .route("/display", get(public_display));

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .nest("/admin", admin_routes)
        .nest("/public", public_routes)
        .with_state(state)
}

fn error_body(message: String, kind: &'static str) -> Value {
    json!({"error": {"message": message, "type": kind}})
}

fn error_response(err: GatewayError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_body(err.to_string(), "gateway_error"))).into_response()
}

// ---------------------------------------------------------------------
// /v1/*
// ---------------------------------------------------------------------

fn sse_line(chunk: &ChatCompletionChunk) -> Bytes {
    Bytes::from(format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_default()))
}

/// Runs the orchestrator on a spawned task so events can be forwarded to
/// the client as `stream_engine` parses them, instead of buffering a whole
/// attempt and faking the chunk boundaries afterward. Every `AttemptEvent`
/// becomes a delta the moment it arrives on `event_rx`, preceded by a bare
/// role chunk the first time one arrives; once the orchestrator task
/// finishes, a finish chunk and `[DONE]` close it out (or, for a synthetic
/// admin-command reply that never touched `event_rx`, one role+content
/// chunk is sent first). A total failure sends an in-band error object
/// with no trailing `[DONE]`, matching the upstream's own behavior on
/// final failure.
fn live_sse_response(state: AppState, request_id: String, model: String, req: OrchestratorRequest) -> Response {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<AttemptEvent>();
    let handle = tokio::spawn(async move { state.orchestrator.handle_live(&request_id, req, event_tx).await });

    let id = chunk_id();
    let created = now_ts();
    let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::convert::Infallible>>();

    tokio::spawn(async move {
        let mut role_sent = false;
        while let Some(event) = event_rx.recv().await {
            if !role_sent {
                let _ = frame_tx.send(Ok(sse_line(&ChatCompletionChunk::role_chunk(&id, &model, created))));
                role_sent = true;
            }
            let chunk = match event {
                AttemptEvent::Content(text) => ChatCompletionChunk::content_delta(&id, &model, created, text),
                AttemptEvent::Reasoning(text) => ChatCompletionChunk::reasoning_delta(&id, &model, created, text),
                AttemptEvent::File { .. } => continue,
            };
            if frame_tx.send(Ok(sse_line(&chunk))).is_err() {
                return;
            }
        }

        match handle.await {
            Ok(Ok(OrchestratorOutcome::SyntheticReply(text))) => {
                // Bypassed `run_one_attempt` entirely, so the content
                // never went through `event_rx` -- send it now, together
                // with the role delta, the way the upstream emits a
                // synthetic reply as one role+content chunk.
                let mut chunk = ChatCompletionChunk::role_chunk(&id, &model, created);
                chunk.choices[0].delta.content = Some(text);
                let _ = frame_tx.send(Ok(sse_line(&chunk)));
                let _ = frame_tx.send(Ok(sse_line(&ChatCompletionChunk::finish_chunk(&id, &model, created))));
                let _ = frame_tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
            }
            Ok(Ok(OrchestratorOutcome::Generated { .. })) => {
                let _ = frame_tx.send(Ok(sse_line(&ChatCompletionChunk::finish_chunk(&id, &model, created))));
                let _ = frame_tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
            }
            Ok(Err(err)) => {
                let body = json!({"error": {"message": err.to_string(), "type": "gateway_error"}});
                let _ = frame_tx.send(Ok(Bytes::from(format!("data: {body}\n\n"))));
            }
            Err(join_err) => {
                let body = json!({"error": {"message": join_err.to_string(), "type": "gateway_error"}});
                let _ = frame_tx.send(Ok(Bytes::from(format!("data: {body}\n\n"))));
            }
        }
    });

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(frame_rx);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(model: &str, content: String) -> Response {
    let id = chunk_id();
    let created = now_ts();
    Json(ChatCompletionResponse::new(id, model.to_string(), created, content)).into_response()
}

fn compose_content(content: String, media_fragments: Vec<String>) -> String {
    if media_fragments.is_empty() {
        return content;
    }
    let mut parts = vec![content];
    parts.extend(media_fragments);
    parts.join("\n\n")
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.stats.record_request();
    let request_id = uuid::Uuid::new_v4().simple().to_string();

    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let (api_keys, legacy_key) = {
        let settings = state.settings.lock().expect("settings mutex poisoned");
        (settings.api_keys.clone(), settings.basic.legacy_api_key.clone())
    };
    let verified = match verify_bearer(auth_header, &api_keys, &legacy_key) {
        Ok(v) => v,
        Err(err) => {
            state.stats.record_error();
            return error_response(err);
        }
    };

    let parsed: ChatCompletionRequest = match serde_json::from_value(body.clone()) {
        Ok(p) => p,
        Err(err) => {
            state.stats.record_error();
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(format!("invalid request body: {err}"), "invalid_request")),
            )
                .into_response();
        }
    };

    // `mode=memory` binds this key's conversations to one chat_id per
    // `hash("apikey:" + token)`; `mode=fast` feeds a fresh, unique
    // value per request so the chat_id derivation's api-key branch never
    // collides two fast-mode callers onto the same binding.
    let binding_key = match verified.mode {
        KeyMode::Memory => memory_binding_key(&verified.token),
        KeyMode::Fast => format!("fast:{}", uuid::Uuid::new_v4()),
    };

    // Pre-flight: an unknown model is rejected as plain JSON before a
    // streaming response is ever constructed, the same as the upstream
    // raises before it ever builds its `StreamingResponse`.
    if !is_known_model(&parsed.model) {
        state.stats.record_error();
        return error_response(GatewayError::ModelUnknown(parsed.model.clone()));
    }

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();
    let client_ip = addr.ip().to_string();

    let orchestrator_request = OrchestratorRequest {
        model: parsed.model.clone(),
        messages: parsed.messages,
        api_key_mode: verified.mode,
        api_key_binding_key: binding_key,
        headers: header_pairs,
        body,
        client_ip,
    };

    if parsed.stream {
        return live_sse_response(state, request_id, parsed.model, orchestrator_request);
    }

    match state.orchestrator.handle(&request_id, orchestrator_request).await {
        Ok(OrchestratorOutcome::SyntheticReply(text)) => json_response(&parsed.model, text),
        Ok(OrchestratorOutcome::Generated { content, media_fragments }) => {
            json_response(&parsed.model, compose_content(content, media_fragments))
        }
        Err(err) => {
            state.stats.record_error();
            error_response(err)
        }
    }
}

async fn list_models() -> Response {
    let data: Vec<Value> = ALLOWED_MODELS
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "acctrelay"}))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn get_model(Path(model_id): Path<String>) -> Response {
    if is_known_model(&model_id) {
        Json(json!({"id": model_id, "object": "model", "owned_by": "acctrelay"})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(error_body(format!("unknown model: {model_id}"), "model_unknown")),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------
// /admin/*
// ---------------------------------------------------------------------

/// A plain bearer check against `ADMIN_KEY` is the simplest thing that
/// authenticates the admin namespace without reimplementing session/cookie
/// machinery this crate deliberately leaves out.
async fn require_admin_key(State(state): State<AppState>, headers: HeaderMap, request: Request, next: Next) -> Response {
    if state.admin_key.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body("admin key not configured".to_string(), "admin_unconfigured")),
        )
            .into_response();
    }
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(state.admin_key.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(error_body("invalid admin key".to_string(), "admin_unauthorized")),
        )
            .into_response();
    }
    next.run(request).await
}

fn persist_accounts(state: &AppState, accounts: &[Account]) {
    if let Err(err) = state.storage.set_json(KEY_ACCOUNTS, &accounts) {
        log::error!("event=account_persist_failed where=admin error={err}");
    }
}

async fn admin_list_accounts(State(state): State<AppState>) -> Response {
    let accounts: Vec<Account> = state.pool.all().iter().map(|s| s.snapshot()).collect();
    Json(accounts).into_response()
}

async fn admin_create_account(State(state): State<AppState>, Json(account): Json<Account>) -> Response {
    let mut accounts: Vec<Account> = state.pool.all().iter().map(|s| s.snapshot()).collect();
    if accounts.iter().any(|a| a.account_id == account.account_id) {
        return (
            StatusCode::CONFLICT,
            Json(error_body(format!("account already exists: {}", account.account_id), "account_exists")),
        )
            .into_response();
    }
    accounts.push(account);
    state.pool.reload(accounts.clone());
    persist_accounts(&state, &accounts);
    (StatusCode::CREATED, Json(accounts)).into_response()
}

async fn admin_get_account(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    match state.pool.get_by_id(&account_id) {
        Some(account) => Json(account.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(error_body("account not found".to_string(), "account_not_found"))).into_response(),
    }
}

async fn admin_update_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(mut account): Json<Account>,
) -> Response {
    let mut accounts: Vec<Account> = state.pool.all().iter().map(|s| s.snapshot()).collect();
    let Some(slot) = accounts.iter_mut().find(|a| a.account_id == account_id) else {
        return (StatusCode::NOT_FOUND, Json(error_body("account not found".to_string(), "account_not_found"))).into_response();
    };
    account.account_id = account_id;
    *slot = account;
    state.pool.reload(accounts.clone());
    persist_accounts(&state, &accounts);
    Json(accounts).into_response()
}

async fn admin_delete_account(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    let mut accounts: Vec<Account> = state.pool.all().iter().map(|s| s.snapshot()).collect();
    let before = accounts.len();
    accounts.retain(|a| a.account_id != account_id);
    if accounts.len() == before {
        return (StatusCode::NOT_FOUND, Json(error_body("account not found".to_string(), "account_not_found"))).into_response();
    }
    state.pool.reload(accounts.clone());
    persist_accounts(&state, &accounts);
    StatusCode::NO_CONTENT.into_response()
}

async fn admin_get_settings(State(state): State<AppState>) -> Response {
    let settings = state.settings.lock().expect("settings mutex poisoned").clone();
    Json(settings).into_response()
}

/// Partial update: only the admin-editable sections (`retry`, the two
/// generation sections, `session`, `public_display`, `api_keys`). `basic`
/// stays env-sourced: never silently overridden by a stale stored document.
#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    retry: Option<crate::settings::RetrySettings>,
    image_generation: Option<crate::settings::ImageGenerationSettings>,
    video_generation: Option<crate::settings::VideoGenerationSettings>,
    session: Option<crate::settings::SessionSettings>,
    public_display: Option<crate::settings::PublicDisplaySettings>,
    api_keys: Option<Vec<crate::api_keys::ApiKeyRecord>>,
}

async fn admin_update_settings(State(state): State<AppState>, Json(update): Json<SettingsUpdate>) -> Response {
    let snapshot = {
        let mut settings = state.settings.lock().expect("settings mutex poisoned");
        if let Some(retry) = update.retry {
            settings.retry = retry;
        }
        if let Some(image_generation) = update.image_generation {
            settings.image_generation = image_generation;
        }
        if let Some(video_generation) = update.video_generation {
            settings.video_generation = video_generation;
        }
        if let Some(session) = update.session {
            settings.session = session;
        }
        if let Some(public_display) = update.public_display {
            settings.public_display = public_display;
        }
        if let Some(api_keys) = update.api_keys {
            settings.api_keys = api_keys;
        }
        settings.clone()
    };
    if let Err(err) = snapshot.persist(&state.storage) {
        log::error!("event=settings_persist_failed error={err}");
    }
    Json(snapshot).into_response()
}

async fn admin_list_tasks(State(state): State<AppState>) -> Response {
    Json(state.supervisor.store().list()).into_response()
}

async fn admin_get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.supervisor.store().get(&task_id) {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(error_body("task not found".to_string(), "task_not_found"))).into_response(),
    }
}

fn parse_task_kind(raw: &str) -> Option<TaskKind> {
    match raw {
        "register" => Some(TaskKind::Register),
        "refresh" => Some(TaskKind::Refresh),
        _ => None,
    }
}

async fn admin_current_task(State(state): State<AppState>, Path(kind): Path<String>) -> Response {
    let Some(kind) = parse_task_kind(&kind) else {
        return (StatusCode::BAD_REQUEST, Json(error_body("unknown task kind".to_string(), "invalid_task_kind"))).into_response();
    };
    match state.supervisor.store().current(kind) {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CancelTaskRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn admin_cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<CancelTaskRequest>,
) -> Response {
    if state.supervisor.store().request_cancel(&task_id, body.reason) {
        Json(json!({"cancelled": true})).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(error_body("task not found or already terminal".to_string(), "task_not_cancellable"))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterTaskRequest {
    count: usize,
}

async fn admin_start_register(State(state): State<AppState>, Json(req): Json<RegisterTaskRequest>) -> Response {
    let worker_engine = std::env::var("ACCTRELAY_WORKER_ENGINE").unwrap_or_else(|_| "chromium".to_string());
    let task_id = state
        .supervisor
        .submit_register(req.count, move || register_request_template(&worker_engine));
    Json(json!({"task_id": task_id})).into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshTaskRequest {
    account_ids: Vec<String>,
}

async fn admin_start_refresh(State(state): State<AppState>, Json(req): Json<RefreshTaskRequest>) -> Response {
    let worker_engine = std::env::var("ACCTRELAY_WORKER_ENGINE").unwrap_or_else(|_| "chromium".to_string());
    let items: Vec<WorkItem> = req
        .account_ids
        .iter()
        .filter_map(|id| state.pool.get_by_id(id))
        .map(|account_state| {
            let account = account_state.snapshot();
            WorkItem {
                account_id: Some(account.account_id.clone()),
                request: subprocess_request_for(&account, &worker_engine),
            }
        })
        .collect();
    if items.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(error_body("no matching accounts".to_string(), "invalid_request"))).into_response();
    }
    let task_id = state.supervisor.submit_refresh(items);
    Json(json!({"task_id": task_id})).into_response()
}

async fn admin_pause_refresh(State(state): State<AppState>) -> Response {
    state.refresh_controller.pause();
    Json(json!({"paused": true})).into_response()
}

async fn admin_resume_refresh(State(state): State<AppState>) -> Response {
    state.refresh_controller.resume();
    Json(json!({"paused": false})).into_response()
}

/// Tail of the most recently created task's log ring (per-task
/// `TASK_LOGS_CAP` buffer is the only rolling log this crate keeps).
fn recent_log_lines(state: &AppState) -> Vec<String> {
    state
        .supervisor
        .store()
        .list()
        .into_iter()
        .max_by_key(|t| t.created_at)
        .map(|t| t.logs)
        .unwrap_or_default()
}

async fn admin_log_tail(State(state): State<AppState>) -> Response {
    Json(json!({"lines": recent_log_lines(&state)})).into_response()
}

async fn admin_stats(State(state): State<AppState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

// ---------------------------------------------------------------------
// /public/*
// ---------------------------------------------------------------------

async fn public_stats(State(state): State<AppState>) -> Response {
    let show = state.settings.lock().expect("settings mutex poisoned").public_display.show_stats;
    if !show {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(state.stats.snapshot()).into_response()
}

async fn public_log(State(state): State<AppState>) -> Response {
    let show = state.settings.lock().expect("settings mutex poisoned").public_display.show_log;
    if !show {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({"lines": recent_log_lines(&state)})).into_response()
}

async fn public_uptime(State(state): State<AppState>) -> Response {
    Json(json!({"started_at": state.started_at, "uptime_secs": now_ts() - state.started_at})).into_response()
}

async fn public_display(State(state): State<AppState>) -> Response {
    let public_display = state.settings.lock().expect("settings mutex poisoned").public_display.clone();
    let mut body = json!({
        "uptime_secs": now_ts() - state.started_at,
    });
    if public_display.show_stats {
        body["stats"] = serde_json::to_value(state.stats.snapshot()).unwrap_or(Value::Null);
    }
    if public_display.show_log {
        body["log"] = json!(recent_log_lines(&state));
    }
    if let Some(base_url) = public_display.base_url_override {
        body["base_url"] = json!(base_url);
    }
    Json(body).into_response()
}

//! Local HTTP control surface.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::accounts::AccountBook;
use crate::config::{Account, Config, expand_path, parse_duration, resolve_config_path};
use crate::error::SubmitError;
use crate::monitor::MonitorManager;
use crate::submit::{SendRequest, send_mail};

/// Upper bound for `GET /latest?count=`.
pub const MAX_LATEST_COUNT: usize = 10;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<MonitorManager>,
    pub accounts: Arc<AccountBook>,
    /// Parent of every session started through the API.
    pub root: CancellationToken,
    pub version: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/accounts", get(list_accounts).post(add_account))
        .route("/accounts/{email}", delete(remove_account))
        .route("/accounts/{email}/start", post(start_account))
        .route("/accounts/{email}/stop", post(stop_account))
        .route("/test-connection", post(test_connection))
        .route("/latest", get(latest))
        .route("/logs", get(logs))
        .route("/send", post(send))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    fn bad_request(message: impl Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = self.status.as_u16(), error = %self.message, "http request failed");
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Clamp a raw `count` parameter into `1..=10`. Missing or unparseable is 1.
pub fn clamp_count(raw: Option<&str>) -> usize {
    let count = raw
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(1);
    count.clamp(1, MAX_LATEST_COUNT as i64) as usize
}

// ── Service ─────────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "status": "ok", "version": state.version }))
}

async fn status(State(state): State<ApiState>) -> Json<Value> {
    let monitoring = state.manager.monitoring_count();
    let config_path = state
        .accounts
        .config_path()
        .or_else(|| resolve_config_path().ok())
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let log_file = state.accounts.log_file();
    let log_file = if log_file.trim().is_empty() {
        String::new()
    } else {
        expand_path(log_file.trim()).display().to_string()
    };

    let running = if monitoring > 0 { "running" } else { "stopped" };

    Json(json!({
        "monitoring": monitoring,
        "total": state.accounts.len(),
        "status": running,
        "version": state.version,
        "config_path": config_path,
        "log_file": log_file,
    }))
}

// ── Accounts ────────────────────────────────────────────────────────────

async fn list_accounts(State(state): State<ApiState>) -> Json<Value> {
    let accounts: Vec<Value> = state
        .accounts
        .list()
        .iter()
        .map(|a| {
            let status = if a.enabled && state.manager.is_monitoring(&a.email) {
                "monitoring"
            } else {
                "disabled"
            };
            json!({
                "provider": a.provider,
                "email": a.email,
                "enabled": a.enabled,
                "status": status,
            })
        })
        .collect();
    Json(json!({ "total": accounts.len(), "accounts": accounts }))
}

#[derive(Deserialize)]
struct AddAccountInput {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    auth_token: String,
    #[serde(default)]
    imap_host: String,
    #[serde(default)]
    smtp_host: String,
}

async fn add_account(
    State(state): State<ApiState>,
    payload: Result<Json<AddAccountInput>, JsonRejection>,
) -> ApiResult {
    let Json(input) = payload?;
    let mut account = Account::new(&input.provider, &input.email, &input.auth_token);
    account.imap_host = input.imap_host.trim().to_string();
    account.smtp_host = input.smtp_host.trim().to_string();
    Config::apply_defaults(&mut account);

    state
        .manager
        .test_connection(&account)
        .await
        .map_err(|e| ApiError::bad_request(format!("imap connection failed: {e}")))?;

    let stored = state.accounts.add(account).map_err(ApiError::bad_request)?;
    state.manager.start_account(&state.root, stored.clone());

    Ok(Json(json!({
        "success": true,
        "message": format!("Account {} added successfully", stored.email),
    })))
}

async fn remove_account(State(state): State<ApiState>, Path(email): Path<String>) -> ApiResult {
    let email = email.trim();
    if email.is_empty() {
        return Err(ApiError::bad_request("email is required"));
    }

    state.accounts.remove(email).map_err(ApiError::bad_request)?;
    state.manager.stop_account(email);

    Ok(Json(json!({
        "success": true,
        "message": format!("Account {email} removed successfully"),
    })))
}

async fn start_account(State(state): State<ApiState>, Path(email): Path<String>) -> ApiResult {
    let account = state
        .accounts
        .find(&email)
        .ok_or_else(|| ApiError::not_found(format!("account not found: {}", email.trim())))?;

    let started = state.manager.start_account(&state.root, account.clone());
    if !started && !state.manager.is_monitoring(&account.email) {
        return Err(ApiError::bad_request(format!(
            "imap connection info is incomplete for {}",
            account.email
        )));
    }
    info!(email = %account.email, started, "start requested");

    Ok(Json(json!({ "success": true, "started": started, "email": account.email })))
}

async fn stop_account(State(state): State<ApiState>, Path(email): Path<String>) -> ApiResult {
    let email = email.trim();
    let was_monitoring = state.manager.is_monitoring(email);
    state.manager.stop_account(email);
    Ok(Json(json!({ "success": true, "stopped": was_monitoring, "email": email })))
}

#[derive(Deserialize)]
struct TestConnectionInput {
    #[serde(default)]
    email: String,
}

async fn test_connection(
    State(state): State<ApiState>,
    payload: Result<Json<TestConnectionInput>, JsonRejection>,
) -> ApiResult {
    let Json(input) = payload?;
    let Some(account) = state.accounts.find(&input.email) else {
        return Ok(Json(json!({ "success": false, "status": "not_found", "latency_ms": 0 })));
    };

    Ok(Json(match state.manager.test_connection(&account).await {
        Ok(latency) => json!({
            "success": true,
            "status": "connected",
            "latency_ms": latency.as_millis() as u64,
        }),
        Err(_) => json!({ "success": false, "status": "failed", "latency_ms": 0 }),
    }))
}

// ── Mail ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LatestQuery {
    email: Option<String>,
    count: Option<String>,
    since: Option<String>,
}

async fn latest(State(state): State<ApiState>, Query(query): Query<LatestQuery>) -> ApiResult {
    let email = query.email.as_deref().map(str::trim).unwrap_or_default();
    let count = clamp_count(query.count.as_deref());
    let window = match query.since.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_duration(raw)
            .ok_or_else(|| ApiError::bad_request(format!("invalid duration: {raw}")))?,
        _ => std::time::Duration::ZERO,
    };

    if email.is_empty() {
        let emails = if window.is_zero() {
            state.manager.get_latest_emails_all(count).await
        } else {
            state.manager.get_latest_emails_all_since(count, window).await
        };
        return Ok(Json(json!({ "emails": emails, "count": emails.len(), "email": "all" })));
    }

    let Some(account) = state.accounts.find(email) else {
        return Ok(Json(json!({ "emails": [], "count": 0, "email": email })));
    };

    let emails = if window.is_zero() {
        state.manager.get_latest_emails(&account, count).await
    } else {
        state
            .manager
            .get_latest_emails_since(&account, count, window)
            .await
    }
    .map_err(ApiError::internal)?;

    Ok(Json(json!({ "emails": emails, "count": emails.len(), "email": email })))
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(State(state): State<ApiState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let (entries, total) = state.manager.logs(query.limit.unwrap_or(0));
    Json(json!({ "logs": entries, "total": total }))
}

async fn send(
    State(state): State<ApiState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    let account = state
        .accounts
        .first_enabled()
        .ok_or_else(|| ApiError::bad_request("no enabled account"))?;

    send_mail(&account, req).await.map_err(|e| match e {
        SubmitError::NoRecipients
        | SubmitError::InvalidAddress { .. }
        | SubmitError::IncompleteAccount { .. } => ApiError::bad_request(e),
        _ => ApiError::internal(e),
    })?;

    Ok(Json(json!({ "success": true, "message": "mail sent" })))
}

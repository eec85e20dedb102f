use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bot::BotDispatcher;
use crate::collaborators::Collaborators;
use crate::config::MailSyncConfig;
use crate::error::ServiceError;
use crate::gmail::oauth::GoogleOAuth;
use crate::ingest::{NotificationIngestor, PushEnvelope};
use crate::renewal::RenewalScheduler;
use crate::reply::ReplyStateMachine;
use crate::telegram::Update;

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<MailSyncConfig>,
    pub auth: BackendAuthConfig,
    pub collab: Collaborators,
    pub oauth: GoogleOAuth,
    pub dispatcher: Arc<BotDispatcher>,
    pub ingestor: Arc<NotificationIngestor>,
    pub renewal: Arc<RenewalScheduler>,
    pub reply: Arc<ReplyStateMachine>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_watches: usize,
}

#[derive(Debug, Serialize)]
struct PurgeResponse {
    purged: usize,
}

#[derive(Debug, Deserialize)]
struct PushQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthStartQuery {
    conversation_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Public webhook routes plus the bearer-protected admin API under `/v1`.
pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/renewal/run", post(run_renewal))
        .route("/contexts/purge", post(purge_contexts))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/gmail/push", post(gmail_push))
        .route("/gmail/auth", get(gmail_auth))
        .route("/gmail/callback", get(gmail_callback))
        .with_state(state)
        .nest("/v1", protected)
}

pub async fn serve(state: Arc<ServerState>) -> Result<()> {
    let bind_addr = state
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind_addr (expected host:port)")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind mailsync server to {}", bind_addr))?;
    tracing::info!("MailSync listening on http://{}", bind_addr);
    axum::serve(listener, router(state))
        .await
        .context("MailSync server failed")?;
    Ok(())
}

pub fn load_auth_config(config: &MailSyncConfig) -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("MAILSYNC_ADMIN_AUTH_MODE").ok())?;
    let token = config
        .admin_token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    match (mode, token.is_some()) {
        (AuthMode::Required, false) => {
            tracing::warn!("MAILSYNC_ADMIN_TOKEN is unset; every /v1 request will be rejected")
        }
        (AuthMode::Disabled, _) => {
            tracing::warn!("Admin auth mode is disabled; /v1 routes are unauthenticated")
        }
        _ => {}
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid MAILSYNC_ADMIN_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

// ─── Webhooks ────────────────────────────────────────────────────────────────

async fn telegram_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = state.config.telegram_webhook_secret.as_deref() {
        let presented = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret) {
            tracing::warn!("Rejected Telegram webhook with a bad secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    // Malformed updates are still acknowledged so Telegram stops redelivering them.
    match serde_json::from_slice::<Update>(&body) {
        Ok(update) => {
            let dispatcher = state.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.handle_update(update).await;
            });
        }
        Err(e) => tracing::warn!("Ignoring unparsable Telegram update: {}", e),
    }
    StatusCode::OK
}

async fn gmail_push(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PushQuery>,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = state.config.pubsub_verification_token.as_deref() {
        if query.token.as_deref() != Some(expected) {
            tracing::warn!("Rejected push delivery with a bad verification token");
            return StatusCode::FORBIDDEN;
        }
    }

    let notification = serde_json::from_slice::<PushEnvelope>(&body)
        .map_err(anyhow::Error::from)
        .and_then(|envelope| envelope.notification());
    let (email, cursor) = match notification {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Dropping unusable push notification: {:#}", e);
            return StatusCode::NO_CONTENT;
        }
    };

    // Acknowledge now. A failed advance leaves the stored cursor in place, so
    // the next notification for the account picks the same items up again.
    let ingestor = state.ingestor.clone();
    tokio::spawn(async move {
        if let Err(e) = ingestor.on_push_notification(&email, &cursor).await {
            tracing::error!("Failed to process notification for {}: {}", email, e);
        }
    });
    StatusCode::OK
}

async fn gmail_auth(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AuthStartQuery>,
) -> Result<Redirect, (StatusCode, String)> {
    let Some(conversation_id) = query.conversation_id else {
        return Err(bad_request("conversation_id is required"));
    };
    let url = state
        .oauth
        .consent_url(&conversation_id.to_string())
        .map_err(internal_error)?;
    Ok(Redirect::temporary(&url))
}

async fn gmail_callback(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AuthCallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        tracing::warn!("OAuth consent was not granted: {}", error);
        return auth_page(StatusCode::BAD_REQUEST, "Authorization was cancelled.");
    }
    let (Some(code), Some(conversation_id)) = (
        query.code,
        query.state.and_then(|s| s.trim().parse::<i64>().ok()),
    ) else {
        return auth_page(StatusCode::BAD_REQUEST, "Missing authorization code or state.");
    };

    match link_account(&state, &code, conversation_id).await {
        Ok(email) => {
            tracing::info!("Linked {} to chat {}", email, conversation_id);
            state
                .collab
                .notify(
                    conversation_id,
                    &format!(
                        "✅ Gmail connected successfully!\n\nEmail: {}\n\n\
                         Use /watch to enable real-time notifications.",
                        email
                    ),
                )
                .await;
            auth_page(
                StatusCode::OK,
                "✅ Connected! You can close this window and return to Telegram.",
            )
        }
        Err(e) => {
            tracing::error!("OAuth callback failed for chat {}: {}", conversation_id, e);
            state
                .collab
                .notify(conversation_id, "❌ Failed to connect Gmail. Please try /connect again.")
                .await;
            auth_page(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed.")
        }
    }
}

async fn link_account(
    state: &ServerState,
    code: &str,
    conversation_id: i64,
) -> Result<String, ServiceError> {
    let credentials = state.oauth.exchange_code(code).await?;
    let email = state.oauth.profile_email(&credentials.access_token).await?;
    state
        .collab
        .db
        .upsert_integration(&email, conversation_id, &credentials)
        .map_err(ServiceError::storage)?;
    Ok(email)
}

fn auth_page(status: StatusCode, message: &str) -> Response {
    let html = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>MailSync</title></head>\
         <body><h1>{}</h1></body></html>",
        message
    );
    (status, Html(html)).into_response()
}

// ─── Admin API ───────────────────────────────────────────────────────────────

async fn health(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<HealthResponse>, (StatusCode, String)> {
    let active = state
        .collab
        .db
        .list_active_integrations()
        .map_err(|e| internal_error(ServiceError::storage(e)))?;
    Ok(Json(HealthResponse {
        status: "ok",
        active_watches: active.len(),
    }))
}

async fn run_renewal(State(state): State<Arc<ServerState>>) -> Response {
    match state.renewal.run_sweep().await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => (
            StatusCode::CONFLICT,
            "A renewal sweep is already running".to_string(),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn purge_contexts(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<PurgeResponse>, (StatusCode, String)> {
    let cutoff = Utc::now() - state.config.context_ttl();
    let purged = state.reply.purge_expired(cutoff).map_err(internal_error)?;
    Ok(Json(PurgeResponse { purged }))
}

fn bad_request(message: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn internal_error(error: ServiceError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

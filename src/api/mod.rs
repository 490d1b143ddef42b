//! HTTP API: session lifecycle, sends, groups, contacts and webhook sinks.
//!
//! Every route except `/` and `/health` requires the API key, presented as
//! `Authorization: Bearer <key>` or `X-API-Key: <key>`.

mod contacts;
mod error;
mod groups;
mod send;
mod sessions;
mod webhooks;

#[cfg(test)]
mod tests;

pub use error::{status_for, ApiError, ApiResult};

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::send::MediaFetcher;
use crate::session::SessionManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub media: MediaFetcher,
    api_key: Arc<str>,
    started: Instant,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, media: MediaFetcher, api_key: &str) -> Self {
        Self {
            manager,
            media,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

/// Constant-time string comparison, so key checks do not leak timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

/// Reject requests without the API key. An empty configured key rejects all.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = !state.api_key.is_empty()
        && presented_key(request.headers()).is_some_and(|k| constant_time_eq(k, &state.api_key));
    if !authorized {
        warn!(path = %request.uri().path(), "rejected request without a valid API key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// `GET /`: service banner.
async fn root() -> Json<Value> {
    Json(json!({
        "name": "wagate",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Multi-tenant WhatsApp session gateway",
    }))
}

/// `GET /health`: liveness, uptime and delivery counters.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started.elapsed().as_secs(),
        "sessions": state.manager.live_count(),
        "webhooks": state.manager.dispatcher().counters(),
    }))
}

/// Build the router with shared state.
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    let protected = Router::new()
        .route("/sessions/create", post(sessions::create))
        .route("/sessions/list", get(sessions::list))
        .route("/sessions/{session_id}/info", get(sessions::info))
        .route("/sessions/{session_id}/status", get(sessions::status))
        .route("/sessions/{session_id}/delete", delete(sessions::remove))
        .route("/sessions/{session_id}/connect", post(sessions::connect))
        .route("/sessions/{session_id}/disconnect", post(sessions::disconnect))
        .route("/sessions/{session_id}/logout", post(sessions::logout))
        .route("/sessions/{session_id}/qr", get(sessions::qr))
        .route("/sessions/{session_id}/pair", post(sessions::pair))
        .route(
            "/sessions/{session_id}/send/message/{kind}",
            post(send::send_message),
        )
        .route(
            "/sessions/{session_id}/webhooks",
            post(webhooks::create).get(webhooks::list),
        )
        .route(
            "/sessions/{session_id}/webhooks/{sink_id}",
            get(webhooks::get)
                .put(webhooks::update)
                .delete(webhooks::remove),
        )
        .route(
            "/sessions/{session_id}/webhooks/{sink_id}/enable",
            post(webhooks::enable),
        )
        .route("/sessions/{session_id}/groups/create", post(groups::create))
        .route("/sessions/{session_id}/groups/list", get(groups::list))
        .route("/sessions/{session_id}/groups/join", post(groups::join))
        .route(
            "/sessions/{session_id}/groups/{group_jid}/info",
            get(groups::info),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/invite-link",
            get(groups::invite_link),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/participants",
            post(groups::participants),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/name",
            put(groups::set_name),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/topic",
            put(groups::set_topic),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/photo",
            put(groups::set_photo),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/settings",
            put(groups::settings),
        )
        .route(
            "/sessions/{session_id}/groups/{group_jid}/leave",
            post(groups::leave),
        )
        .route("/sessions/{session_id}/contacts/check", post(contacts::check))
        .route("/sessions/{session_id}/contacts/info", post(contacts::info))
        .route("/sessions/{session_id}/contacts/list", get(contacts::list))
        .route(
            "/sessions/{session_id}/contacts/{jid}/avatar",
            get(contacts::avatar),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

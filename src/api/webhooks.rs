//! Per-session webhook sinks.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;
use wagate_core::error::GatewayError;
use wagate_core::event::EventType;
use wagate_core::session::SessionId;
use wagate_core::sink::{RetryPolicy, Sink};

use super::{ApiResult, AppState};
use crate::events::SinkSpec;

/// A sink as shown to API callers; the secret never leaves the server.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkView {
    id: Uuid,
    session_id: SessionId,
    url: String,
    events: Vec<EventType>,
    has_secret: bool,
    retry_policy: RetryPolicy,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl From<Sink> for SinkView {
    fn from(sink: Sink) -> Self {
        Self {
            id: sink.id,
            session_id: sink.session_id,
            url: sink.target,
            events: sink.filter_types,
            has_secret: sink.secret.is_some(),
            retry_policy: sink.retry_policy,
            enabled: !sink.disabled,
            created_at: sink.created_at,
        }
    }
}

fn sink_id(raw: &str) -> Result<Uuid, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Validation(format!("invalid webhook id '{raw}'")))
}

pub async fn create(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<SinkSpec>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SinkView>)> {
    let Json(spec) = body?;
    let sink = state.manager.create_sink(&session_id, spec).await?;
    Ok((StatusCode::CREATED, Json(sink.into())))
}

pub async fn list(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let sinks: Vec<SinkView> = state
        .manager
        .list_sinks(&session_id)
        .await?
        .into_iter()
        .map(SinkView::from)
        .collect();
    Ok(Json(json!({ "webhooks": sinks })))
}

pub async fn get(
    State(state): State<AppState>,
    Path((session_id, id)): Path<(String, String)>,
) -> ApiResult<Json<SinkView>> {
    let sink = state.manager.get_sink(&session_id, sink_id(&id)?).await?;
    Ok(Json(sink.into()))
}

pub async fn update(
    State(state): State<AppState>,
    Path((session_id, id)): Path<(String, String)>,
    body: Result<Json<SinkSpec>, JsonRejection>,
) -> ApiResult<Json<SinkView>> {
    let Json(spec) = body?;
    let sink = state
        .manager
        .update_sink(&session_id, sink_id(&id)?, spec)
        .await?;
    Ok(Json(sink.into()))
}

pub async fn remove(
    State(state): State<AppState>,
    Path((session_id, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state
        .manager
        .delete_sink(&session_id, sink_id(&id)?)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// Re-enable a sink that was disabled after repeated delivery failures.
pub async fn enable(
    State(state): State<AppState>,
    Path((session_id, id)): Path<(String, String)>,
) -> ApiResult<Json<SinkView>> {
    let sink = state
        .manager
        .enable_sink(&session_id, sink_id(&id)?)
        .await?;
    Ok(Json(sink.into()))
}

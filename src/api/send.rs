//! `POST /sessions/{id}/send/message/{kind}`

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{ApiResult, AppState};
use crate::send::{parse_request, prepare, SendKind, SendResult};

#[derive(Debug, Deserialize)]
pub struct SendQuery {
    /// Seconds before the caller gives up on the send.
    timeout: Option<u64>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path((session_id, kind)): Path<(String, String)>,
    query: Result<Query<SendQuery>, QueryRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<SendResult>> {
    let Query(query) = query?;
    let id = state.manager.resolve(&session_id).await?;
    let kind: SendKind = kind.parse()?;
    let Json(body) = body?;

    let request = parse_request(kind, body)?;
    let prepared = prepare(request, &state.media).await?;
    let (to, content) = (prepared.to.clone(), prepared.content.clone());
    debug!(session_id = %id, to = %to, "sending {kind} message");

    let timeout = query.timeout.map(Duration::from_secs);
    let response = state
        .manager
        .runtime(id)
        .await?
        .send(prepared, timeout)
        .await?;
    Ok(Json(SendResult::new(&to, kind, content, &response)))
}

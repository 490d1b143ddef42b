//! Session lifecycle endpoints.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;
use wagate_core::error::GatewayError;
use wagate_core::session::{ProxyConfig, SessionFilter};
use wagate_whatsapp::qr_data_url;

use super::{ApiResult, AppState};
use crate::session::{QrCode, RuntimeStatus, SessionInfo};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;
/// Upper bound for `?timeout=` on the QR endpoint.
const MAX_QR_WAIT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody {
    name: String,
    #[serde(default, alias = "qr_code")]
    qr_code: bool,
    #[serde(default)]
    proxy: Option<ProxyConfig>,
}

/// A QR code as rendered to API callers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrView {
    qr_code: String,
    qr_code_base64: Option<String>,
    qr_expires_at: DateTime<Utc>,
}

impl QrView {
    fn new(qr: QrCode) -> Self {
        let qr_code_base64 = match qr_data_url(&qr.code) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("QR image rendering failed: {e}");
                None
            }
        };
        Self {
            qr_code: qr.code,
            qr_code_base64,
            qr_expires_at: qr.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionWithQr {
    #[serde(flatten)]
    session: SessionInfo,
    #[serde(flatten)]
    qr: Option<QrView>,
}

impl SessionWithQr {
    fn new(mut session: SessionInfo, qr: Option<QrCode>) -> Self {
        // The QR is reported once, in its rendered form.
        let qr = qr.or_else(|| session.qr.take()).map(QrView::new);
        session.qr = None;
        Self { session, qr }
    }
}

/// `POST /sessions/create`
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SessionWithQr>)> {
    let Json(body) = body?;
    let out = state
        .manager
        .create(&body.name, body.proxy, body.qr_code)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionWithQr::new(out.info, out.qr)),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    connected: Option<bool>,
    #[serde(alias = "name")]
    prefix: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// `GET /sessions/list`
pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let filter = SessionFilter {
        connected: query.connected,
        name_prefix: query.prefix.filter(|p| !p.is_empty()),
    };
    let (sessions, total) = state.manager.list(&filter, limit, offset).await?;
    Ok(Json(json!({
        "sessions": sessions,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// `GET /sessions/{id}/info`
pub async fn info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithQr>> {
    let info = state.manager.info(&session_id).await?;
    Ok(Json(SessionWithQr::new(info, None)))
}

/// `GET /sessions/{id}/status`
pub async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<RuntimeStatus>> {
    Ok(Json(state.manager.status(&session_id).await?))
}

/// `DELETE /sessions/{id}/delete`
pub async fn remove(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = state.manager.resolve(&session_id).await?;
    state.manager.delete(id).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

/// `POST /sessions/{id}/connect`
pub async fn connect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithQr>> {
    let out = state.manager.connect(&session_id).await?;
    Ok(Json(SessionWithQr::new(out.info, out.qr)))
}

/// `POST /sessions/{id}/disconnect`
pub async fn disconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithQr>> {
    let info = state.manager.disconnect(&session_id).await?;
    Ok(Json(SessionWithQr::new(info, None)))
}

/// `POST /sessions/{id}/logout`
pub async fn logout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithQr>> {
    let info = state.manager.logout(&session_id).await?;
    Ok(Json(SessionWithQr::new(info, None)))
}

#[derive(Debug, Deserialize)]
pub struct QrQuery {
    /// Seconds to wait for a code.
    timeout: Option<u64>,
}

/// `GET /sessions/{id}/qr`: the live QR, waiting briefly for one.
pub async fn qr(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<QrQuery>, QueryRejection>,
) -> ApiResult<Json<QrView>> {
    let Query(query) = query?;
    let wait = query
        .timeout
        .map(|secs| Duration::from_secs(secs.min(MAX_QR_WAIT_SECS)));
    let qr = state.manager.get_qr(&session_id, wait).await?;
    Ok(Json(QrView::new(qr)))
}

#[derive(Debug, Deserialize)]
pub struct PairBody {
    #[serde(alias = "phoneNumber")]
    phone: String,
}

/// `POST /sessions/{id}/pair`: pair by phone number instead of QR.
pub async fn pair(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<PairBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    if body.phone.trim().is_empty() {
        return Err(GatewayError::Validation("phone is required".into()).into());
    }
    let code = state.manager.pair_phone(&session_id, &body.phone).await?;
    Ok(Json(json!({ "success": true, "pairingCode": code })))
}

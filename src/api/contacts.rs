//! Contact lookup endpoints.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use wagate_core::error::GatewayError;
use wagate_core::jid::{clean_phone, parse_target, Jid};

use super::{ApiResult, AppState};
use crate::session::{ContactOp, ContactReply};

/// Lookups per request.
const MAX_BATCH: usize = 50;

fn check_batch(len: usize, field: &str) -> Result<(), GatewayError> {
    if len == 0 {
        return Err(GatewayError::Validation(format!("{field} must not be empty")));
    }
    if len > MAX_BATCH {
        return Err(GatewayError::Validation(format!(
            "at most {MAX_BATCH} {field} per request"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CheckBody {
    phones: Vec<String>,
}

/// `POST /sessions/{id}/contacts/check`: which numbers are on WhatsApp.
pub async fn check(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<CheckBody>, JsonRejection>,
) -> ApiResult<Json<ContactReply>> {
    let Json(body) = body?;
    check_batch(body.phones.len(), "phones")?;
    let phones = body
        .phones
        .iter()
        .map(|p| clean_phone(p).ok_or_else(|| GatewayError::InvalidTarget(p.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let reply = state
        .manager
        .contact(&session_id, ContactOp::Check { phones })
        .await?;
    Ok(Json(reply))
}

#[derive(Debug, Deserialize)]
pub struct InfoBody {
    #[serde(alias = "phones")]
    jids: Vec<String>,
}

pub async fn info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<InfoBody>, JsonRejection>,
) -> ApiResult<Json<ContactReply>> {
    let Json(body) = body?;
    check_batch(body.jids.len(), "jids")?;
    let jids = body
        .jids
        .iter()
        .map(|j| parse_target(j))
        .collect::<Result<Vec<Jid>, _>>()?;
    let reply = state
        .manager
        .contact(&session_id, ContactOp::Info { jids })
        .await?;
    Ok(Json(reply))
}

#[derive(Debug, Deserialize)]
pub struct AvatarQuery {
    #[serde(default)]
    preview: bool,
}

pub async fn avatar(
    State(state): State<AppState>,
    Path((session_id, jid)): Path<(String, String)>,
    query: Result<Query<AvatarQuery>, QueryRejection>,
) -> ApiResult<Json<ContactReply>> {
    let Query(query) = query?;
    let op = ContactOp::Avatar {
        jid: parse_target(&jid)?,
        preview: query.preview,
    };
    Ok(Json(state.manager.contact(&session_id, op).await?))
}

pub async fn list(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ContactReply>> {
    Ok(Json(state.manager.contact(&session_id, ContactOp::List).await?))
}

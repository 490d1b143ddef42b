//! Group management endpoints.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use wagate_core::error::GatewayError;
use wagate_core::jid::{parse_target, Jid};
use wagate_core::wa::ParticipantAction;

use super::{ApiResult, AppState};
use crate::session::{GroupOp, GroupReply};

const INVITE_PREFIX: &str = "https://chat.whatsapp.com/";
const MAX_PARTICIPANTS: usize = 256;

/// Accept a full group JID or the bare group id.
fn group_jid(raw: &str) -> Result<Jid, GatewayError> {
    let raw = raw.trim();
    let jid = if raw.contains('@') {
        parse_target(raw)?
    } else if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '-') {
        Jid::group(raw)
    } else {
        return Err(GatewayError::InvalidTarget(raw.to_string()));
    };
    if !jid.is_group() {
        return Err(GatewayError::InvalidTarget(format!("{raw} is not a group")));
    }
    Ok(jid)
}

fn participant_jids(raw: &[String]) -> Result<Vec<Jid>, GatewayError> {
    if raw.is_empty() {
        return Err(GatewayError::Validation(
            "at least one participant is required".into(),
        ));
    }
    if raw.len() > MAX_PARTICIPANTS {
        return Err(GatewayError::Validation(format!(
            "at most {MAX_PARTICIPANTS} participants per request"
        )));
    }
    raw.iter().map(|p| parse_target(p)).collect()
}

fn required(value: &str, field: &str) -> Result<String, GatewayError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

async fn run(state: &AppState, session_id: &str, op: GroupOp) -> ApiResult<GroupReply> {
    Ok(state.manager.group(session_id, op).await?)
}

fn done() -> Json<Value> {
    Json(json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    name: String,
    #[serde(default)]
    participants: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> ApiResult<Json<GroupReply>> {
    let Json(body) = body?;
    let op = GroupOp::Create {
        name: required(&body.name, "name")?,
        participants: participant_jids(&body.participants)?,
    };
    Ok(Json(run(&state, &session_id, op).await?))
}

pub async fn list(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<GroupReply>> {
    Ok(Json(run(&state, &session_id, GroupOp::List).await?))
}

pub async fn info(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
) -> ApiResult<Json<GroupReply>> {
    let group = group_jid(&group)?;
    Ok(Json(run(&state, &session_id, GroupOp::Info { group }).await?))
}

#[derive(Debug, Deserialize)]
pub struct InviteQuery {
    #[serde(default)]
    reset: bool,
}

pub async fn invite_link(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    query: Result<Query<InviteQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let group = group_jid(&group)?;
    let op = GroupOp::InviteLink {
        group,
        reset: query.reset,
    };
    match run(&state, &session_id, op).await? {
        GroupReply::InviteLink(link) => Ok(Json(json!({ "inviteLink": link }))),
        other => Ok(Json(serde_json::to_value(other).map_err(GatewayError::from)?)),
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    /// Invite code or full invite link.
    #[serde(alias = "link")]
    code: String,
}

pub async fn join(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<JoinBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let code = required(&body.code, "code")?;
    let code = code.strip_prefix(INVITE_PREFIX).unwrap_or(&code).to_string();
    match run(&state, &session_id, GroupOp::Join { code }).await? {
        GroupReply::Joined(jid) => Ok(Json(json!({ "success": true, "groupJid": jid }))),
        other => Ok(Json(serde_json::to_value(other).map_err(GatewayError::from)?)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ParticipantsBody {
    action: ParticipantAction,
    participants: Vec<String>,
}

pub async fn participants(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    body: Result<Json<ParticipantsBody>, JsonRejection>,
) -> ApiResult<Json<GroupReply>> {
    let Json(body) = body?;
    let op = GroupOp::Participants {
        group: group_jid(&group)?,
        participants: participant_jids(&body.participants)?,
        action: body.action,
    };
    Ok(Json(run(&state, &session_id, op).await?))
}

#[derive(Debug, Deserialize)]
pub struct NameBody {
    name: String,
}

pub async fn set_name(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    body: Result<Json<NameBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let op = GroupOp::SetName {
        group: group_jid(&group)?,
        name: required(&body.name, "name")?,
    };
    run(&state, &session_id, op).await?;
    Ok(done())
}

#[derive(Debug, Deserialize)]
pub struct TopicBody {
    #[serde(alias = "description")]
    topic: String,
}

pub async fn set_topic(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    body: Result<Json<TopicBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let op = GroupOp::SetTopic {
        group: group_jid(&group)?,
        topic: body.topic,
    };
    run(&state, &session_id, op).await?;
    Ok(done())
}

#[derive(Debug, Deserialize)]
pub struct PhotoBody {
    /// URL, data URL or server-local path of a JPEG.
    image: String,
}

pub async fn set_photo(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    body: Result<Json<PhotoBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let group = group_jid(&group)?;
    state.manager.resolve(&session_id).await?;
    let media = state.media.resolve(&body.image, None).await?;
    if media.mimetype != "image/jpeg" {
        return Err(GatewayError::Validation(format!(
            "group photos must be image/jpeg, got {}",
            media.mimetype
        ))
        .into());
    }
    let op = GroupOp::SetPhoto {
        group,
        jpeg: media.data,
    };
    match run(&state, &session_id, op).await? {
        GroupReply::PictureId(id) => Ok(Json(json!({ "success": true, "pictureId": id }))),
        _ => Ok(done()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBody {
    locked: Option<bool>,
    announce: Option<bool>,
    /// 0 turns disappearing messages off.
    disappearing_seconds: Option<u64>,
}

pub async fn settings(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
    body: Result<Json<SettingsBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    if body.locked.is_none() && body.announce.is_none() && body.disappearing_seconds.is_none() {
        return Err(GatewayError::Validation(
            "one of locked, announce or disappearingSeconds is required".into(),
        )
        .into());
    }
    let op = GroupOp::Settings {
        group: group_jid(&group)?,
        locked: body.locked,
        announce: body.announce,
        disappearing: body.disappearing_seconds.map(Duration::from_secs),
    };
    run(&state, &session_id, op).await?;
    Ok(done())
}

pub async fn leave(
    State(state): State<AppState>,
    Path((session_id, group)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let group = group_jid(&group)?;
    run(&state, &session_id, GroupOp::Leave { group }).await?;
    Ok(done())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_jid_forms() {
        assert_eq!(
            group_jid("120363041234567890@g.us").unwrap(),
            Jid::group("120363041234567890")
        );
        assert_eq!(
            group_jid("120363041234567890").unwrap(),
            Jid::group("120363041234567890")
        );
        assert!(matches!(
            group_jid("5511999999999@s.whatsapp.net"),
            Err(GatewayError::InvalidTarget(_))
        ));
        assert!(group_jid("not a group").is_err());
    }
}

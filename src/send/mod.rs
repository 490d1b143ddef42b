//! Outbound send path: request validation, media resolution and the
//! message bodies handed to a session runtime.

mod media;
mod message;
mod request;

#[cfg(test)]
mod tests;

pub use media::{sniff_mime, MediaFetcher, ResolvedMedia};
pub(crate) use message::build_message;
pub use message::vcard;
pub use request::{
    parse_reaction_target, parse_request, MediaRequest, Pending, PreparedBody, PreparedSend,
    SendKind, SendRequest, MAX_CAPTION_CHARS, MAX_TEXT_CHARS,
};

use serde::Serialize;
use wagate_core::error::GatewayError;
use wagate_core::jid::Jid;
use wagate_core::wa::{MediaType, SendResponse};

/// Body returned to the caller of a successful send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    pub id: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SendKind,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub status: &'static str,
}

impl SendResult {
    pub fn new(to: &Jid, kind: SendKind, content: String, response: &SendResponse) -> Self {
        Self {
            success: true,
            id: response.id.clone(),
            to: to.to_string(),
            kind,
            content,
            timestamp: response.timestamp.timestamp(),
            status: "sent",
        }
    }
}

/// Resolve any pending media. Runs on the caller's task so slow downloads
/// never hold up a session runtime.
pub async fn prepare(
    request: SendRequest,
    fetcher: &MediaFetcher,
) -> Result<PreparedSend, GatewayError> {
    let body = match request.body {
        Pending::Ready(body) => body,
        Pending::Media(m) => {
            let resolved = fetcher.resolve(&m.source, m.mimetype.as_deref()).await?;
            if resolved.data.is_empty() {
                return Err(GatewayError::MediaFetchFailed("media is empty".into()));
            }
            if m.media_type == MediaType::Sticker && resolved.mimetype != "image/webp" {
                return Err(GatewayError::Validation(format!(
                    "stickers must be image/webp, got {}",
                    resolved.mimetype
                )));
            }
            let file_name = match m.media_type {
                MediaType::Document => m.file_name.or(resolved.file_name),
                _ => m.file_name,
            };
            PreparedBody::Media {
                media_type: m.media_type,
                data: resolved.data,
                mimetype: resolved.mimetype,
                caption: m.caption,
                file_name,
                ptt: m.ptt,
                view_once: m.view_once,
                context: m.context,
            }
        }
    };
    Ok(PreparedSend {
        to: request.to,
        kind: request.kind,
        content: request.content,
        body,
    })
}

//! Parsing and validation of outbound send requests.
//!
//! Each message kind has its own camelCase body. Parsing produces a
//! [`SendRequest`] whose media, if any, is still unresolved; see
//! [`super::prepare`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use wagate_core::error::GatewayError;
use wagate_core::jid::{parse_target, Jid};
use wagate_core::wa::{Button, ContactCard, ContextInfo, ListRow, ListSection, MediaType};

use super::message::vcard;

pub const MAX_TEXT_CHARS: usize = 65_536;
pub const MAX_CAPTION_CHARS: usize = 1_024;
pub const MAX_BUTTONS: usize = 3;
pub const POLL_MIN_OPTIONS: usize = 2;
pub const POLL_MAX_OPTIONS: usize = 12;

/// Reaction targets written as `me:<id>` refer to our own message.
const FROM_ME_PREFIX: &str = "me:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Contacts,
    Reaction,
    Poll,
    Buttons,
    List,
    Template,
    ViewOnce,
    Edit,
    Revoke,
}

impl SendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Contacts => "contacts",
            Self::Reaction => "reaction",
            Self::Poll => "poll",
            Self::Buttons => "buttons",
            Self::List => "list",
            Self::Template => "template",
            Self::ViewOnce => "viewonce",
            Self::Edit => "edit",
            Self::Revoke => "revoke",
        }
    }

    fn media_type(&self) -> Option<MediaType> {
        match self {
            Self::Image => Some(MediaType::Image),
            Self::Video => Some(MediaType::Video),
            Self::Audio => Some(MediaType::Audio),
            Self::Document => Some(MediaType::Document),
            Self::Sticker => Some(MediaType::Sticker),
            _ => None,
        }
    }
}

impl fmt::Display for SendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "document" => Self::Document,
            "sticker" => Self::Sticker,
            "location" => Self::Location,
            "contact" => Self::Contact,
            "contacts" => Self::Contacts,
            "reaction" => Self::Reaction,
            "poll" => Self::Poll,
            "buttons" => Self::Buttons,
            "list" => Self::List,
            "template" => Self::Template,
            "viewonce" | "view_once" | "view-once" => Self::ViewOnce,
            "edit" => Self::Edit,
            "revoke" | "delete" => Self::Revoke,
            other => {
                return Err(GatewayError::Validation(format!(
                    "unknown message type '{other}'"
                )))
            }
        })
    }
}

/// Media that still has to be downloaded, decoded or read.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub media_type: MediaType,
    /// URL, data URL or server-local path.
    pub source: String,
    pub mimetype: Option<String>,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    pub ptt: bool,
    pub view_once: bool,
    pub context: Option<ContextInfo>,
}

/// Outgoing body with every input validated and every attachment in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedBody {
    Text {
        body: String,
        context: Option<ContextInfo>,
    },
    Media {
        media_type: MediaType,
        data: Vec<u8>,
        mimetype: String,
        caption: Option<String>,
        file_name: Option<String>,
        ptt: bool,
        view_once: bool,
        context: Option<ContextInfo>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
        context: Option<ContextInfo>,
    },
    Contact {
        card: ContactCard,
        context: Option<ContextInfo>,
    },
    Contacts {
        display_name: String,
        cards: Vec<ContactCard>,
    },
    Reaction {
        target_id: String,
        from_me: bool,
        participant: Option<Jid>,
        emoji: String,
    },
    Poll {
        name: String,
        options: Vec<String>,
        selectable: u32,
    },
    Buttons {
        body: String,
        footer: Option<String>,
        buttons: Vec<Button>,
        context: Option<ContextInfo>,
    },
    List {
        title: String,
        body: String,
        footer: Option<String>,
        button_text: String,
        sections: Vec<ListSection>,
        context: Option<ContextInfo>,
    },
    Edit {
        target_id: String,
        text: String,
    },
    Revoke {
        target_id: String,
        participant: Option<Jid>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    Ready(PreparedBody),
    Media(MediaRequest),
}

/// A validated send request.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub to: Jid,
    pub kind: SendKind,
    /// Human-readable summary echoed back in the response.
    pub content: String,
    pub body: Pending,
}

/// A send ready to be handed to a session runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSend {
    pub to: Jid,
    pub kind: SendKind,
    pub content: String,
    pub body: PreparedBody,
}

// --- Wire bodies ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextWire {
    #[serde(alias = "messageId", alias = "quotedMessageId")]
    stanza_id: Option<String>,
    participant: Option<String>,
    #[serde(default, alias = "mentionedJid")]
    mentions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextBody {
    #[serde(alias = "to")]
    phone: String,
    #[serde(alias = "body", alias = "message")]
    text: String,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaBody {
    #[serde(alias = "to")]
    phone: String,
    #[serde(alias = "url", alias = "file")]
    media: String,
    #[serde(alias = "mimetype")]
    mime_type: Option<String>,
    caption: Option<String>,
    #[serde(alias = "filename")]
    file_name: Option<String>,
    #[serde(default)]
    view_once: bool,
    #[serde(default)]
    ptt: bool,
    /// Required for `viewonce`, ignored otherwise.
    media_type: Option<MediaType>,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    #[serde(alias = "to")]
    phone: String,
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    address: Option<String>,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactBody {
    #[serde(alias = "to")]
    phone: String,
    #[serde(alias = "name")]
    contact_name: Option<String>,
    contact_phone: Option<String>,
    vcard: Option<String>,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactItem {
    name: Option<String>,
    phone: Option<String>,
    vcard: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactsBody {
    #[serde(alias = "to")]
    phone: String,
    display_name: Option<String>,
    contacts: Vec<ContactItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionBody {
    #[serde(alias = "to")]
    phone: String,
    message_id: String,
    #[serde(default, alias = "emoji")]
    reaction: String,
    from_me: Option<bool>,
    participant: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollBody {
    #[serde(alias = "to")]
    phone: String,
    #[serde(alias = "question")]
    name: String,
    options: Vec<String>,
    #[serde(alias = "selectableOptionsCount")]
    selectable_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ButtonWire {
    id: Option<String>,
    #[serde(alias = "displayText", alias = "title")]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ButtonsBody {
    #[serde(alias = "to")]
    phone: String,
    #[serde(alias = "body")]
    text: String,
    footer: Option<String>,
    buttons: Vec<ButtonWire>,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowWire {
    id: Option<String>,
    title: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectionWire {
    #[serde(default)]
    title: String,
    rows: Vec<RowWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBody {
    #[serde(alias = "to")]
    phone: String,
    title: String,
    #[serde(alias = "description", alias = "body")]
    text: String,
    footer: Option<String>,
    button_text: String,
    sections: Vec<SectionWire>,
    context_info: Option<ContextWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditBody {
    #[serde(alias = "to")]
    phone: String,
    message_id: String,
    #[serde(alias = "newText")]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeBody {
    #[serde(alias = "to")]
    phone: String,
    message_id: String,
    participant: Option<String>,
}

// --- Validation helpers ---

fn decode<T: DeserializeOwned>(kind: SendKind, body: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid {kind} request: {e}")))
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::Validation(msg.into())
}

fn non_empty(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} is required")));
    }
    Ok(())
}

fn max_chars(field: &str, value: &str, limit: usize) -> Result<(), GatewayError> {
    if value.chars().count() > limit {
        return Err(invalid(format!("{field} exceeds {limit} characters")));
    }
    Ok(())
}

fn optional(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn caption(value: Option<String>) -> Result<Option<String>, GatewayError> {
    let value = optional(value);
    if let Some(c) = &value {
        max_chars("caption", c, MAX_CAPTION_CHARS)?;
    }
    Ok(value)
}

fn context(to: &Jid, wire: Option<ContextWire>) -> Result<Option<ContextInfo>, GatewayError> {
    let Some(wire) = wire else {
        return Ok(None);
    };
    let participant = match optional(wire.participant) {
        Some(p) if to.is_group() => Some(parse_target(&p)?.to_non_ad()),
        _ => None,
    };
    let mentions = wire
        .mentions
        .iter()
        .map(|m| parse_target(m).map(|j| j.to_non_ad()))
        .collect::<Result<Vec<_>, _>>()?;
    let info = ContextInfo {
        stanza_id: optional(wire.stanza_id),
        participant,
        mentions,
    };
    Ok((!info.is_empty()).then_some(info))
}

/// Split an optional `me:` prefix off a message id. An explicit `from_me`
/// always wins over the prefix.
pub fn parse_reaction_target(
    message_id: &str,
    explicit_from_me: Option<bool>,
) -> Result<(String, bool), GatewayError> {
    let trimmed = message_id.trim();
    let (id, prefixed) = match trimmed.strip_prefix(FROM_ME_PREFIX) {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, false),
    };
    non_empty("messageId", id)?;
    Ok((id.to_string(), explicit_from_me.unwrap_or(prefixed)))
}

fn contact_card(
    name: Option<String>,
    phone: Option<String>,
    raw: Option<String>,
) -> Result<ContactCard, GatewayError> {
    if let Some(raw) = optional(raw) {
        if !raw.trim_start().starts_with("BEGIN:VCARD") {
            return Err(invalid("vcard must start with BEGIN:VCARD"));
        }
        let display_name = optional(name)
            .or_else(|| {
                raw.lines()
                    .find_map(|l| l.strip_prefix("FN:").map(|n| n.trim().to_string()))
            })
            .unwrap_or_default();
        return Ok(ContactCard {
            display_name,
            vcard: raw,
        });
    }
    let name = optional(name).ok_or_else(|| invalid("contact name is required"))?;
    let phone = optional(phone).ok_or_else(|| invalid("contact phone is required"))?;
    let digits = wagate_core::jid::clean_phone(&phone)
        .ok_or_else(|| GatewayError::InvalidTarget(phone.clone()))?;
    Ok(ContactCard {
        vcard: vcard(&name, &digits),
        display_name: name,
    })
}

/// Parse and validate the body of a `send/message/{kind}` request.
pub fn parse_request(kind: SendKind, body: serde_json::Value) -> Result<SendRequest, GatewayError> {
    if kind == SendKind::Template {
        return Err(GatewayError::NotImplemented("template messages".into()));
    }

    if let Some(media_type) = kind.media_type() {
        return parse_media(kind, media_type, decode(kind, body)?);
    }

    let (to, content, body) = match kind {
        SendKind::Text => {
            let b: TextBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("text", &b.text)?;
            max_chars("text", &b.text, MAX_TEXT_CHARS)?;
            let context = context(&to, b.context_info)?;
            (
                to,
                b.text.clone(),
                PreparedBody::Text {
                    body: b.text,
                    context,
                },
            )
        }
        SendKind::ViewOnce => {
            let b: MediaBody = decode(kind, body)?;
            let media_type = b
                .media_type
                .ok_or_else(|| invalid("mediaType is required for view-once messages"))?;
            return parse_media(
                kind,
                media_type,
                MediaBody {
                    view_once: true,
                    ..b
                },
            );
        }
        SendKind::Location => {
            let b: LocationBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            if !b.latitude.is_finite() || !(-90.0..=90.0).contains(&b.latitude) {
                return Err(invalid("latitude must be between -90 and 90"));
            }
            if !b.longitude.is_finite() || !(-180.0..=180.0).contains(&b.longitude) {
                return Err(invalid("longitude must be between -180 and 180"));
            }
            let context = context(&to, b.context_info)?;
            (
                to,
                format!("{},{}", b.latitude, b.longitude),
                PreparedBody::Location {
                    latitude: b.latitude,
                    longitude: b.longitude,
                    name: optional(b.name),
                    address: optional(b.address),
                    context,
                },
            )
        }
        SendKind::Contact => {
            let b: ContactBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            let card = contact_card(b.contact_name, b.contact_phone, b.vcard)?;
            let context = context(&to, b.context_info)?;
            (
                to,
                card.display_name.clone(),
                PreparedBody::Contact { card, context },
            )
        }
        SendKind::Contacts => {
            let b: ContactsBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            if b.contacts.is_empty() {
                return Err(invalid("contacts must not be empty"));
            }
            let cards = b
                .contacts
                .into_iter()
                .map(|c| contact_card(c.name, c.phone, c.vcard))
                .collect::<Result<Vec<_>, _>>()?;
            let display_name = optional(b.display_name)
                .unwrap_or_else(|| format!("{} contacts", cards.len()));
            (
                to,
                display_name.clone(),
                PreparedBody::Contacts {
                    display_name,
                    cards,
                },
            )
        }
        SendKind::Reaction => {
            let b: ReactionBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            let (target_id, from_me) = parse_reaction_target(&b.message_id, b.from_me)?;
            let participant = match optional(b.participant) {
                Some(p) => Some(parse_target(&p)?),
                None => None,
            };
            if to.is_group() && !from_me && participant.is_none() {
                return Err(invalid(
                    "participant is required to react to another member's message in a group",
                ));
            }
            (
                to,
                b.reaction.clone(),
                PreparedBody::Reaction {
                    target_id,
                    from_me,
                    participant,
                    emoji: b.reaction,
                },
            )
        }
        SendKind::Poll => {
            let b: PollBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("poll name", &b.name)?;
            let options: Vec<String> = b.options.iter().map(|o| o.trim().to_string()).collect();
            if !(POLL_MIN_OPTIONS..=POLL_MAX_OPTIONS).contains(&options.len()) {
                return Err(invalid(format!(
                    "polls need {POLL_MIN_OPTIONS} to {POLL_MAX_OPTIONS} options"
                )));
            }
            if options.iter().any(|o| o.is_empty()) {
                return Err(invalid("poll options must not be empty"));
            }
            for (i, o) in options.iter().enumerate() {
                if options[..i].contains(o) {
                    return Err(invalid(format!("duplicate poll option '{o}'")));
                }
            }
            let selectable = b.selectable_count.unwrap_or(1);
            if selectable < 1 || selectable as usize > options.len() {
                return Err(invalid(format!(
                    "selectableCount must be between 1 and {}",
                    options.len()
                )));
            }
            (
                to,
                b.name.clone(),
                PreparedBody::Poll {
                    name: b.name,
                    options,
                    selectable,
                },
            )
        }
        SendKind::Buttons => {
            let b: ButtonsBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("text", &b.text)?;
            max_chars("text", &b.text, MAX_TEXT_CHARS)?;
            if b.buttons.is_empty() || b.buttons.len() > MAX_BUTTONS {
                return Err(invalid(format!("buttons need 1 to {MAX_BUTTONS} entries")));
            }
            let mut buttons = Vec::with_capacity(b.buttons.len());
            for (i, w) in b.buttons.into_iter().enumerate() {
                non_empty("button text", &w.text)?;
                let id = optional(w.id).unwrap_or_else(|| format!("btn_{}", i + 1));
                if buttons.iter().any(|x: &Button| x.id == id) {
                    return Err(invalid(format!("duplicate button id '{id}'")));
                }
                buttons.push(Button { id, text: w.text });
            }
            let context = context(&to, b.context_info)?;
            (
                to,
                b.text.clone(),
                PreparedBody::Buttons {
                    body: b.text,
                    footer: optional(b.footer),
                    buttons,
                    context,
                },
            )
        }
        SendKind::List => {
            let b: ListBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("title", &b.title)?;
            non_empty("text", &b.text)?;
            non_empty("buttonText", &b.button_text)?;
            if b.sections.is_empty() {
                return Err(invalid("lists need at least one section"));
            }
            let mut row_n = 0;
            let mut sections = Vec::with_capacity(b.sections.len());
            for s in b.sections {
                if s.rows.is_empty() {
                    return Err(invalid("every list section needs at least one row"));
                }
                let mut rows = Vec::with_capacity(s.rows.len());
                for r in s.rows {
                    row_n += 1;
                    non_empty("row title", &r.title)?;
                    rows.push(ListRow {
                        id: optional(r.id).unwrap_or_else(|| format!("row_{row_n}")),
                        title: r.title,
                        description: optional(r.description),
                    });
                }
                sections.push(ListSection {
                    title: s.title,
                    rows,
                });
            }
            let context = context(&to, b.context_info)?;
            (
                to,
                b.text.clone(),
                PreparedBody::List {
                    title: b.title,
                    body: b.text,
                    footer: optional(b.footer),
                    button_text: b.button_text,
                    sections,
                    context,
                },
            )
        }
        SendKind::Edit => {
            let b: EditBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("messageId", &b.message_id)?;
            non_empty("text", &b.text)?;
            max_chars("text", &b.text, MAX_TEXT_CHARS)?;
            (
                to,
                b.text.clone(),
                PreparedBody::Edit {
                    target_id: b.message_id.trim().to_string(),
                    text: b.text,
                },
            )
        }
        SendKind::Revoke => {
            let b: RevokeBody = decode(kind, body)?;
            let to = parse_target(&b.phone)?;
            non_empty("messageId", &b.message_id)?;
            let participant = match optional(b.participant) {
                Some(_) if !to.is_group() => {
                    return Err(invalid(
                        "participant may only be given when revoking in a group",
                    ))
                }
                Some(p) => Some(parse_target(&p)?),
                None => None,
            };
            let target_id = b.message_id.trim().to_string();
            (
                to,
                target_id.clone(),
                PreparedBody::Revoke {
                    target_id,
                    participant,
                },
            )
        }
        // Handled above.
        SendKind::Template
        | SendKind::Image
        | SendKind::Video
        | SendKind::Audio
        | SendKind::Document
        | SendKind::Sticker => {
            return Err(GatewayError::Validation(format!("unexpected kind {kind}")))
        }
    };

    Ok(SendRequest {
        to,
        kind,
        content,
        body: Pending::Ready(body),
    })
}

fn parse_media(
    kind: SendKind,
    media_type: MediaType,
    b: MediaBody,
) -> Result<SendRequest, GatewayError> {
    let to = parse_target(&b.phone)?;
    non_empty("media", &b.media)?;
    if b.view_once && !media_type.supports_view_once() {
        return Err(invalid(format!(
            "view-once is only supported for image, video and audio, not {}",
            media_type.as_str()
        )));
    }
    if b.ptt && media_type != MediaType::Audio {
        return Err(invalid("ptt is only supported for audio"));
    }
    let caption = caption(b.caption)?;
    if caption.is_some() && matches!(media_type, MediaType::Audio | MediaType::Sticker) {
        return Err(invalid(format!(
            "{} messages cannot have a caption",
            media_type.as_str()
        )));
    }
    let context = context(&to, b.context_info)?;
    Ok(SendRequest {
        to,
        kind,
        content: caption.clone().unwrap_or_default(),
        body: Pending::Media(MediaRequest {
            media_type,
            source: b.media.trim().to_string(),
            mimetype: optional(b.mime_type),
            caption,
            file_name: optional(b.file_name),
            ptt: b.ptt,
            view_once: b.view_once,
            context,
        }),
    })
}

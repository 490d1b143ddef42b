//! Data model of the WhatsApp client library boundary.
//!
//! Outgoing message bodies, upload descriptors, inbound events, and the
//! group/contact shapes exchanged with a [`WaClient`](crate::traits::WaClient).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::jid::Jid;

/// Errors reported by the client library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaError {
    #[error("client is not connected")]
    NotConnected,
    #[error("device is not paired")]
    NotLoggedIn,
    #[error("device is already paired")]
    AlreadyLoggedIn,
    /// The websocket dropped while the request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("request timed out")]
    Timeout,
    /// The server revoked this device.
    #[error("logged out: {0}")]
    LoggedOut(String),
    #[error("media upload failed: {0}")]
    Upload(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl WaError {
    /// Whether the error means the underlying transport is gone.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// Cryptographic identity of a paired device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub jid: Jid,
    /// Opaque library-owned key material.
    pub blob: Vec<u8>,
}

/// Media categories accepted by `upload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }

    /// Only these may be sent as view-once.
    pub fn supports_view_once(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio)
    }
}

/// Result of an encrypted media upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

/// Identifies a message a reaction, edit, or revoke refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub from_me: bool,
    pub id: String,
    /// Author of the target message in a group, when not from us.
    pub participant: Option<Jid>,
}

/// Reply and mention metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextInfo {
    pub stanza_id: Option<String>,
    pub participant: Option<Jid>,
    pub mentions: Vec<Jid>,
}

impl ContextInfo {
    pub fn is_empty(&self) -> bool {
        self.stanza_id.is_none() && self.participant.is_none() && self.mentions.is_empty()
    }
}

/// An uploaded attachment ready to be referenced by a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMessage {
    pub upload: UploadInfo,
    pub mimetype: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    /// Voice note flag for audio.
    pub ptt: bool,
    pub view_once: bool,
    pub context: Option<ContextInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactCard {
    pub display_name: String,
    pub vcard: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// Outgoing message bodies the library knows how to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum WaMessage {
    Text {
        body: String,
        context: Option<ContextInfo>,
    },
    Image(MediaMessage),
    Video(MediaMessage),
    Audio(MediaMessage),
    Document(MediaMessage),
    Sticker(MediaMessage),
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
    ContactList {
        display_name: String,
        contacts: Vec<ContactCard>,
    },
    Reaction {
        key: MessageKey,
        /// Empty removes a previous reaction.
        emoji: String,
        sent_at: DateTime<Utc>,
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
        key: MessageKey,
        text: String,
    },
    Revoke {
        key: MessageKey,
    },
}

impl WaMessage {
    /// Short type label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image(_) => "image",
            Self::Video(_) => "video",
            Self::Audio(_) => "audio",
            Self::Document(_) => "document",
            Self::Sticker(_) => "sticker",
            Self::Location { .. } => "location",
            Self::Contact { .. } => "contact",
            Self::ContactList { .. } => "contacts",
            Self::Reaction { .. } => "reaction",
            Self::Poll { .. } => "poll",
            Self::Buttons { .. } => "buttons",
            Self::List { .. } => "list",
            Self::Edit { .. } => "edit",
            Self::Revoke { .. } => "revoke",
        }
    }

    /// Wrap an upload in the message type matching `media_type`.
    pub fn media(media_type: MediaType, media: MediaMessage) -> Self {
        match media_type {
            MediaType::Image => Self::Image(media),
            MediaType::Video => Self::Video(media),
            MediaType::Audio => Self::Audio(media),
            MediaType::Document => Self::Document(media),
            MediaType::Sticker => Self::Sticker(media),
        }
    }
}

/// Build a reaction to `target_id` in `chat`.
///
/// `sender` is the author of the target message; it is only kept when the
/// chat is a group and the target is not our own message.
pub fn build_reaction(
    chat: &Jid,
    sender: Option<&Jid>,
    target_id: &str,
    from_me: bool,
    emoji: &str,
) -> WaMessage {
    let participant = if chat.is_group() && !from_me {
        sender.map(Jid::to_non_ad)
    } else {
        None
    };
    WaMessage::Reaction {
        key: MessageKey {
            remote_jid: chat.clone(),
            from_me,
            id: target_id.to_string(),
            participant,
        },
        emoji: emoji.to_string(),
        sent_at: Utc::now(),
    }
}

/// Build a poll creation message.
pub fn build_poll(name: &str, options: &[String], selectable: u32) -> WaMessage {
    WaMessage::Poll {
        name: name.to_string(),
        options: options.to_vec(),
        selectable,
    }
}

/// Build an edit of one of our own messages.
pub fn build_edit(chat: &Jid, target_id: &str, text: &str) -> WaMessage {
    WaMessage::Edit {
        key: MessageKey {
            remote_jid: chat.clone(),
            from_me: true,
            id: target_id.to_string(),
            participant: None,
        },
        text: text.to_string(),
    }
}

/// Build a revoke ("delete for everyone").
///
/// Revoking someone else's message is only possible as a group admin, in which
/// case `participant` names the author.
pub fn build_revoke(chat: &Jid, target_id: &str, participant: Option<&Jid>) -> WaMessage {
    WaMessage::Revoke {
        key: MessageKey {
            remote_jid: chat.clone(),
            from_me: participant.is_none(),
            id: target_id.to_string(),
            participant: participant.map(Jid::to_non_ad),
        },
    }
}

/// Response to a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    /// Server-visible message id.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Option<Jid>,
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Events multiplexed on a client's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WaEvent {
    /// Logged in and online.
    Connected,
    /// The transport dropped unexpectedly.
    Disconnected { reason: String },
    /// New pairing QR code, valid for `timeout`.
    Qr { code: String, timeout: Duration },
    /// No further QR codes will be issued for this pairing attempt.
    QrExhausted,
    PairSuccess { device: DeviceIdentity },
    PairError { reason: String },
    /// The server revoked this device.
    LoggedOut { reason: String },
    Message(InboundMessage),
    Receipt(Receipt),
    Presence(Presence),
    Group(GroupUpdate),
    Call(CallEvent),
    HistorySync(HistorySync),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMedia {
    pub media_type: MediaType,
    pub mimetype: String,
    pub file_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub from_me: bool,
    pub is_group: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<InboundMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
    Played,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub chat: Jid,
    pub sender: Jid,
    pub message_ids: Vec<String>,
    pub kind: ReceiptKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub from: Jid,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    pub group: Jid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Jid>,
    /// e.g. `add`, `remove`, `promote`, `demote`, `subject`, `topic`.
    pub action: String,
    pub participants: Vec<Jid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub from: Jid,
    pub call_id: String,
    /// `offer`, `accept`, or `terminate`.
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySync {
    pub sync_type: String,
    pub conversations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
}

// ---------------------------------------------------------------------------
// Groups and contacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupParticipant {
    pub jid: Jid,
    pub is_admin: bool,
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub jid: Jid,
    pub name: String,
    pub topic: Option<String>,
    pub owner: Option<Jid>,
    pub created_at: Option<DateTime<Utc>>,
    pub participants: Vec<GroupParticipant>,
    /// Only admins may edit group info.
    pub locked: bool,
    /// Only admins may send messages.
    pub announce: bool,
    /// Disappearing-message timer in seconds, 0 when off.
    pub ephemeral_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChange {
    pub jid: Jid,
    /// Per-participant result code; 200 on success.
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnWhatsApp {
    pub query: String,
    pub jid: Option<Jid>,
    pub is_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub jid: Jid,
    pub status: Option<String>,
    pub picture_id: Option<String>,
    pub verified_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarInfo {
    pub id: String,
    pub url: String,
    pub direct_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactEntry {
    pub jid: Jid,
    pub full_name: Option<String>,
    pub push_name: Option<String>,
    pub business_name: Option<String>,
}

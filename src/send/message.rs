//! Turning prepared bodies into library messages.

use wagate_core::jid::Jid;
use wagate_core::traits::WaClient;
use wagate_core::wa::{
    build_edit, build_poll, build_reaction, build_revoke, MediaMessage, WaError, WaMessage,
};

use super::request::PreparedBody;

fn escape_vcard(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// vCard 3.0 for a single phone number. `digits` must already be clean.
pub fn vcard(name: &str, digits: &str) -> String {
    format!(
        "BEGIN:VCARD\nVERSION:3.0\nFN:{}\nTEL;type=CELL;type=VOICE;waid={digits}:+{digits}\nEND:VCARD",
        escape_vcard(name)
    )
}

/// Build the library message for `body`, uploading media first.
///
/// Runs inside the session runtime, which owns the client.
pub(crate) async fn build_message(
    client: &dyn WaClient,
    to: &Jid,
    body: PreparedBody,
) -> Result<WaMessage, WaError> {
    Ok(match body {
        PreparedBody::Text { body, context } => WaMessage::Text { body, context },
        PreparedBody::Media {
            media_type,
            data,
            mimetype,
            caption,
            file_name,
            ptt,
            view_once,
            context,
        } => {
            let upload = client
                .upload(&data, media_type)
                .await
                .map_err(|e| match e {
                    WaError::Upload(_)
                    | WaError::ConnectionLost(_)
                    | WaError::NotConnected
                    | WaError::NotLoggedIn
                    | WaError::LoggedOut(_) => e,
                    other => WaError::Upload(other.to_string()),
                })?;
            WaMessage::media(
                media_type,
                MediaMessage {
                    upload,
                    mimetype,
                    caption,
                    file_name,
                    ptt,
                    view_once,
                    context,
                },
            )
        }
        PreparedBody::Location {
            latitude,
            longitude,
            name,
            address,
            context,
        } => WaMessage::Location {
            latitude,
            longitude,
            name,
            address,
            context,
        },
        PreparedBody::Contact { card, context } => WaMessage::Contact { card, context },
        PreparedBody::Contacts {
            display_name,
            cards,
        } => WaMessage::ContactList {
            display_name,
            contacts: cards,
        },
        PreparedBody::Reaction {
            target_id,
            from_me,
            participant,
            emoji,
        } => build_reaction(to, participant.as_ref(), &target_id, from_me, &emoji),
        PreparedBody::Poll {
            name,
            options,
            selectable,
        } => build_poll(&name, &options, selectable),
        PreparedBody::Buttons {
            body,
            footer,
            buttons,
            context,
        } => WaMessage::Buttons {
            body,
            footer,
            buttons,
            context,
        },
        PreparedBody::List {
            title,
            body,
            footer,
            button_text,
            sections,
            context,
        } => WaMessage::List {
            title,
            body,
            footer,
            button_text,
            sections,
            context,
        },
        PreparedBody::Edit { target_id, text } => build_edit(to, &target_id, &text),
        PreparedBody::Revoke {
            target_id,
            participant,
        } => build_revoke(to, &target_id, participant.as_ref()),
    })
}

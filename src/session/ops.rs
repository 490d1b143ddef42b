//! Group and contact operations executed inside a session runtime.

use serde::Serialize;
use std::time::Duration;
use wagate_core::jid::Jid;
use wagate_core::traits::WaClient;
use wagate_core::wa::{
    AvatarInfo, ContactEntry, GroupInfo, OnWhatsApp, ParticipantAction, ParticipantChange,
    UserInfo, WaError,
};

#[derive(Debug, Clone)]
pub enum GroupOp {
    Create { name: String, participants: Vec<Jid> },
    Info { group: Jid },
    List,
    InviteLink { group: Jid, reset: bool },
    Join { code: String },
    Participants {
        group: Jid,
        participants: Vec<Jid>,
        action: ParticipantAction,
    },
    SetName { group: Jid, name: String },
    SetTopic { group: Jid, topic: String },
    SetPhoto { group: Jid, jpeg: Vec<u8> },
    Settings {
        group: Jid,
        locked: Option<bool>,
        announce: Option<bool>,
        disappearing: Option<Duration>,
    },
    Leave { group: Jid },
}

impl GroupOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Info { .. } => "info",
            Self::List => "list",
            Self::InviteLink { .. } => "invite_link",
            Self::Join { .. } => "join",
            Self::Participants { .. } => "participants",
            Self::SetName { .. } => "set_name",
            Self::SetTopic { .. } => "set_topic",
            Self::SetPhoto { .. } => "set_photo",
            Self::Settings { .. } => "settings",
            Self::Leave { .. } => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GroupReply {
    Info(GroupInfo),
    List(Vec<GroupInfo>),
    InviteLink(String),
    Joined(Jid),
    Participants(Vec<ParticipantChange>),
    PictureId(String),
    Done,
}

#[derive(Debug, Clone)]
pub enum ContactOp {
    Check { phones: Vec<String> },
    Info { jids: Vec<Jid> },
    Avatar { jid: Jid, preview: bool },
    List,
}

impl ContactOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Check { .. } => "check",
            Self::Info { .. } => "info",
            Self::Avatar { .. } => "avatar",
            Self::List => "list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContactReply {
    Check(Vec<OnWhatsApp>),
    Info(Vec<UserInfo>),
    Avatar(Option<AvatarInfo>),
    List(Vec<ContactEntry>),
}

pub(crate) async fn run_group_op(client: &dyn WaClient, op: GroupOp) -> Result<GroupReply, WaError> {
    Ok(match op {
        GroupOp::Create { name, participants } => {
            GroupReply::Info(client.create_group(&name, &participants).await?)
        }
        GroupOp::Info { group } => GroupReply::Info(client.group_info(&group).await?),
        GroupOp::List => GroupReply::List(client.joined_groups().await?),
        GroupOp::InviteLink { group, reset } => {
            GroupReply::InviteLink(client.group_invite_link(&group, reset).await?)
        }
        GroupOp::Join { code } => GroupReply::Joined(client.join_group_with_link(&code).await?),
        GroupOp::Participants {
            group,
            participants,
            action,
        } => GroupReply::Participants(
            client
                .update_group_participants(&group, &participants, action)
                .await?,
        ),
        GroupOp::SetName { group, name } => {
            client.set_group_name(&group, &name).await?;
            GroupReply::Done
        }
        GroupOp::SetTopic { group, topic } => {
            client.set_group_topic(&group, &topic).await?;
            GroupReply::Done
        }
        GroupOp::SetPhoto { group, jpeg } => {
            GroupReply::PictureId(client.set_group_photo(&group, &jpeg).await?)
        }
        GroupOp::Settings {
            group,
            locked,
            announce,
            disappearing,
        } => {
            if let Some(locked) = locked {
                client.set_group_locked(&group, locked).await?;
            }
            if let Some(announce) = announce {
                client.set_group_announce(&group, announce).await?;
            }
            if let Some(timer) = disappearing {
                client.set_disappearing_timer(&group, timer).await?;
            }
            GroupReply::Done
        }
        GroupOp::Leave { group } => {
            client.leave_group(&group).await?;
            GroupReply::Done
        }
    })
}

pub(crate) async fn run_contact_op(
    client: &dyn WaClient,
    op: ContactOp,
) -> Result<ContactReply, WaError> {
    Ok(match op {
        ContactOp::Check { phones } => ContactReply::Check(client.is_on_whatsapp(&phones).await?),
        ContactOp::Info { jids } => ContactReply::Info(client.user_info(&jids).await?),
        ContactOp::Avatar { jid, preview } => {
            ContactReply::Avatar(client.avatar(&jid, preview).await?)
        }
        ContactOp::List => ContactReply::List(client.contacts().await?),
    })
}

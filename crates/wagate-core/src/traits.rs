use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::jid::Jid;
use crate::session::{ProxyConfig, SessionId};
use crate::wa::{
    AvatarInfo, ContactEntry, DeviceIdentity, GroupInfo, MediaType, OnWhatsApp,
    ParticipantAction, ParticipantChange, SendResponse, UploadInfo, UserInfo, WaError, WaEvent,
    WaMessage,
};

/// One WhatsApp device connection.
///
/// Every method may be called only from the owning session runtime. Events are
/// delivered on the receiver returned alongside the client by
/// [`ClientFactory::new_client`].
#[async_trait]
pub trait WaClient: Send + Sync {
    /// Open the transport. Without a stored device this starts QR pairing.
    async fn connect(&self) -> Result<(), WaError>;

    /// Close the transport, keeping the pairing.
    async fn disconnect(&self);

    /// Unlink this device from the account.
    async fn logout(&self) -> Result<(), WaError>;

    /// Whether the transport is currently up.
    fn is_connected(&self) -> bool;

    /// Address of the paired device, if any.
    fn own_jid(&self) -> Option<Jid>;

    /// Request a pair code for `phone`. Needs an open, unpaired transport.
    async fn pair_phone(&self, phone: &str, client_name: &str) -> Result<String, WaError>;

    /// Send a message. The returned id is the one the server will echo back.
    async fn send(&self, to: &Jid, message: WaMessage) -> Result<SendResponse, WaError>;

    /// Encrypt and upload an attachment.
    async fn upload(&self, data: &[u8], media_type: MediaType) -> Result<UploadInfo, WaError>;

    // --- Groups ---

    async fn create_group(&self, name: &str, participants: &[Jid]) -> Result<GroupInfo, WaError>;

    async fn group_info(&self, group: &Jid) -> Result<GroupInfo, WaError>;

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, WaError>;

    /// Current invite link; `reset` revokes the old one first.
    async fn group_invite_link(&self, group: &Jid, reset: bool) -> Result<String, WaError>;

    async fn join_group_with_link(&self, code: &str) -> Result<Jid, WaError>;

    async fn update_group_participants(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<Vec<ParticipantChange>, WaError>;

    async fn set_group_name(&self, group: &Jid, name: &str) -> Result<(), WaError>;

    async fn set_group_topic(&self, group: &Jid, topic: &str) -> Result<(), WaError>;

    /// Returns the new picture id.
    async fn set_group_photo(&self, group: &Jid, jpeg: &[u8]) -> Result<String, WaError>;

    async fn set_group_locked(&self, group: &Jid, locked: bool) -> Result<(), WaError>;

    async fn set_group_announce(&self, group: &Jid, announce: bool) -> Result<(), WaError>;

    async fn set_disappearing_timer(&self, chat: &Jid, timer: Duration) -> Result<(), WaError>;

    async fn leave_group(&self, group: &Jid) -> Result<(), WaError>;

    // --- Contacts ---

    async fn is_on_whatsapp(&self, phones: &[String]) -> Result<Vec<OnWhatsApp>, WaError>;

    async fn user_info(&self, jids: &[Jid]) -> Result<Vec<UserInfo>, WaError>;

    async fn avatar(&self, jid: &Jid, preview: bool) -> Result<Option<AvatarInfo>, WaError>;

    async fn contacts(&self) -> Result<Vec<ContactEntry>, WaError>;
}

/// Parameters for building a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub session_id: SessionId,
    /// Stored identity; `None` yields a fresh device that must pair.
    pub device: Option<DeviceIdentity>,
    pub proxy: Option<ProxyConfig>,
}

/// Creates WhatsApp clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn new_client(
        &self,
        options: ClientOptions,
    ) -> Result<(Arc<dyn WaClient>, mpsc::UnboundedReceiver<WaEvent>), WaError>;
}

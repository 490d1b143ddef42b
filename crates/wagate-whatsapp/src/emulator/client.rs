//! The emulated device connection.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wagate_core::jid::{clean_phone, Jid};
use wagate_core::session::SessionId;
use wagate_core::traits::WaClient;
use wagate_core::wa::{
    AvatarInfo, ContactEntry, DeviceIdentity, GroupInfo, GroupParticipant, MediaType,
    OnWhatsApp, ParticipantAction, ParticipantChange, SendResponse, UploadInfo, UserInfo,
    WaError, WaEvent, WaMessage,
};

use super::{lock, new_message_id, random_digits, EmulatorConfig, Shared};

const PAIR_CODE_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";

/// A message the emulated server accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
    pub to: Jid,
    pub message: WaMessage,
    pub timestamp: DateTime<Utc>,
}

struct GroupState {
    info: GroupInfo,
    invite_code: Option<String>,
}

#[derive(Default)]
struct ClientState {
    device: Option<DeviceIdentity>,
    connected: bool,
    pairing_phone: Option<String>,
    sent: Vec<SentMessage>,
    groups: HashMap<String, GroupState>,
    contacts: Vec<ContactEntry>,
}

/// Emulated device connection. See the module docs.
pub struct EmulatedClient {
    session_id: SessionId,
    config: EmulatorConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<WaEvent>,
    state: Arc<Mutex<ClientState>>,
    pairing: Mutex<Option<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_send_error: Mutex<Option<WaError>>,
    empty_ids: AtomicBool,
}

/// Decrements the in-flight counter even when the send future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EmulatedClient {
    pub(crate) fn new(
        session_id: SessionId,
        device: Option<DeviceIdentity>,
        config: EmulatorConfig,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> Self {
        Self {
            session_id,
            config,
            shared,
            events,
            state: Arc::new(Mutex::new(ClientState {
                device,
                ..Default::default()
            })),
            pairing: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_send_error: Mutex::new(None),
            empty_ids: AtomicBool::new(false),
        }
    }

    // --- Test and development hooks ---

    /// Complete QR pairing as if the phone scanned the current code.
    pub fn scan(&self) -> Result<Jid, WaError> {
        self.stop_pairing();
        complete_pairing(&self.state, &self.events, &self.shared, None)
    }

    /// Complete phone-number pairing as if the code was typed on the phone.
    pub fn confirm_pair_code(&self) -> Result<Jid, WaError> {
        let phone = lock(&self.state)
            .pairing_phone
            .clone()
            .ok_or_else(|| WaError::Other("no pair code requested".into()))?;
        self.stop_pairing();
        complete_pairing(&self.state, &self.events, &self.shared, Some(phone))
    }

    /// Deliver an arbitrary event as if it came from the server.
    pub fn inject(&self, event: WaEvent) {
        let _ = self.events.send(event);
    }

    /// Drop the transport unexpectedly.
    pub fn drop_connection(&self, reason: &str) {
        self.stop_pairing();
        lock(&self.state).connected = false;
        let _ = self.events.send(WaEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Revoke the device from the server side.
    pub fn unpair(&self, reason: &str) {
        self.stop_pairing();
        {
            let mut st = lock(&self.state);
            st.connected = false;
            st.device = None;
        }
        let _ = self.events.send(WaEvent::LoggedOut {
            reason: reason.to_string(),
        });
    }

    /// Make the next send fail with `error`.
    pub fn fail_next_send(&self, error: WaError) {
        *lock(&self.next_send_error) = Some(error);
    }

    /// Make sends succeed without returning a message id.
    pub fn set_empty_ids(&self, empty: bool) {
        self.empty_ids.store(empty, Ordering::SeqCst);
    }

    pub fn add_contact(&self, contact: ContactEntry) {
        lock(&self.state).contacts.push(contact);
    }

    /// Every message accepted so far, in acceptance order.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.state).sent.clone()
    }

    /// Highest number of sends observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_pairing(&self) -> bool {
        lock(&self.pairing)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn stop_pairing(&self) {
        if let Some(handle) = lock(&self.pairing).take() {
            handle.abort();
        }
    }

    fn start_pairing(&self) {
        self.stop_pairing();
        let state = self.state.clone();
        let events = self.events.clone();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let session_id = self.session_id;
        let handle = tokio::spawn(async move {
            run_pairing(session_id, config, state, events, shared).await;
        });
        *lock(&self.pairing) = Some(handle);
    }

    fn require_online(&self) -> Result<(), WaError> {
        let st = lock(&self.state);
        if !st.connected {
            return Err(WaError::NotConnected);
        }
        if st.device.is_none() {
            return Err(WaError::NotLoggedIn);
        }
        Ok(())
    }

    fn with_group<T>(
        &self,
        group: &Jid,
        f: impl FnOnce(&mut GroupState) -> Result<T, WaError>,
    ) -> Result<T, WaError> {
        self.require_online()?;
        let mut st = lock(&self.state);
        let entry = st
            .groups
            .get_mut(&group.to_string())
            .ok_or_else(|| WaError::NotFound(format!("group {group}")))?;
        f(entry)
    }
}

impl Drop for EmulatedClient {
    fn drop(&mut self) {
        self.stop_pairing();
    }
}

/// QR rotation loop for one pairing attempt.
async fn run_pairing(
    session_id: SessionId,
    config: EmulatorConfig,
    state: Arc<Mutex<ClientState>>,
    events: mpsc::UnboundedSender<WaEvent>,
    shared: Arc<Shared>,
) {
    let auto_pair = config
        .auto_pair_after
        .map(|d| tokio::time::Instant::now() + d);
    let pairing_ref = BASE64.encode(rand::random::<[u8; 16]>());

    for i in 0..config.qr_rotations {
        let ttl = if i == 0 {
            config.qr_first_ttl
        } else {
            config.qr_rotation_ttl
        };
        let code = format!(
            "2@{},{},{},{}",
            pairing_ref,
            BASE64.encode(rand::random::<[u8; 32]>()),
            BASE64.encode(rand::random::<[u8; 32]>()),
            BASE64.encode(rand::random::<[u8; 16]>()),
        );
        debug!(session_id = %session_id, rotation = i, "emulated QR issued");
        if events.send(WaEvent::Qr { code, timeout: ttl }).is_err() {
            return;
        }

        let rotate = tokio::time::sleep(ttl);
        match auto_pair {
            Some(at) => {
                tokio::select! {
                    _ = rotate => {}
                    _ = tokio::time::sleep_until(at) => {
                        if let Err(e) = complete_pairing(&state, &events, &shared, None) {
                            warn!(session_id = %session_id, "emulated auto-pair failed: {e}");
                        }
                        return;
                    }
                }
            }
            None => rotate.await,
        }
    }

    info!(session_id = %session_id, "emulated pairing abandoned after {} QR codes", config.qr_rotations);
    lock(&state).connected = false;
    let _ = events.send(WaEvent::QrExhausted);
}

/// Mint a device identity and log in.
fn complete_pairing(
    state: &Mutex<ClientState>,
    events: &mpsc::UnboundedSender<WaEvent>,
    shared: &Shared,
    phone: Option<String>,
) -> Result<Jid, WaError> {
    let device = {
        let mut st = lock(state);
        if st.device.is_some() {
            return Err(WaError::AlreadyLoggedIn);
        }
        if !st.connected {
            return Err(WaError::NotConnected);
        }
        let user = phone
            .or_else(|| st.pairing_phone.take())
            .unwrap_or_else(|| format!("5511{}", random_digits(9)));
        let jid = Jid::user(user).with_device(shared.next_device());
        let mut blob = vec![0u8; 64];
        rand::thread_rng().fill(&mut blob[..]);
        let device = DeviceIdentity { jid, blob };
        st.device = Some(device.clone());
        device
    };
    let jid = device.jid.clone();
    let _ = events.send(WaEvent::PairSuccess { device });
    let _ = events.send(WaEvent::Connected);
    Ok(jid)
}

fn pair_code() -> String {
    let mut rng = rand::thread_rng();
    let chars: String = (0..8)
        .map(|_| char::from(PAIR_CODE_ALPHABET[rng.gen_range(0..PAIR_CODE_ALPHABET.len())]))
        .collect();
    format!("{}-{}", &chars[..4], &chars[4..])
}

#[async_trait]
impl WaClient for EmulatedClient {
    async fn connect(&self) -> Result<(), WaError> {
        if self.shared.take_connect_failure(self.session_id) {
            return Err(WaError::ConnectionLost(
                "emulated connection failure".into(),
            ));
        }
        let paired = {
            let mut st = lock(&self.state);
            if st.connected {
                return Ok(());
            }
            st.connected = true;
            st.device.is_some()
        };
        if paired {
            let _ = self.events.send(WaEvent::Connected);
        } else {
            self.start_pairing();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop_pairing();
        lock(&self.state).connected = false;
    }

    async fn logout(&self) -> Result<(), WaError> {
        self.require_online()?;
        let mut st = lock(&self.state);
        st.device = None;
        st.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn own_jid(&self) -> Option<Jid> {
        lock(&self.state).device.as_ref().map(|d| d.jid.clone())
    }

    async fn pair_phone(&self, phone: &str, client_name: &str) -> Result<String, WaError> {
        let digits =
            clean_phone(phone).ok_or_else(|| WaError::Other(format!("invalid phone '{phone}'")))?;
        let mut st = lock(&self.state);
        if st.device.is_some() {
            return Err(WaError::AlreadyLoggedIn);
        }
        if !st.connected {
            return Err(WaError::NotConnected);
        }
        st.pairing_phone = Some(digits);
        debug!(session_id = %self.session_id, client = client_name, "emulated pair code issued");
        Ok(pair_code())
    }

    async fn send(&self, to: &Jid, message: WaMessage) -> Result<SendResponse, WaError> {
        if let Some(err) = lock(&self.next_send_error).take() {
            if err.is_transport_loss() {
                lock(&self.state).connected = false;
            }
            return Err(err);
        }
        self.require_online()?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.config.send_latency).await;

        let id = if self.empty_ids.load(Ordering::SeqCst) {
            String::new()
        } else {
            new_message_id()
        };
        let timestamp = Utc::now().trunc_subsecs(0);
        let mut st = lock(&self.state);
        let sender = st.device.as_ref().map(|d| d.jid.clone());
        debug!(session_id = %self.session_id, to = %to, kind = message.kind(), id = %id, "emulated send");
        st.sent.push(SentMessage {
            id: id.clone(),
            to: to.clone(),
            message,
            timestamp,
        });
        Ok(SendResponse {
            id,
            timestamp,
            sender,
        })
    }

    async fn upload(&self, data: &[u8], media_type: MediaType) -> Result<UploadInfo, WaError> {
        self.require_online()?;
        if data.is_empty() {
            return Err(WaError::Upload("empty media".into()));
        }
        let media_key: [u8; 32] = rand::random();
        let file_sha256 = Sha256::digest(data).to_vec();
        let mut hasher = Sha256::new();
        hasher.update(media_key);
        hasher.update(data);
        let file_enc_sha256 = hasher.finalize().to_vec();
        let token = hex::encode(&file_enc_sha256[..12]);
        Ok(UploadInfo {
            url: format!(
                "https://mmg.whatsapp.net/v/t62.7118-24/{token}?type={}",
                media_type.as_str()
            ),
            direct_path: format!("/v/t62.7118-24/{token}"),
            media_key: media_key.to_vec(),
            file_sha256,
            file_enc_sha256,
            file_length: data.len() as u64,
        })
    }

    async fn create_group(&self, name: &str, participants: &[Jid]) -> Result<GroupInfo, WaError> {
        self.require_online()?;
        if name.trim().is_empty() || name.chars().count() > 100 {
            return Err(WaError::Other("group name must be 1 to 100 characters".into()));
        }
        let own = self.own_jid().ok_or(WaError::NotLoggedIn)?.to_non_ad();
        let jid = Jid::group(format!("120363{}", random_digits(12)));
        let mut members = vec![GroupParticipant {
            jid: own.clone(),
            is_admin: true,
            is_super_admin: true,
        }];
        members.extend(participants.iter().map(|p| GroupParticipant {
            jid: p.to_non_ad(),
            is_admin: false,
            is_super_admin: false,
        }));
        let info = GroupInfo {
            jid: jid.clone(),
            name: name.to_string(),
            topic: None,
            owner: Some(own),
            created_at: Some(Utc::now().trunc_subsecs(0)),
            participants: members,
            locked: false,
            announce: false,
            ephemeral_secs: 0,
        };
        lock(&self.state).groups.insert(
            jid.to_string(),
            GroupState {
                info: info.clone(),
                invite_code: None,
            },
        );
        Ok(info)
    }

    async fn group_info(&self, group: &Jid) -> Result<GroupInfo, WaError> {
        self.with_group(group, |g| Ok(g.info.clone()))
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, WaError> {
        self.require_online()?;
        let st = lock(&self.state);
        let mut groups: Vec<GroupInfo> = st.groups.values().map(|g| g.info.clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn group_invite_link(&self, group: &Jid, reset: bool) -> Result<String, WaError> {
        self.with_group(group, |g| {
            if reset || g.invite_code.is_none() {
                g.invite_code = Some(BASE64.encode(rand::random::<[u8; 16]>()).replace(['+', '/', '='], ""));
            }
            Ok(format!(
                "https://chat.whatsapp.com/{}",
                g.invite_code.as_deref().unwrap_or_default()
            ))
        })
    }

    async fn join_group_with_link(&self, code: &str) -> Result<Jid, WaError> {
        self.require_online()?;
        let own = self.own_jid().ok_or(WaError::NotLoggedIn)?.to_non_ad();
        let mut st = lock(&self.state);
        let group = st
            .groups
            .values_mut()
            .find(|g| g.invite_code.as_deref() == Some(code))
            .ok_or_else(|| WaError::NotFound(format!("invite {code}")))?;
        if !group.info.participants.iter().any(|p| p.jid == own) {
            group.info.participants.push(GroupParticipant {
                jid: own,
                is_admin: false,
                is_super_admin: false,
            });
        }
        Ok(group.info.jid.clone())
    }

    async fn update_group_participants(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<Vec<ParticipantChange>, WaError> {
        self.with_group(group, |g| {
            let members = &mut g.info.participants;
            let changes = participants
                .iter()
                .map(|p| {
                    let jid = p.to_non_ad();
                    let pos = members.iter().position(|m| m.jid == jid);
                    let status = match (action, pos) {
                        (ParticipantAction::Add, Some(_)) => 409,
                        (ParticipantAction::Add, None) => {
                            members.push(GroupParticipant {
                                jid: jid.clone(),
                                is_admin: false,
                                is_super_admin: false,
                            });
                            200
                        }
                        (_, None) => 404,
                        (ParticipantAction::Remove, Some(i)) => {
                            members.remove(i);
                            200
                        }
                        (ParticipantAction::Promote, Some(i)) => {
                            members[i].is_admin = true;
                            200
                        }
                        (ParticipantAction::Demote, Some(i)) => {
                            members[i].is_admin = false;
                            200
                        }
                    };
                    ParticipantChange { jid, status }
                })
                .collect();
            Ok(changes)
        })
    }

    async fn set_group_name(&self, group: &Jid, name: &str) -> Result<(), WaError> {
        if name.trim().is_empty() {
            return Err(WaError::Other("group name must not be empty".into()));
        }
        self.with_group(group, |g| {
            g.info.name = name.to_string();
            Ok(())
        })
    }

    async fn set_group_topic(&self, group: &Jid, topic: &str) -> Result<(), WaError> {
        self.with_group(group, |g| {
            g.info.topic = if topic.is_empty() {
                None
            } else {
                Some(topic.to_string())
            };
            Ok(())
        })
    }

    async fn set_group_photo(&self, group: &Jid, jpeg: &[u8]) -> Result<String, WaError> {
        if !jpeg.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Err(WaError::Other("group photo must be a JPEG image".into()));
        }
        self.with_group(group, |_| Ok(Utc::now().timestamp().to_string()))
    }

    async fn set_group_locked(&self, group: &Jid, locked: bool) -> Result<(), WaError> {
        self.with_group(group, |g| {
            g.info.locked = locked;
            Ok(())
        })
    }

    async fn set_group_announce(&self, group: &Jid, announce: bool) -> Result<(), WaError> {
        self.with_group(group, |g| {
            g.info.announce = announce;
            Ok(())
        })
    }

    async fn set_disappearing_timer(&self, chat: &Jid, timer: Duration) -> Result<(), WaError> {
        if !chat.is_group() {
            return self.require_online();
        }
        self.with_group(chat, |g| {
            g.info.ephemeral_secs = u32::try_from(timer.as_secs()).unwrap_or(u32::MAX);
            Ok(())
        })
    }

    async fn leave_group(&self, group: &Jid) -> Result<(), WaError> {
        self.require_online()?;
        lock(&self.state)
            .groups
            .remove(&group.to_string())
            .map(|_| ())
            .ok_or_else(|| WaError::NotFound(format!("group {group}")))
    }

    async fn is_on_whatsapp(&self, phones: &[String]) -> Result<Vec<OnWhatsApp>, WaError> {
        self.require_online()?;
        Ok(phones
            .iter()
            .map(|query| {
                let jid = clean_phone(query).filter(|d| d.len() >= 8).map(Jid::user);
                OnWhatsApp {
                    query: query.clone(),
                    is_in: jid.is_some(),
                    jid,
                }
            })
            .collect())
    }

    async fn user_info(&self, jids: &[Jid]) -> Result<Vec<UserInfo>, WaError> {
        self.require_online()?;
        Ok(jids
            .iter()
            .map(|jid| UserInfo {
                jid: jid.to_non_ad(),
                status: Some("Hey there! I am using WhatsApp.".to_string()),
                picture_id: Some(format!("{}", 1_700_000_000u64 + jid.user.len() as u64)),
                verified_name: None,
            })
            .collect())
    }

    async fn avatar(&self, jid: &Jid, preview: bool) -> Result<Option<AvatarInfo>, WaError> {
        self.require_online()?;
        let suffix = if preview { "_preview" } else { "" };
        let path = format!("/v/t61.24694-24/{}{}.jpg", jid.user, suffix);
        Ok(Some(AvatarInfo {
            id: format!("{}", 1_700_000_000u64 + jid.user.len() as u64),
            url: format!("https://pps.whatsapp.net{path}"),
            direct_path: path,
        }))
    }

    async fn contacts(&self) -> Result<Vec<ContactEntry>, WaError> {
        self.require_online()?;
        Ok(lock(&self.state).contacts.clone())
    }
}

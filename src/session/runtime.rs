//! Session runtime: a per-session actor that owns one WhatsApp client.
//!
//! Every operation touching the client is a [`Command`] processed by a single
//! task, so commands, inbound events and reconnect timers never race. The
//! runtime publishes its live status and the current pairing QR through watch
//! channels, which lets [`RuntimeHandle`] answer status and QR queries without
//! a round trip through the command queue.

use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wagate_core::config::{SessionConfig, WhatsAppConfig};
use wagate_core::error::GatewayError;
use wagate_core::event::EventType;
use wagate_core::jid::clean_phone;
use wagate_core::session::{ConnectionState, ProxyConfig, SessionId, SessionRecord};
use wagate_core::traits::{ClientFactory, ClientOptions, WaClient};
use wagate_core::wa::{DeviceIdentity, SendResponse, WaError, WaEvent};
use wagate_store::Store;

use super::ops::{run_contact_op, run_group_op, ContactOp, ContactReply, GroupOp, GroupReply};
use super::qr::{QrBroker, QrCode};
use super::reconnect::ReconnectPolicy;
use crate::events::Dispatcher;
use crate::send::{build_message, PreparedSend};

/// Inbound messages refresh `last_seen` at most this often.
const LAST_SEEN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default deadline for a send.
    pub send_timeout: Duration,
    /// Default wait for a QR code.
    pub qr_wait: Duration,
    pub reconnect: ReconnectPolicy,
    /// Name shown on the phone when pairing by code.
    pub device_name: String,
    pub command_buffer: usize,
}

impl RuntimeConfig {
    pub fn new(session: &SessionConfig, whatsapp: &WhatsAppConfig) -> Self {
        Self {
            send_timeout: session.send_timeout(),
            qr_wait: session.qr_wait(),
            reconnect: ReconnectPolicy::from(&session.reconnect),
            device_name: whatsapp.device_name.clone(),
            command_buffer: session.command_buffer.max(1),
        }
    }
}

/// Collaborators shared by every runtime.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub store: Store,
    pub dispatcher: Dispatcher,
    pub factory: Arc<dyn ClientFactory>,
    pub config: RuntimeConfig,
}

/// Live view of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub state: ConnectionState,
    pub device_jid: Option<String>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

const PENDING: u8 = 0;
const SUBMITTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a send reaches the library or is dropped
/// because its caller gave up first.
#[derive(Debug)]
pub struct SendLatch(AtomicU8);

impl Default for SendLatch {
    fn default() -> Self {
        Self(AtomicU8::new(PENDING))
    }
}

impl SendLatch {
    /// Runtime side. False when the caller already abandoned the send.
    pub fn submit(&self) -> bool {
        self.0
            .compare_exchange(PENDING, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side. False when the send was already handed to the library.
    pub fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == ABANDONED
    }

    pub fn is_submitted(&self) -> bool {
        self.0.load(Ordering::Acquire) == SUBMITTED
    }
}

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

enum Command {
    /// `None` when queued without a waiting caller (restore).
    Connect(Option<Reply<()>>),
    Disconnect(Reply<()>),
    Logout(Reply<()>),
    PairPhone {
        phone: String,
        reply: Reply<String>,
    },
    Send {
        prepared: Box<PreparedSend>,
        latch: Arc<SendLatch>,
        reply: Reply<SendResponse>,
    },
    Group {
        op: GroupOp,
        reply: Reply<GroupReply>,
    },
    Contact {
        op: ContactOp,
        reply: Reply<ContactReply>,
    },
}

fn gone() -> GatewayError {
    GatewayError::Unavailable("session runtime has stopped".into())
}

fn shutting_down() -> GatewayError {
    GatewayError::Unavailable("session is shutting down".into())
}

/// Map a library error onto the gateway's error vocabulary.
pub(crate) fn map_wa_error(e: WaError) -> GatewayError {
    match e {
        WaError::NotConnected | WaError::NotLoggedIn => GatewayError::NotConnected,
        WaError::AlreadyLoggedIn => GatewayError::AlreadyPaired,
        WaError::ConnectionLost(reason) => {
            GatewayError::Unavailable(format!("connection lost: {reason}"))
        }
        WaError::Timeout => GatewayError::Timeout("whatsapp request".into()),
        WaError::LoggedOut(reason) => GatewayError::LoggedOut(reason),
        WaError::Upload(reason) => GatewayError::UploadFailed(reason),
        WaError::NotFound(reason) | WaError::Other(reason) => GatewayError::Library(reason),
    }
}

/// Cheap, cloneable access to one runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    session_id: SessionId,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<RuntimeStatus>,
    qr: watch::Receiver<Option<QrCode>>,
    cancel: CancellationToken,
    send_timeout: Duration,
    qr_wait: Duration,
}

impl RuntimeHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    /// The live QR code, if one is waiting to be scanned.
    pub fn current_qr(&self) -> Option<QrCode> {
        self.qr.borrow().clone().filter(QrCode::is_fresh)
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Start or resume the connection.
    pub async fn connect(&self) -> Result<RuntimeStatus, GatewayError> {
        self.request(|reply| Command::Connect(Some(reply))).await?;
        Ok(self.status())
    }

    /// Queue a connect without waiting for its outcome.
    pub async fn enqueue_connect(&self) -> Result<(), GatewayError> {
        self.tx
            .send(Command::Connect(None))
            .await
            .map_err(|_| gone())
    }

    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.request(Command::Disconnect).await
    }

    pub async fn logout(&self) -> Result<(), GatewayError> {
        self.request(Command::Logout).await
    }

    /// Begin pairing by phone number; returns the code to type on the phone.
    pub async fn pair_phone(&self, phone: &str) -> Result<String, GatewayError> {
        let phone = phone.to_string();
        self.request(|reply| Command::PairPhone { phone, reply })
            .await
    }

    /// Return the live QR code, waiting up to `wait` for one to be issued.
    pub async fn get_qr(&self, wait: Option<Duration>) -> Result<QrCode, GatewayError> {
        let wait = wait.unwrap_or(self.qr_wait);
        let deadline = Instant::now() + wait;
        let mut status = self.status.clone();
        let mut qr = self.qr.clone();
        loop {
            let st = status.borrow_and_update().clone();
            match st.state {
                ConnectionState::Connected => return Err(GatewayError::AlreadyPaired),
                ConnectionState::Qr => {}
                ConnectionState::Connecting if st.device_jid.is_none() => {}
                ConnectionState::Connecting => return Err(GatewayError::AlreadyPaired),
                ConnectionState::Disconnected | ConnectionState::Error
                    if st.device_jid.is_some() =>
                {
                    return Err(GatewayError::AlreadyPaired)
                }
                ConnectionState::Disconnected
                | ConnectionState::Error
                | ConnectionState::Terminating => return Err(GatewayError::NotPairing),
            }
            if let Some(code) = qr.borrow_and_update().clone().filter(QrCode::is_fresh) {
                return Ok(code);
            }
            tokio::select! {
                changed = status.changed() => changed.map_err(|_| gone())?,
                changed = qr.changed() => changed.map_err(|_| gone())?,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(GatewayError::Timeout(format!(
                        "no QR code issued within {}s",
                        wait.as_secs()
                    )));
                }
            }
        }
    }

    /// Send a prepared message, giving up after `timeout`.
    ///
    /// A timeout before the runtime picked the send up cancels it; after that
    /// the message may already be on its way and the caller is told so.
    pub async fn send(
        &self,
        prepared: PreparedSend,
        timeout: Option<Duration>,
    ) -> Result<SendResponse, GatewayError> {
        let timeout = timeout.unwrap_or(self.send_timeout);
        let latch = Arc::new(SendLatch::default());
        let (reply, rx) = oneshot::channel();
        let command = Command::Send {
            prepared: Box::new(prepared),
            latch: latch.clone(),
            reply,
        };
        let work = async {
            self.tx.send(command).await.map_err(|_| gone())?;
            // A runtime that stops after submitting may already have sent.
            rx.await.map_err(|_| {
                if latch.is_submitted() {
                    GatewayError::CanceledMayHaveSent
                } else {
                    gone()
                }
            })?
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) if latch.abandon() => Err(GatewayError::Timeout(format!(
                "send not started within {}s",
                timeout.as_secs()
            ))),
            Err(_) => Err(GatewayError::CanceledMayHaveSent),
        }
    }

    pub async fn group(&self, op: GroupOp) -> Result<GroupReply, GatewayError> {
        self.request(|reply| Command::Group { op, reply }).await
    }

    pub async fn contact(&self, op: ContactOp) -> Result<ContactReply, GatewayError> {
        self.request(|reply| Command::Contact { op, reply }).await
    }

    /// Ask the runtime to stop. Persisted state is left untouched.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawn the runtime of `record`.
pub fn spawn(
    record: &SessionRecord,
    deps: RuntimeDeps,
    cancel: CancellationToken,
) -> (RuntimeHandle, JoinHandle<()>) {
    let (tx, commands) = mpsc::channel(deps.config.command_buffer.max(1));
    let (status, status_rx) = watch::channel(RuntimeStatus {
        state: ConnectionState::Disconnected,
        device_jid: record.device_jid.clone(),
        last_error: record.last_error.clone(),
        reconnect_attempts: 0,
    });
    let qr = QrBroker::new();
    let handle = RuntimeHandle {
        session_id: record.id,
        tx,
        status: status_rx,
        qr: qr.subscribe(),
        cancel: cancel.clone(),
        send_timeout: deps.config.send_timeout,
        qr_wait: deps.config.qr_wait,
    };
    let runtime = Runtime {
        session_id: record.id,
        proxy: record.proxy.clone(),
        deps,
        client: None,
        events: None,
        status,
        qr,
        intent: record.connected,
        reconnect_at: None,
        last_seen_touch: None,
        cancel,
    };
    let task = tokio::spawn(runtime.run(commands));
    (handle, task)
}

enum Step {
    Stop,
    Command(Command),
    Event(Option<WaEvent>),
    Reconnect,
}

struct Runtime {
    session_id: SessionId,
    proxy: Option<ProxyConfig>,
    deps: RuntimeDeps,
    client: Option<Arc<dyn WaClient>>,
    events: Option<mpsc::UnboundedReceiver<WaEvent>>,
    status: watch::Sender<RuntimeStatus>,
    qr: QrBroker,
    /// Whether the session is meant to be online; drives auto-reconnect.
    intent: bool,
    reconnect_at: Option<Instant>,
    last_seen_touch: Option<Instant>,
    cancel: CancellationToken,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<WaEvent>>) -> Option<WaEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Runtime {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!(session_id = %self.session_id, "session runtime started");
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                cmd = commands.recv() => cmd.map_or(Step::Stop, Step::Command),
                ev = next_event(&mut self.events) => Step::Event(ev),
                _ = reconnect_timer(self.reconnect_at) => Step::Reconnect,
            };
            match step {
                Step::Stop => break,
                Step::Command(cmd) => self.handle_command(cmd).await,
                Step::Event(Some(ev)) => self.handle_event(ev).await,
                Step::Event(None) => {
                    debug!(session_id = %self.session_id, "client event stream closed");
                    self.events = None;
                }
                Step::Reconnect => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }
            }
        }
        self.terminate().await;
    }

    // --- State helpers ---

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn update(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        let session_id = self.session_id;
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            if before.state != status.state {
                info!(session_id = %session_id, "state {} -> {}", before.state, status.state);
            }
            *status != before
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.update(|s| s.state = state);
    }

    fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        self.deps
            .dispatcher
            .emit(self.session_id, event_type, payload);
    }

    fn emit_value<T: Serialize>(&self, event_type: EventType, value: &T) {
        match serde_json::to_value(value) {
            Ok(payload) => self.emit(event_type, payload),
            Err(e) => warn!(session_id = %self.session_id, "failed to encode {event_type} event: {e}"),
        }
    }

    async fn persist_connection(&self, connected: bool, last_error: Option<&str>) {
        if let Err(e) = self
            .deps
            .store
            .set_connection(self.session_id, connected, last_error)
            .await
        {
            error!(session_id = %self.session_id, "failed to persist connection state: {e}");
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let attempt = self.status.borrow().reconnect_attempts + 1;
        let delay = self.deps.config.reconnect.delay(attempt);
        info!(session_id = %self.session_id, attempt, "reconnecting in {delay:?}");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// The client, provided the session is online.
    fn online_client(&self) -> Result<Arc<dyn WaClient>, GatewayError> {
        match (&self.client, self.state()) {
            (Some(client), ConnectionState::Connected) => Ok(client.clone()),
            _ => Err(GatewayError::NotConnected),
        }
    }

    /// Run a library call against the online client, racing shutdown.
    async fn call<T, F, Fut>(&mut self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(Arc<dyn WaClient>) -> Fut,
        Fut: Future<Output = Result<T, WaError>>,
    {
        let client = self.online_client()?;
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(shutting_down()),
            r = f(client) => r,
        };
        match result {
            Ok(v) => Ok(v),
            Err(e) => Err(self.library_failure(e).await),
        }
    }

    /// React to a failed library call, then map the error for the caller.
    async fn library_failure(&mut self, e: WaError) -> GatewayError {
        match &e {
            WaError::ConnectionLost(reason) => self.transport_lost(reason.clone()),
            WaError::LoggedOut(reason) => self.clear_identity(reason, false).await,
            _ => {}
        }
        map_wa_error(e)
    }

    // --- Commands ---

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let result = self.connect().await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(session_id = %self.session_id, "queued connect failed: {e}");
                        }
                    }
                }
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::Logout(reply) => {
                let result = self.logout().await;
                let _ = reply.send(result);
            }
            Command::PairPhone { phone, reply } => {
                let result = self.pair_phone(&phone).await;
                let _ = reply.send(result);
            }
            Command::Send {
                prepared,
                latch,
                reply,
            } => {
                if latch.is_abandoned() {
                    debug!(session_id = %self.session_id, "skipping send abandoned by its caller");
                    return;
                }
                let result = self.send(*prepared, &latch).await;
                let _ = reply.send(result);
            }
            Command::Group { op, reply } => {
                let name = op.name();
                let result = self
                    .call(|c| async move { run_group_op(c.as_ref(), op).await })
                    .await;
                if let Err(e) = &result {
                    debug!(session_id = %self.session_id, op = name, "group operation failed: {e}");
                }
                let _ = reply.send(result);
            }
            Command::Contact { op, reply } => {
                let name = op.name();
                let result = self
                    .call(|c| async move { run_contact_op(c.as_ref(), op).await })
                    .await;
                if let Err(e) = &result {
                    debug!(session_id = %self.session_id, op = name, "contact operation failed: {e}");
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Build the client on first use, from the stored device identity.
    async fn ensure_client(&mut self) -> Result<Arc<dyn WaClient>, GatewayError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        let device = self.deps.store.load_device(self.session_id).await?;
        let (client, events) = self
            .deps
            .factory
            .new_client(ClientOptions {
                session_id: self.session_id,
                device,
                proxy: self.proxy.clone(),
            })
            .await
            .map_err(map_wa_error)?;
        self.client = Some(client.clone());
        self.events = Some(events);
        Ok(client)
    }

    /// Build the client if needed and open its transport.
    async fn open(&mut self) -> Result<(), GatewayError> {
        let client = self.ensure_client().await?;
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(shutting_down()),
            r = client.connect() => r.map_err(map_wa_error),
        }
    }

    async fn connect(&mut self) -> Result<(), GatewayError> {
        match self.state() {
            ConnectionState::Connected if self.client.as_ref().is_some_and(|c| c.is_connected()) => {
                return Ok(())
            }
            // Pairing is already under way.
            ConnectionState::Qr => return Ok(()),
            _ => {}
        }
        self.reconnect_at = None;
        self.update(|s| {
            s.state = ConnectionState::Connecting;
            s.reconnect_attempts = 0;
        });
        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(session_id = %self.session_id, "connect failed: {e}");
                let reason = e.to_string();
                if self.intent {
                    self.update(|s| s.last_error = Some(reason));
                    self.schedule_reconnect();
                } else {
                    self.update(|s| {
                        s.state = ConnectionState::Error;
                        s.last_error = Some(reason.clone());
                    });
                    self.persist_connection(false, Some(&reason)).await;
                }
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) {
        if !self.intent || self.state() == ConnectionState::Connected {
            return;
        }
        let mut attempt = 0;
        self.update(|s| {
            s.reconnect_attempts += 1;
            attempt = s.reconnect_attempts;
        });
        info!(session_id = %self.session_id, attempt, "reconnect attempt");
        if let Err(e) = self.open().await {
            let reason = e.to_string();
            warn!(session_id = %self.session_id, attempt, "reconnect failed: {reason}");
            if self.deps.config.reconnect.exhausted(attempt) {
                self.enter_error(reason).await;
            } else {
                self.update(|s| s.last_error = Some(reason));
                self.schedule_reconnect();
            }
        }
    }

    /// Give up reconnecting until the next explicit connect.
    async fn enter_error(&mut self, reason: String) {
        error!(session_id = %self.session_id, "giving up on reconnecting: {reason}");
        self.intent = false;
        self.reconnect_at = None;
        self.qr.clear();
        if let Some(client) = &self.client {
            client.disconnect().await;
        }
        self.update(|s| {
            s.state = ConnectionState::Error;
            s.last_error = Some(reason.clone());
        });
        self.persist_connection(false, Some(&reason)).await;
        self.emit(
            EventType::Disconnected,
            json!({ "reason": reason, "reconnecting": false, "state": "error" }),
        );
    }

    async fn disconnect(&mut self) {
        self.intent = false;
        self.reconnect_at = None;
        self.qr.clear();
        if let Some(client) = &self.client {
            client.disconnect().await;
        }
        let was = self.state();
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.reconnect_attempts = 0;
        });
        self.persist_connection(false, None).await;
        if was != ConnectionState::Disconnected {
            self.emit(
                EventType::Disconnected,
                json!({ "reason": "user_request", "reconnecting": false }),
            );
        }
    }

    async fn logout(&mut self) -> Result<(), GatewayError> {
        if let Some(client) = self.client.clone() {
            if client.is_connected() && client.own_jid().is_some() {
                if let Err(e) = client.logout().await {
                    warn!(session_id = %self.session_id, "library logout failed, clearing identity anyway: {e}");
                }
            }
            client.disconnect().await;
        }
        self.clear_identity("user_request", true).await;
        Ok(())
    }

    /// Forget the device: the next connect pairs from scratch.
    async fn clear_identity(&mut self, reason: &str, requested: bool) {
        let store = &self.deps.store;
        if let Err(e) = store.delete_device(self.session_id).await {
            error!(session_id = %self.session_id, "failed to delete device identity: {e}");
        }
        if let Err(e) = store.set_device_jid(self.session_id, None).await {
            error!(session_id = %self.session_id, "failed to clear device jid: {e}");
        }
        let last_error = (!requested).then_some(reason);
        self.persist_connection(false, last_error).await;
        self.intent = false;
        self.reconnect_at = None;
        self.qr.clear();
        self.client = None;
        self.events = None;
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.device_jid = None;
            s.reconnect_attempts = 0;
            s.last_error = last_error.map(str::to_string);
        });
        info!(session_id = %self.session_id, "device logged out ({reason})");
        self.emit(EventType::LoggedOut, json!({ "reason": reason }));
    }

    async fn pair_phone(&mut self, phone: &str) -> Result<String, GatewayError> {
        let digits =
            clean_phone(phone).ok_or_else(|| GatewayError::InvalidTarget(phone.to_string()))?;
        if self.status.borrow().device_jid.is_some() {
            return Err(GatewayError::AlreadyPaired);
        }
        if !self.client.as_ref().is_some_and(|c| c.is_connected()) {
            self.connect().await?;
        }
        let client = self.client.clone().ok_or(GatewayError::NotConnected)?;
        let name = self.deps.config.device_name.clone();
        let cancel = self.cancel.clone();
        let code = tokio::select! {
            _ = cancel.cancelled() => return Err(shutting_down()),
            r = client.pair_phone(&digits, &name) => r.map_err(map_wa_error)?,
        };
        self.set_state(ConnectionState::Qr);
        info!(session_id = %self.session_id, "pair code issued");
        Ok(code)
    }

    async fn send(
        &mut self,
        prepared: PreparedSend,
        latch: &SendLatch,
    ) -> Result<SendResponse, GatewayError> {
        self.online_client()?;
        let PreparedSend { to, kind, body, .. } = prepared;
        let target = to.clone();
        let message = self
            .call(|c| async move { build_message(c.as_ref(), &target, body).await })
            .await?;
        if !latch.submit() {
            return Err(GatewayError::Timeout(
                "send abandoned by its caller before submission".into(),
            ));
        }
        let target = to.clone();
        let response = match self
            .call(|c| async move { c.send(&target, message).await })
            .await
        {
            Ok(response) => response,
            // Shutdown raced a submitted send.
            Err(_) if self.cancel.is_cancelled() => return Err(GatewayError::CanceledMayHaveSent),
            Err(e) => return Err(e),
        };
        if response.id.is_empty() {
            let correlation = Uuid::new_v4();
            error!(
                session_id = %self.session_id,
                to = %to,
                %correlation,
                "library accepted a {kind} message but returned no id"
            );
            return Err(GatewayError::Library(format!(
                "no message id returned (correlation {correlation})"
            )));
        }
        info!(session_id = %self.session_id, to = %to, id = %response.id, "{kind} message sent");
        Ok(response)
    }

    // --- Events ---

    async fn handle_event(&mut self, ev: WaEvent) {
        match ev {
            WaEvent::Connected => self.on_connected().await,
            WaEvent::Disconnected { reason } => {
                match self.state() {
                    ConnectionState::Disconnected | ConnectionState::Terminating => {
                        debug!(session_id = %self.session_id, "ignoring disconnect while offline: {reason}");
                    }
                    ConnectionState::Connecting if self.reconnect_at.is_some() => {
                        debug!(session_id = %self.session_id, "reconnect already scheduled: {reason}");
                    }
                    _ => self.transport_lost(reason),
                }
            }
            WaEvent::Qr { .. } | WaEvent::QrExhausted if !self.awaiting_link() => {
                debug!(session_id = %self.session_id, "ignoring QR event from an abandoned connection");
            }
            WaEvent::Qr { code, timeout } => {
                // State first, so a waiter woken by the code already sees `qr`.
                self.set_state(ConnectionState::Qr);
                let qr = self.qr.publish(code, timeout);
                self.emit(
                    EventType::Qr,
                    json!({ "code": qr.code, "expiresAt": qr.expires_at }),
                );
            }
            WaEvent::QrExhausted => {
                self.qr.clear();
                self.set_state(ConnectionState::Disconnected);
                self.emit(
                    EventType::Disconnected,
                    json!({ "reason": "qr_timeout", "reconnecting": false }),
                );
            }
            WaEvent::PairSuccess { device } => self.on_paired(device).await,
            WaEvent::PairError { reason } => {
                warn!(session_id = %self.session_id, "pairing failed: {reason}");
                self.update(|s| s.last_error = Some(reason.clone()));
                self.emit(EventType::Pair, json!({ "success": false, "error": reason }));
            }
            WaEvent::LoggedOut { reason } => self.clear_identity(&reason, false).await,
            WaEvent::Message(msg) => {
                self.touch_last_seen().await;
                self.emit_value(EventType::Message, &msg);
            }
            WaEvent::Receipt(r) => self.emit_value(EventType::Receipt, &r),
            WaEvent::Presence(p) => self.emit_value(EventType::Presence, &p),
            WaEvent::Group(g) => self.emit_value(EventType::Group, &g),
            WaEvent::Call(c) => self.emit_value(EventType::Call, &c),
            WaEvent::HistorySync(h) => self.emit_value(EventType::HistorySync, &h),
        }
    }

    /// True while a connect is in flight or a pairing is on screen.
    fn awaiting_link(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Qr
        )
    }

    async fn on_connected(&mut self) {
        // Events queued before a later disconnect must not bring the session back.
        let live = self.client.as_ref().is_some_and(|c| c.is_connected());
        if !live || !self.awaiting_link() {
            debug!(
                session_id = %self.session_id,
                state = %self.state(),
                "ignoring stale connected event"
            );
            return;
        }
        let device_jid = self
            .client
            .as_ref()
            .and_then(|c| c.own_jid())
            .map(|j| j.to_string())
            .or_else(|| self.status.borrow().device_jid.clone());
        let Some(device_jid) = device_jid else {
            warn!(session_id = %self.session_id, "client reported online without a device identity");
            return;
        };
        self.reconnect_at = None;
        self.qr.clear();
        self.intent = true;
        self.update(|s| {
            s.state = ConnectionState::Connected;
            s.device_jid = Some(device_jid.clone());
            s.last_error = None;
            s.reconnect_attempts = 0;
        });
        self.persist_connection(true, None).await;
        self.emit(EventType::Connected, json!({ "deviceJid": device_jid }));
    }

    /// Device identity first, then the address on the session record.
    async fn on_paired(&mut self, device: DeviceIdentity) {
        let jid = device.jid.to_string();
        if let Err(e) = self.deps.store.save_device(self.session_id, &device).await {
            error!(session_id = %self.session_id, "failed to save device identity: {e}");
            self.emit(
                EventType::Pair,
                json!({ "success": false, "error": e.to_string() }),
            );
            return;
        }
        if let Err(e) = self
            .deps
            .store
            .set_device_jid(self.session_id, Some(&jid))
            .await
        {
            error!(session_id = %self.session_id, "failed to record device jid: {e}");
        }
        self.update(|s| s.device_jid = Some(jid.clone()));
        info!(session_id = %self.session_id, device_jid = %jid, "device paired");
        self.emit(EventType::Pair, json!({ "success": true, "deviceJid": jid }));
    }

    /// Transport gone without the device being revoked.
    fn transport_lost(&mut self, reason: String) {
        self.qr.clear();
        if self.intent {
            warn!(session_id = %self.session_id, "connection lost: {reason}");
            self.update(|s| {
                s.state = ConnectionState::Connecting;
                s.last_error = Some(reason.clone());
            });
            self.schedule_reconnect();
            self.emit(
                EventType::Disconnected,
                json!({ "reason": reason, "reconnecting": true }),
            );
        } else {
            self.set_state(ConnectionState::Disconnected);
            self.emit(
                EventType::Disconnected,
                json!({ "reason": reason, "reconnecting": false }),
            );
        }
    }

    async fn touch_last_seen(&mut self) {
        let now = Instant::now();
        if self
            .last_seen_touch
            .is_some_and(|t| now.duration_since(t) < LAST_SEEN_INTERVAL)
        {
            return;
        }
        self.last_seen_touch = Some(now);
        if let Err(e) = self.deps.store.touch_last_seen(self.session_id).await {
            warn!(session_id = %self.session_id, "failed to update last_seen: {e}");
        }
    }

    async fn terminate(&mut self) {
        self.set_state(ConnectionState::Terminating);
        self.qr.clear();
        self.reconnect_at = None;
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
        self.events = None;
        debug!(session_id = %self.session_id, "session runtime stopped");
    }
}

//! Session manager: owns every runtime and the name index.
//!
//! Runtimes are reached through [`RuntimeLease`]s. A lease holds a read lock
//! on the runtime's slot, so `delete` (which takes the write lock) waits for
//! in-flight borrows and no new borrow can start once deletion began.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use wagate_core::config::Config;
use wagate_core::error::GatewayError;
use wagate_core::session::{
    validate_name, ConnectionState, ProxyConfig, SessionFilter, SessionId, SessionRecord,
};
use wagate_core::sink::Sink;
use wagate_core::traits::ClientFactory;
use wagate_core::wa::SendResponse;
use wagate_store::Store;

use super::ops::{ContactOp, ContactReply, GroupOp, GroupReply};
use super::qr::QrCode;
use super::runtime::{spawn, RuntimeConfig, RuntimeDeps, RuntimeHandle, RuntimeStatus};
use crate::events::{Dispatcher, SinkSpec};
use crate::send::PreparedSend;

/// Page size used when loading every record at startup.
const RESTORE_PAGE: u32 = 500;

/// A borrowed runtime. Deletion of the session waits until it is dropped.
pub type RuntimeLease = OwnedRwLockReadGuard<Option<RuntimeHandle>, RuntimeHandle>;

struct RuntimeSlot {
    handle: Arc<AsyncRwLock<Option<RuntimeHandle>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Session as reported to API callers: the stored record merged with the
/// runtime's live view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub status: ConnectionState,
    pub device_jid: Option<String>,
    /// Durable intent to be online.
    pub connected: bool,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<QrCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SessionInfo {
    fn new(record: &SessionRecord, runtime: Option<&RuntimeHandle>) -> Self {
        let status = runtime.map(RuntimeHandle::status);
        let qr = runtime.and_then(RuntimeHandle::current_qr);
        let (state, device_jid, last_error, attempts) = match status {
            Some(s) => (s.state, s.device_jid, s.last_error, s.reconnect_attempts),
            None => (
                ConnectionState::Disconnected,
                record.device_jid.clone(),
                record.last_error.clone(),
                0,
            ),
        };
        Self {
            id: record.id,
            name: record.name.clone(),
            status: state,
            device_jid,
            connected: record.connected,
            last_error,
            proxy: record.proxy.as_ref().map(ProxyConfig::redacted_url),
            reconnect_attempts: attempts,
            qr,
            created_at: record.created_at,
            updated_at: record.updated_at,
            connected_at: record.connected_at,
            last_seen: record.last_seen,
        }
    }
}

/// Result of `create` and `connect`: the session plus a QR when one was
/// issued within the short wait.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub info: SessionInfo,
    pub qr: Option<QrCode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored: usize,
    pub reconnecting: usize,
    pub orphan_devices: usize,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionManager {
    store: Store,
    dispatcher: Dispatcher,
    deps: RuntimeDeps,
    create_qr_wait: Duration,
    runtimes: RwLock<HashMap<SessionId, Arc<RuntimeSlot>>>,
    names: RwLock<HashMap<String, SessionId>>,
    /// Coarse per-session lock, taken for create and destroy only.
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    root: CancellationToken,
}

impl SessionManager {
    pub fn new(
        store: Store,
        dispatcher: Dispatcher,
        factory: Arc<dyn ClientFactory>,
        config: &Config,
    ) -> Self {
        let deps = RuntimeDeps {
            store: store.clone(),
            dispatcher: dispatcher.clone(),
            factory,
            config: RuntimeConfig::new(&config.session, &config.whatsapp),
        };
        Self {
            store,
            dispatcher,
            deps,
            create_qr_wait: config.session.create_qr_wait(),
            runtimes: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of live runtimes.
    pub fn live_count(&self) -> usize {
        read(&self.runtimes).len()
    }

    fn session_lock(&self, id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.locks).entry(id).or_default().clone()
    }

    /// Spawn and register the runtime of `record`, unless one exists.
    fn spawn_runtime(&self, record: &SessionRecord) -> Option<RuntimeHandle> {
        let mut runtimes = write(&self.runtimes);
        if runtimes.contains_key(&record.id) {
            warn!(session_id = %record.id, "runtime already running, not spawning another");
            return None;
        }
        let cancel = self.root.child_token();
        let (handle, task) = spawn(record, self.deps.clone(), cancel.clone());
        runtimes.insert(
            record.id,
            Arc::new(RuntimeSlot {
                handle: Arc::new(AsyncRwLock::new(Some(handle.clone()))),
                cancel,
                task: Mutex::new(Some(task)),
            }),
        );
        write(&self.names).insert(record.name.clone(), record.id);
        Some(handle)
    }

    /// Persist a new session and start its runtime.
    pub async fn create(
        &self,
        name: &str,
        proxy: Option<ProxyConfig>,
        auto_connect: bool,
    ) -> Result<ConnectOutcome, GatewayError> {
        let name = name.trim();
        validate_name(name)?;
        if let Some(p) = &proxy {
            p.validate()?;
        }
        let record = SessionRecord::new(name, proxy);
        let guard = self.session_lock(record.id);
        let _held = guard.lock().await;

        self.store.create_session(&record).await?;
        let handle = self
            .spawn_runtime(&record)
            .ok_or_else(|| GatewayError::SessionAlreadyExists(record.name.clone()))?;
        info!(session_id = %record.id, name = %record.name, "session created");

        let mut qr = None;
        if auto_connect {
            match handle.connect().await {
                Ok(_) => qr = handle.get_qr(Some(self.create_qr_wait)).await.ok(),
                Err(e) => warn!(session_id = %record.id, "initial connect failed: {e}"),
            }
        }
        let record = self.store.get_session(record.id).await?.unwrap_or(record);
        Ok(ConnectOutcome {
            info: SessionInfo::new(&record, Some(&handle)),
            qr,
        })
    }

    /// Resolve an id or a name to a session id.
    pub async fn resolve(&self, identifier: &str) -> Result<SessionId, GatewayError> {
        let identifier = identifier.trim();
        if let Ok(id) = identifier.parse::<SessionId>() {
            if read(&self.runtimes).contains_key(&id) {
                return Ok(id);
            }
            if self.store.get_session(id).await?.is_some() {
                return Ok(id);
            }
        }
        if let Some(id) = read(&self.names).get(identifier) {
            return Ok(*id);
        }
        match self.store.get_session_by_name(identifier).await? {
            Some(record) => Ok(record.id),
            None => Err(GatewayError::SessionNotFound(identifier.to_string())),
        }
    }

    /// Borrow the runtime of `id`.
    pub async fn runtime(&self, id: SessionId) -> Result<RuntimeLease, GatewayError> {
        let slot = read(&self.runtimes)
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        let guard = slot.handle.clone().read_owned().await;
        OwnedRwLockReadGuard::try_map(guard, Option::as_ref)
            .map_err(|_| GatewayError::SessionNotFound(id.to_string()))
    }

    /// Resolve and borrow in one step.
    pub async fn lease(&self, identifier: &str) -> Result<RuntimeLease, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.runtime(id).await
    }

    pub async fn info(&self, identifier: &str) -> Result<SessionInfo, GatewayError> {
        let id = self.resolve(identifier).await?;
        let record = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound(identifier.to_string()))?;
        let lease = self.runtime(id).await.ok();
        Ok(SessionInfo::new(&record, lease.as_deref()))
    }

    /// Live state only, without touching the store.
    pub async fn status(&self, identifier: &str) -> Result<RuntimeStatus, GatewayError> {
        Ok(self.lease(identifier).await?.status())
    }

    /// Page through sessions; also returns the unpaged total.
    pub async fn list(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<SessionInfo>, u64), GatewayError> {
        let records = self.store.list_sessions(filter, limit, offset).await?;
        let total = self.store.count_sessions(filter).await?;
        let mut infos = Vec::with_capacity(records.len());
        for record in &records {
            let lease = self.runtime(record.id).await.ok();
            infos.push(SessionInfo::new(record, lease.as_deref()));
        }
        Ok((infos, total))
    }

    /// Connect and, when pairing is needed, wait briefly for the first QR.
    pub async fn connect(&self, identifier: &str) -> Result<ConnectOutcome, GatewayError> {
        let id = self.resolve(identifier).await?;
        let qr = {
            let runtime = self.runtime(id).await?;
            let status = runtime.connect().await?;
            if status.device_jid.is_none() {
                runtime.get_qr(Some(self.create_qr_wait)).await.ok()
            } else {
                None
            }
        };
        Ok(ConnectOutcome {
            info: self.info(&id.to_string()).await?,
            qr,
        })
    }

    pub async fn disconnect(&self, identifier: &str) -> Result<SessionInfo, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.runtime(id).await?.disconnect().await?;
        self.info(&id.to_string()).await
    }

    pub async fn logout(&self, identifier: &str) -> Result<SessionInfo, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.runtime(id).await?.logout().await?;
        self.info(&id.to_string()).await
    }

    pub async fn pair_phone(&self, identifier: &str, phone: &str) -> Result<String, GatewayError> {
        self.lease(identifier).await?.pair_phone(phone).await
    }

    pub async fn get_qr(
        &self,
        identifier: &str,
        wait: Option<Duration>,
    ) -> Result<QrCode, GatewayError> {
        self.lease(identifier).await?.get_qr(wait).await
    }

    pub async fn send(
        &self,
        identifier: &str,
        prepared: PreparedSend,
        timeout: Option<Duration>,
    ) -> Result<SendResponse, GatewayError> {
        self.lease(identifier).await?.send(prepared, timeout).await
    }

    pub async fn group(&self, identifier: &str, op: GroupOp) -> Result<GroupReply, GatewayError> {
        self.lease(identifier).await?.group(op).await
    }

    pub async fn contact(
        &self,
        identifier: &str,
        op: ContactOp,
    ) -> Result<ContactReply, GatewayError> {
        self.lease(identifier).await?.contact(op).await
    }

    /// Stop the runtime and erase every trace of the session. Idempotent;
    /// returns whether anything existed.
    pub async fn delete(&self, id: SessionId) -> Result<bool, GatewayError> {
        let guard = self.session_lock(id);
        let held = guard.lock().await;

        let slot = write(&self.runtimes).remove(&id);
        write(&self.names).retain(|_, v| *v != id);
        let had_runtime = slot.is_some();
        if let Some(slot) = slot {
            slot.cancel.cancel();
            slot.handle.write().await.take();
            let task = lock(&slot.task).take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(session_id = %id, "runtime task ended abnormally: {e}");
                }
            }
        }

        self.dispatcher.purge_session(id).await;
        self.store.delete_device(id).await?;
        self.dispatcher.registry().remove_session(id).await?;
        let existed = self.store.delete_session(id).await?;

        drop(held);
        lock(&self.locks).remove(&id);
        if existed || had_runtime {
            info!(session_id = %id, "session deleted");
        }
        Ok(existed || had_runtime)
    }

    /// Spawn a runtime for every stored session and queue a connect for
    /// those that were online. Called once at startup.
    pub async fn restore_all(&self) -> Result<RestoreReport, GatewayError> {
        let filter = SessionFilter::default();
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_sessions(&filter, RESTORE_PAGE, offset)
                .await?;
            let done = page.len() < RESTORE_PAGE as usize;
            offset += page.len() as u32;
            records.extend(page);
            if done {
                break;
            }
        }

        let mut report = RestoreReport::default();
        let known: HashSet<SessionId> = records.iter().map(|r| r.id).collect();
        for id in self.store.list_device_session_ids().await? {
            if !known.contains(&id) {
                warn!(session_id = %id, "purging device identity without a session");
                self.store.delete_device(id).await?;
                report.orphan_devices += 1;
            }
        }

        for record in &records {
            let Some(handle) = self.spawn_runtime(record) else {
                continue;
            };
            report.restored += 1;
            if record.connected {
                handle.enqueue_connect().await?;
                report.reconnecting += 1;
            }
        }
        info!(
            restored = report.restored,
            reconnecting = report.reconnecting,
            "sessions restored"
        );
        Ok(report)
    }

    /// Stop every runtime, leaving persisted intent as it is.
    pub async fn shutdown_all(&self) {
        self.root.cancel();
        let slots: Vec<_> = write(&self.runtimes).drain().map(|(_, s)| s).collect();
        write(&self.names).clear();
        for slot in slots {
            let task = lock(&slot.task).take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        info!("all session runtimes stopped");
    }

    // --- Sinks ---

    pub async fn create_sink(&self, identifier: &str, spec: SinkSpec) -> Result<Sink, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().create(id, spec).await
    }

    pub async fn list_sinks(&self, identifier: &str) -> Result<Vec<Sink>, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().list(id).await
    }

    pub async fn get_sink(&self, identifier: &str, sink_id: Uuid) -> Result<Sink, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().get(id, sink_id).await
    }

    pub async fn update_sink(
        &self,
        identifier: &str,
        sink_id: Uuid,
        spec: SinkSpec,
    ) -> Result<Sink, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().update(id, sink_id, spec).await
    }

    pub async fn delete_sink(&self, identifier: &str, sink_id: Uuid) -> Result<(), GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().delete(id, sink_id).await
    }

    pub async fn enable_sink(&self, identifier: &str, sink_id: Uuid) -> Result<Sink, GatewayError> {
        let id = self.resolve(identifier).await?;
        self.dispatcher.registry().enable(id, sink_id).await
    }
}

//! In-process WhatsApp device emulator.
//!
//! Implements [`ClientFactory`] and [`WaClient`](wagate_core::traits::WaClient)
//! without touching the network. Pairing issues rotating QR codes that are
//! completed with [`EmulatedClient::scan`] (or a pair code plus
//! [`EmulatedClient::confirm_pair_code`]); sends return fresh server-style ids.
//! Test and development hooks can inject inbound events, drop the transport,
//! revoke the device, and inspect every send the "server" saw.

mod client;

#[cfg(test)]
mod tests;

pub use client::{EmulatedClient, SentMessage};

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use wagate_core::config::WhatsAppConfig;
use wagate_core::session::SessionId;
use wagate_core::traits::{ClientFactory, ClientOptions, WaClient};
use wagate_core::wa::{WaError, WaEvent};

/// Emulator behaviour.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub device_name: String,
    pub qr_first_ttl: Duration,
    pub qr_rotation_ttl: Duration,
    /// QR codes per pairing attempt before it is abandoned.
    pub qr_rotations: u32,
    /// Complete QR pairing on its own after this delay.
    pub auto_pair_after: Option<Duration>,
    /// Simulated server round-trip for sends.
    pub send_latency: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self::from(&WhatsAppConfig::default())
    }
}

impl From<&WhatsAppConfig> for EmulatorConfig {
    fn from(cfg: &WhatsAppConfig) -> Self {
        Self {
            device_name: cfg.device_name.clone(),
            qr_first_ttl: Duration::from_secs(cfg.qr_first_ttl_secs),
            qr_rotation_ttl: Duration::from_secs(cfg.qr_rotation_ttl_secs),
            qr_rotations: cfg.qr_rotations,
            auto_pair_after: cfg.auto_pair_after_secs.map(Duration::from_secs),
            send_latency: Duration::from_millis(20),
        }
    }
}

/// State shared by every client of one emulator.
#[derive(Default)]
pub(crate) struct Shared {
    device_seq: AtomicU16,
    connect_failures: Mutex<HashMap<SessionId, u32>>,
}

impl Shared {
    pub(crate) fn next_device(&self) -> u16 {
        self.device_seq.fetch_add(1, Ordering::Relaxed) % 99 + 1
    }

    /// Consume one pending connect failure for `session_id`.
    pub(crate) fn take_connect_failure(&self, session_id: SessionId) -> bool {
        let mut failures = lock(&self.connect_failures);
        match failures.get_mut(&session_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Factory for emulated clients; keeps the latest client per session reachable.
#[derive(Clone)]
pub struct Emulator {
    config: EmulatorConfig,
    shared: Arc<Shared>,
    clients: Arc<Mutex<HashMap<SessionId, Arc<EmulatedClient>>>>,
    created: Arc<AtomicUsize>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            clients: Arc::new(Mutex::new(HashMap::new())),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Most recent client built for `session_id`.
    pub fn client(&self, session_id: SessionId) -> Option<Arc<EmulatedClient>> {
        lock(&self.clients).get(&session_id).cloned()
    }

    /// Make the next `count` connect attempts of `session_id` fail.
    pub fn fail_next_connects(&self, session_id: SessionId, count: u32) {
        lock(&self.shared.connect_failures).insert(session_id, count);
    }

    /// Number of clients built so far.
    pub fn clients_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClientFactory for Emulator {
    async fn new_client(
        &self,
        options: ClientOptions,
    ) -> Result<(Arc<dyn WaClient>, mpsc::UnboundedReceiver<WaEvent>), WaError> {
        if let Some(proxy) = &options.proxy {
            debug!(session_id = %options.session_id, proxy = %proxy.redacted_url(), "emulated client behind proxy");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(EmulatedClient::new(
            options.session_id,
            options.device,
            self.config.clone(),
            self.shared.clone(),
            tx,
        ));
        lock(&self.clients).insert(options.session_id, client.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %options.session_id, "emulated client created");
        Ok((client as Arc<dyn WaClient>, rx))
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Server-style message id: `3EB0` followed by 16 uppercase hex digits.
pub(crate) fn new_message_id() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("3EB0{}", hex::encode_upper(bytes))
}

/// Random digits of the given length.
pub(crate) fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

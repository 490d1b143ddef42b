//! QR broker: holds the live pairing code of one session and wakes every
//! waiter when it is replaced or cleared.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

/// A pairing code and the instant it stops being scannable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl QrCode {
    pub fn is_fresh(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

pub struct QrBroker {
    tx: watch::Sender<Option<QrCode>>,
}

impl Default for QrBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl QrBroker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replace the current code.
    pub fn publish(&self, code: String, ttl: Duration) -> QrCode {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let qr = QrCode {
            code,
            expires_at: Utc::now() + ttl,
        };
        self.tx.send_replace(Some(qr.clone()));
        qr
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    /// The current code, if it has not expired.
    pub fn current(&self) -> Option<QrCode> {
        self.tx.borrow().clone().filter(QrCode::is_fresh)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<QrCode>> {
        self.tx.subscribe()
    }
}

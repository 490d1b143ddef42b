//! Sink registry: persisted subscriptions plus the cached snapshot the
//! dispatcher reads on every event.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;
use wagate_core::config::WebhookConfig;
use wagate_core::error::GatewayError;
use wagate_core::event::EventType;
use wagate_core::session::SessionId;
use wagate_core::sink::{RetryPolicy, Sink};
use wagate_store::Store;

/// Id of the implicit sink built from the global webhook URL.
pub const GLOBAL_SINK_ID: Uuid = Uuid::nil();

/// Sink definition as accepted from API callers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkSpec {
    pub url: String,
    /// Empty subscribes to every event type.
    #[serde(default)]
    pub events: Vec<EventType>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

type Snapshot = Arc<HashMap<SessionId, Vec<Sink>>>;

pub struct SinkRegistry {
    store: Store,
    global: Option<Sink>,
    default_retry: RetryPolicy,
    snapshot: RwLock<Snapshot>,
    /// Serializes read-then-swap so an older read never replaces a newer one.
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Build the implicit global sink, if one is configured.
pub fn global_sink(cfg: &WebhookConfig) -> Option<Sink> {
    let url = cfg.global_url.as_deref()?.trim();
    if url.is_empty() {
        return None;
    }
    let mut sink = Sink::new(SessionId(Uuid::nil()), url);
    sink.id = GLOBAL_SINK_ID;
    sink.secret = cfg.global_secret.clone();
    sink.retry_policy = default_retry(cfg);
    Some(sink)
}

pub fn default_retry(cfg: &WebhookConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: cfg.max_attempts,
        initial_delay_ms: cfg.initial_delay_ms,
        max_delay_ms: cfg.max_delay_ms,
    }
    .normalized()
}

fn validate_target(url: &str) -> Result<(), GatewayError> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| GatewayError::Validation(format!("invalid webhook url '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(GatewayError::Validation(format!(
            "webhook url '{url}' must be an absolute http(s) URL"
        )));
    }
    Ok(())
}

fn lock_err<T>(_: T) -> GatewayError {
    GatewayError::Unavailable("sink snapshot lock poisoned".into())
}

impl SinkRegistry {
    /// Load every persisted sink into the snapshot.
    pub async fn load(store: Store, cfg: &WebhookConfig) -> Result<Self, GatewayError> {
        let global = global_sink(cfg);
        if let Some(g) = &global {
            info!("global webhook enabled: {}", g.target);
        }
        let registry = Self {
            store,
            global,
            default_retry: default_retry(cfg),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            refresh_lock: tokio::sync::Mutex::new(()),
        };
        registry.refresh().await?;
        Ok(registry)
    }

    /// Rebuild the snapshot from the store.
    pub async fn refresh(&self) -> Result<(), GatewayError> {
        let _serial = self.refresh_lock.lock().await;
        let mut by_session: HashMap<SessionId, Vec<Sink>> = HashMap::new();
        for sink in self.store.list_all_sinks().await? {
            by_session.entry(sink.session_id).or_default().push(sink);
        }
        *self.snapshot.write().map_err(lock_err)? = Arc::new(by_session);
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Enabled sinks of `session_id` that accept `event_type`, global sink last.
    pub fn matching(&self, session_id: SessionId, event_type: EventType) -> Vec<Sink> {
        let snapshot = self.snapshot();
        let mut out: Vec<Sink> = snapshot
            .get(&session_id)
            .map(|sinks| {
                sinks
                    .iter()
                    .filter(|s| s.accepts(event_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(global) = &self.global {
            let mut g = global.clone();
            g.session_id = session_id;
            out.push(g);
        }
        out
    }

    /// Latest cached definition of a sink, as seen by delivery workers.
    pub fn current(&self, session_id: SessionId, sink_id: Uuid) -> Option<Sink> {
        if sink_id == GLOBAL_SINK_ID {
            return self.global.clone().map(|mut g| {
                g.session_id = session_id;
                g
            });
        }
        self.snapshot()
            .get(&session_id)?
            .iter()
            .find(|s| s.id == sink_id)
            .cloned()
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }

    pub async fn create(&self, session_id: SessionId, spec: SinkSpec) -> Result<Sink, GatewayError> {
        validate_target(&spec.url)?;
        let mut sink = Sink::new(session_id, spec.url.trim());
        sink.filter_types = dedup(spec.events);
        sink.secret = spec.secret.filter(|s| !s.is_empty());
        sink.retry_policy = spec
            .retry_policy
            .map(RetryPolicy::normalized)
            .unwrap_or(self.default_retry);
        sink.disabled = !spec.enabled.unwrap_or(true);
        self.store.create_sink(&sink).await?;
        self.refresh().await?;
        info!(session_id = %session_id, sink_id = %sink.id, "webhook created: {}", sink.target);
        Ok(sink)
    }

    pub async fn list(&self, session_id: SessionId) -> Result<Vec<Sink>, GatewayError> {
        self.store.list_sinks(session_id).await
    }

    /// Fetch a sink, treating sinks of other sessions as missing.
    pub async fn get(&self, session_id: SessionId, sink_id: Uuid) -> Result<Sink, GatewayError> {
        match self.store.get_sink(sink_id).await? {
            Some(sink) if sink.session_id == session_id => Ok(sink),
            _ => Err(GatewayError::SinkNotFound(sink_id.to_string())),
        }
    }

    /// Replace a sink's definition.
    pub async fn update(
        &self,
        session_id: SessionId,
        sink_id: Uuid,
        spec: SinkSpec,
    ) -> Result<Sink, GatewayError> {
        validate_target(&spec.url)?;
        let mut sink = self.get(session_id, sink_id).await?;
        sink.target = spec.url.trim().to_string();
        sink.filter_types = dedup(spec.events);
        sink.secret = spec.secret.filter(|s| !s.is_empty());
        if let Some(policy) = spec.retry_policy {
            sink.retry_policy = policy.normalized();
        }
        if let Some(enabled) = spec.enabled {
            sink.disabled = !enabled;
        }
        self.store.update_sink(&sink).await?;
        self.refresh().await?;
        Ok(sink)
    }

    pub async fn delete(&self, session_id: SessionId, sink_id: Uuid) -> Result<(), GatewayError> {
        self.get(session_id, sink_id).await?;
        self.store.delete_sink(sink_id).await?;
        self.refresh().await?;
        info!(session_id = %session_id, sink_id = %sink_id, "webhook deleted");
        Ok(())
    }

    /// Re-enable a sink the dispatcher disabled.
    pub async fn enable(&self, session_id: SessionId, sink_id: Uuid) -> Result<Sink, GatewayError> {
        let mut sink = self.get(session_id, sink_id).await?;
        self.store.set_sink_disabled(sink_id, false).await?;
        self.refresh().await?;
        sink.disabled = false;
        Ok(sink)
    }

    /// Mark a sink disabled after repeated delivery failures.
    pub async fn disable(&self, sink_id: Uuid) -> Result<(), GatewayError> {
        if sink_id == GLOBAL_SINK_ID {
            warn!("global webhook keeps failing; it cannot be disabled");
            return Ok(());
        }
        self.store.set_sink_disabled(sink_id, true).await?;
        self.refresh().await
    }

    /// Drop every sink of a deleted session.
    pub async fn remove_session(&self, session_id: SessionId) -> Result<u64, GatewayError> {
        let removed = self.store.delete_sinks_for_session(session_id).await?;
        self.refresh().await?;
        Ok(removed)
    }
}

fn dedup(mut events: Vec<EventType>) -> Vec<EventType> {
    let mut seen = Vec::with_capacity(events.len());
    events.retain(|e| {
        if seen.contains(e) {
            false
        } else {
            seen.push(*e);
            true
        }
    });
    events
}

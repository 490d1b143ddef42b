//! Event dispatcher: stamps envelopes with a per-session sequence and fans
//! them out to one ordered delivery worker per (session, sink).

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;
use wagate_core::config::WebhookConfig;
use wagate_core::event::{EventEnvelope, EventType};
use wagate_core::session::SessionId;

use super::delivery::{Delivery, DeliveryClient};
use super::registry::SinkRegistry;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-sink queue bound; the oldest event is dropped on overflow.
    pub queue_capacity: usize,
    /// Consecutive failed deliveries tolerated before a sink is disabled.
    pub disable_after: u32,
    pub timeout: Duration,
}

impl From<&WebhookConfig> for DispatcherConfig {
    fn from(cfg: &WebhookConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            disable_after: cfg.disable_after,
            timeout: cfg.timeout(),
        }
    }
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of the delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub emitted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queued: u64,
    pub workers: u64,
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
}

impl Queue {
    fn pop(&self) -> Option<EventEnvelope> {
        lock(&self.items).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.items).len()
    }

    fn clear(&self) {
        lock(&self.items).clear();
    }
}

struct Worker {
    queue: Arc<Queue>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What a delivery worker needs, without a back-reference to the dispatcher.
#[derive(Clone)]
struct WorkerContext {
    registry: Arc<SinkRegistry>,
    client: DeliveryClient,
    counters: Arc<Counters>,
    disable_after: u32,
}

struct Inner {
    ctx: WorkerContext,
    queue_capacity: usize,
    sequences: Mutex<HashMap<SessionId, u64>>,
    workers: Mutex<HashMap<(SessionId, Uuid), Worker>>,
    cancel: CancellationToken,
}

/// Cheap to clone; every clone feeds the same workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Dispatcher {
    pub fn new(registry: Arc<SinkRegistry>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: WorkerContext {
                    registry,
                    client: DeliveryClient::new(config.timeout),
                    counters: Arc::new(Counters::default()),
                    disable_after: config.disable_after,
                },
                queue_capacity: config.queue_capacity.max(1),
                sequences: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SinkRegistry> {
        &self.inner.ctx.registry
    }

    /// Stamp an event and queue it for every matching sink. Never blocks on
    /// delivery.
    pub fn emit(
        &self,
        session_id: SessionId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> EventEnvelope {
        // Sequence assignment and enqueueing happen under one lock so every
        // sink queue receives a session's events in sequence order.
        let mut sequences = lock(&self.inner.sequences);
        let seq = sequences.entry(session_id).or_insert(0);
        *seq += 1;
        let envelope = EventEnvelope {
            session_id,
            event_type,
            occurred_at: Utc::now(),
            monotonic_seq: *seq,
            payload,
        };
        self.inner
            .ctx
            .counters
            .emitted
            .fetch_add(1, Ordering::Relaxed);

        if !self.inner.cancel.is_cancelled() {
            for sink in self.inner.ctx.registry.matching(session_id, event_type) {
                self.enqueue(session_id, sink.id, envelope.clone());
            }
        }
        drop(sequences);
        envelope
    }

    fn enqueue(&self, session_id: SessionId, sink_id: Uuid, envelope: EventEnvelope) {
        let mut workers = lock(&self.inner.workers);
        let key = (session_id, sink_id);
        let stale = workers
            .get(&key)
            .map_or(true, |w| w.handle.is_finished());
        if stale {
            let queue = Arc::new(Queue::default());
            let cancel = self.inner.cancel.child_token();
            let handle = tokio::spawn(run_worker(
                self.inner.ctx.clone(),
                session_id,
                sink_id,
                queue.clone(),
                cancel.clone(),
            ));
            workers.insert(
                key,
                Worker {
                    queue,
                    cancel,
                    handle,
                },
            );
        }
        let Some(worker) = workers.get(&key) else {
            return;
        };

        let mut items = lock(&worker.queue.items);
        if items.len() >= self.inner.queue_capacity {
            items.pop_front();
            self.inner
                .ctx
                .counters
                .dropped
                .fetch_add(1, Ordering::Relaxed);
            warn!(session_id = %session_id, sink_id = %sink_id, "webhook queue full, dropped oldest event");
        }
        items.push_back(envelope);
        drop(items);
        worker.queue.notify.notify_one();
    }

    /// Stop and join every worker of a session and forget its sequence.
    /// Nothing of that session is delivered once this returns.
    pub async fn purge_session(&self, session_id: SessionId) {
        let removed: Vec<Worker> = {
            let mut workers = lock(&self.inner.workers);
            let keys: Vec<_> = workers
                .keys()
                .filter(|(sid, _)| *sid == session_id)
                .copied()
                .collect();
            keys.iter().filter_map(|k| workers.remove(k)).collect()
        };
        lock(&self.inner.sequences).remove(&session_id);
        for worker in removed {
            worker.queue.clear();
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
        debug!(session_id = %session_id, "dispatcher purged session");
    }

    /// Cancel all workers and wait for them.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let workers: Vec<Worker> = lock(&self.inner.workers).drain().map(|(_, w)| w).collect();
        for worker in workers {
            let _ = worker.handle.await;
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.inner.ctx.counters;
        let workers = lock(&self.inner.workers);
        CounterSnapshot {
            emitted: c.emitted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            queued: workers.values().map(|w| w.queue.len() as u64).sum(),
            workers: workers.values().filter(|w| !w.handle.is_finished()).count() as u64,
        }
    }

    /// Last sequence number issued for a session.
    pub fn last_seq(&self, session_id: SessionId) -> u64 {
        lock(&self.inner.sequences)
            .get(&session_id)
            .copied()
            .unwrap_or(0)
    }
}

async fn run_worker(
    ctx: WorkerContext,
    session_id: SessionId,
    sink_id: Uuid,
    queue: Arc<Queue>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let envelope = match queue.pop() {
            Some(e) => e,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = queue.notify.notified() => {}
                }
                continue;
            }
        };

        // Always deliver with the latest definition of the sink.
        let Some(sink) = ctx.registry.current(session_id, sink_id) else {
            debug!(session_id = %session_id, sink_id = %sink_id, "webhook removed, worker exiting");
            queue.clear();
            return;
        };
        if !sink.accepts(envelope.event_type) {
            if sink.disabled {
                queue.clear();
                return;
            }
            continue;
        }

        match ctx.client.deliver(&sink, &envelope, &cancel).await {
            Delivery::Delivered { attempts } => {
                consecutive_failures = 0;
                ctx.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session_id,
                    sink_id = %sink_id,
                    seq = envelope.monotonic_seq,
                    "event delivered after {attempts} attempt(s)"
                );
            }
            Delivery::Failed { attempts, reason } => {
                consecutive_failures += 1;
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %session_id,
                    sink_id = %sink_id,
                    seq = envelope.monotonic_seq,
                    "event delivery failed after {attempts} attempt(s): {reason}"
                );
                if consecutive_failures > ctx.disable_after {
                    warn!(
                        sink_id = %sink_id,
                        "disabling webhook after {consecutive_failures} consecutive failures"
                    );
                    if let Err(e) = ctx.registry.disable(sink_id).await {
                        error!(sink_id = %sink_id, "failed to disable webhook: {e}");
                    }
                    if ctx
                        .registry
                        .current(session_id, sink_id)
                        .map_or(true, |s| s.disabled) {
                        queue.clear();
                        return;
                    }
                    consecutive_failures = 0;
                }
            }
            Delivery::Canceled => return,
        }
    }
}

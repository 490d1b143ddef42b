//! Event sinks: per-session delivery subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::event::EventType;
use crate::session::SessionId;

/// How events reach a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkTransport {
    HttpPost,
}

impl SinkTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpPost => "http_post",
        }
    }
}

/// Delivery retry schedule: `initial * 2^(n-1)` capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 1_000,
            max_delay_ms: 32_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Clamp user-supplied values into a workable range.
    pub fn normalized(self) -> Self {
        let max_attempts = self.max_attempts.clamp(1, 20);
        let max_delay_ms = self.max_delay_ms.max(self.initial_delay_ms);
        Self {
            max_attempts,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms,
        }
    }
}

/// Persisted sink definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sink {
    pub id: Uuid,
    pub session_id: SessionId,
    pub transport: SinkTransport,
    pub target: String,
    /// Empty means all event types.
    pub filter_types: Vec<EventType>,
    pub secret: Option<String>,
    pub retry_policy: RetryPolicy,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Sink {
    pub fn new(session_id: SessionId, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            transport: SinkTransport::HttpPost,
            target: target.into(),
            filter_types: Vec::new(),
            secret: None,
            retry_policy: RetryPolicy::default(),
            disabled: false,
            created_at: Utc::now(),
        }
    }

    /// Whether this sink wants events of type `t`.
    pub fn accepts(&self, t: EventType) -> bool {
        !self.disabled && (self.filter_types.is_empty() || self.filter_types.contains(&t))
    }
}

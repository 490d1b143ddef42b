//! Normalized inbound event envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;
use crate::session::SessionId;

/// Event types delivered to sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Receipt,
    Presence,
    Group,
    Call,
    HistorySync,
    Connected,
    Disconnected,
    Pair,
    Qr,
    LoggedOut,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::Message,
        EventType::Receipt,
        EventType::Presence,
        EventType::Group,
        EventType::Call,
        EventType::HistorySync,
        EventType::Connected,
        EventType::Disconnected,
        EventType::Pair,
        EventType::Qr,
        EventType::LoggedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Receipt => "receipt",
            Self::Presence => "presence",
            Self::Group => "group",
            Self::Call => "call",
            Self::HistorySync => "history_sync",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Pair => "pair",
            Self::Qr => "qr",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| GatewayError::Validation(format!("unknown event type '{s}'")))
    }
}

/// What a sink receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    /// Strictly increasing per session for the lifetime of the process.
    pub monotonic_seq: u64,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            assert_eq!(
                serde_json::to_string(&t).unwrap(),
                format!("\"{}\"", t.as_str())
            );
        }
        assert!("typing".parse::<EventType>().is_err());
    }

    #[test]
    fn test_envelope_field_names() {
        let env = EventEnvelope {
            session_id: SessionId::new(),
            event_type: EventType::HistorySync,
            occurred_at: Utc::now(),
            monotonic_seq: 7,
            payload: serde_json::json!({"conversations": 3}),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "history_sync");
        assert_eq!(v["monotonic_seq"], 7);
        assert!(v.get("session_id").is_some());
        assert!(v.get("occurred_at").is_some());
    }
}

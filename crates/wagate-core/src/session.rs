//! Session records and their lifecycle vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::GatewayError;

/// Stable session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Live connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Waiting for a QR scan or pair code.
    #[serde(rename = "qr_code")]
    Qr,
    Connected,
    Error,
    Terminating,
}

impl ConnectionState {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Qr => "qr_code",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Terminating => "terminating",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Socks5,
}

/// Outbound proxy for a session's WhatsApp connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(GatewayError::Validation("proxy host is required".into()));
        }
        if host.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
            return Err(GatewayError::Validation(format!(
                "proxy host '{host}' is not a hostname"
            )));
        }
        if self.port == 0 {
            return Err(GatewayError::Validation("proxy port must not be 0".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(GatewayError::Validation(
                "proxy password given without username".into(),
            ));
        }
        Ok(())
    }

    /// Proxy URL without credentials, safe to log.
    pub fn redacted_url(&self) -> String {
        let scheme = match self.scheme {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub device_jid: Option<String>,
    /// Durable connection intent: true while the session is meant to be online.
    pub connected: bool,
    pub last_error: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>, proxy: Option<ProxyConfig>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            device_jid: None,
            connected: false,
            last_error: None,
            proxy,
            created_at: now,
            updated_at: now,
            connected_at: None,
            last_seen: None,
        }
    }
}

/// Filter for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub connected: Option<bool>,
    pub name_prefix: Option<String>,
}

/// Session names are 1..=64 characters of `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() || name.len() > 64 {
        return Err(GatewayError::Validation(
            "session name must be 1 to 64 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GatewayError::Validation(format!(
            "session name '{name}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alpha").is_ok());
        assert!(validate_name("tenant_01-main").is_ok());
        assert!(validate_name(&"a".repeat(64)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dots.not.allowed").is_err());
        assert!(validate_name("ñ").is_err());
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(ConnectionState::Qr.as_str(), "qr_code");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Qr).unwrap(),
            "\"qr_code\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }

    #[test]
    fn test_proxy_validation() {
        let mut proxy = ProxyConfig {
            scheme: ProxyScheme::Socks5,
            host: "proxy.local".into(),
            port: 1080,
            username: None,
            password: None,
        };
        assert!(proxy.validate().is_ok());
        assert_eq!(proxy.redacted_url(), "socks5://proxy.local:1080");

        proxy.port = 0;
        assert!(proxy.validate().is_err());
        proxy.port = 1080;
        proxy.password = Some("pw".into());
        assert!(proxy.validate().is_err());
        proxy.username = Some("user".into());
        assert!(proxy.validate().is_ok());
        proxy.host = "http://x".into();
        assert!(proxy.validate().is_err());
    }

    #[test]
    fn test_proxy_json_shape() {
        let proxy: ProxyConfig =
            serde_json::from_str(r#"{"scheme":"http","host":"10.0.0.1","port":3128}"#).unwrap();
        assert_eq!(proxy.scheme, ProxyScheme::Http);
        assert!(serde_json::from_str::<ProxyConfig>(
            r#"{"scheme":"ftp","host":"10.0.0.1","port":21}"#
        )
        .is_err());
    }

    #[test]
    fn test_session_id_roundtrip_string() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("alpha".parse::<SessionId>().is_err());
    }
}

//! WhatsApp addresses (JIDs).
//!
//! The gateway treats JIDs as opaque apart from splitting `user[:device]@server`
//! and normalizing bare phone numbers to the user server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

pub const USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const LID_SERVER: &str = "lid";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const BROADCAST_SERVER: &str = "broadcast";

const KNOWN_SERVERS: [&str; 5] = [
    USER_SERVER,
    GROUP_SERVER,
    LID_SERVER,
    NEWSLETTER_SERVER,
    BROADCAST_SERVER,
];

/// A parsed WhatsApp address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Jid {
    pub user: String,
    pub device: Option<u16>,
    pub server: String,
}

impl Jid {
    /// Address of a phone number on the user server.
    pub fn user(phone: impl Into<String>) -> Self {
        Self {
            user: phone.into(),
            device: None,
            server: USER_SERVER.to_string(),
        }
    }

    /// Address of a group.
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            user: id.into(),
            device: None,
            server: GROUP_SERVER.to_string(),
        }
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = Some(device);
        self
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// The same address without its device part.
    pub fn to_non_ad(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            device: None,
            server: self.server.clone(),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(d) => write!(f, "{}:{}@{}", self.user, d, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::InvalidTarget(s.to_string());
        let (left, server) = s.split_once('@').ok_or_else(invalid)?;
        if server.is_empty() || !KNOWN_SERVERS.contains(&server) {
            return Err(invalid());
        }
        let (user, device) = match left.split_once(':') {
            Some((user, device)) => (user, Some(device.parse::<u16>().map_err(|_| invalid())?)),
            None => (left, None),
        };
        if user.is_empty() {
            return Err(invalid());
        }
        Ok(Jid {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Strip formatting from a phone number. Returns `None` unless the result is
/// 6..=20 digits.
pub fn clean_phone(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let mut digits = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return None,
        }
    }
    if (6..=20).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

/// Resolve a recipient given as a bare phone number or a full JID.
pub fn parse_target(input: &str) -> Result<Jid, GatewayError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GatewayError::InvalidTarget(String::new()));
    }
    if input.contains('@') {
        return input.parse();
    }
    clean_phone(input)
        .map(Jid::user)
        .ok_or_else(|| GatewayError::InvalidTarget(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_phone_normalizes_to_user_server() {
        let jid = parse_target("5511999999999").unwrap();
        assert_eq!(jid.to_string(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn test_formatted_phone_is_cleaned() {
        let jid = parse_target("+55 (11) 99999-9999").unwrap();
        assert_eq!(jid.user, "5511999999999");
    }

    #[test]
    fn test_full_jids_pass_through() {
        for s in [
            "5511999999999@s.whatsapp.net",
            "120363025246125486@g.us",
            "123456789@lid",
            "5511999999999:12@s.whatsapp.net",
        ] {
            assert_eq!(parse_target(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_group_detection() {
        assert!(parse_target("120363025246125486@g.us").unwrap().is_group());
        assert!(!parse_target("5511999999999").unwrap().is_group());
    }

    #[test]
    fn test_rejects_garbage() {
        for s in ["", "abc", "12", "55119999@example.com", "@s.whatsapp.net", "55:x@s.whatsapp.net"] {
            assert!(
                matches!(parse_target(s), Err(GatewayError::InvalidTarget(_))),
                "{s} should be rejected"
            );
        }
    }

    #[test]
    fn test_device_is_dropped_by_to_non_ad() {
        let jid: Jid = "5511999999999:3@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, Some(3));
        assert_eq!(jid.to_non_ad().to_string(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn test_serde_as_string() {
        let jid = Jid::user("5511999999999");
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"5511999999999@s.whatsapp.net\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}

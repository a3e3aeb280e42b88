//! Core identifier types shared across the hub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HubError, Result};

/// Maximum length of a server identifier
pub const MAX_SERVER_ID_LEN: usize = 100;

/// Maximum length of a capability local name
pub const MAX_LOCAL_NAME_LEN: usize = 200;

/// Validated upstream server identifier.
///
/// Client-supplied, restricted to `[A-Za-z0-9_-]+` and at most
/// [`MAX_SERVER_ID_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    /// Validate and construct a server identifier
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(HubError::config("server id cannot be empty"));
        }
        if raw.len() > MAX_SERVER_ID_LEN {
            return Err(HubError::config(format!(
                "server id too long: {} chars (max {MAX_SERVER_ID_LEN})",
                raw.len()
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(HubError::config(format!(
                "server id '{raw}' contains characters outside [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerId {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServerId {
    type Error = HubError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Message identifier used for transport-level correlation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl MessageId {
    /// Render the identifier as a correlation key
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        Self::Number(n as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_validation() {
        assert!(ServerId::new("srv_a").is_ok());
        assert!(ServerId::new("Srv-01").is_ok());
        assert!(ServerId::new("").is_err());
        assert!(ServerId::new("bad.id").is_err());
        assert!(ServerId::new("bad id").is_err());
        assert!(ServerId::new("x".repeat(MAX_SERVER_ID_LEN)).is_ok());
        assert!(ServerId::new("x".repeat(MAX_SERVER_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_server_id_serde() {
        let id: ServerId = serde_json::from_str("\"srv_a\"").unwrap();
        assert_eq!(id.as_str(), "srv_a");
        assert!(serde_json::from_str::<ServerId>("\"bad.id\"").is_err());
    }

    #[test]
    fn test_message_id_untagged() {
        let id: MessageId = serde_json::from_str("42").unwrap();
        assert_eq!(id, MessageId::Number(42));
        let id: MessageId = serde_json::from_str("\"req-1\"").unwrap();
        assert_eq!(id.as_key(), "req-1");
    }
}

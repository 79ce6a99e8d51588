// src/types/mod.rs - Shared chat, connection and classification types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical identity of a chat participant.
///
/// The stored form is always trimmed and lower-cased, so every set keyed by
/// `Username` compares case-insensitively without call sites having to
/// remember to fold case. Presentation casing lives in
/// [`ChatMessage::display_name`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Username {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Username {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<Username> for String {
    fn from(username: Username) -> Self {
        username.0
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat line extracted from an inbound PRIVMSG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: String,
    pub username: Username,
    /// Falls back to the username when the server sent no display name.
    pub display_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of the chat connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    /// Two states are the same kind when they only differ by error text.
    pub fn same_kind(&self, other: &ConnectionState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Connecting or Connected: a connect request must tear this down first.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Status line shown to the operator
    pub fn indicator(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "🟢 Connected",
            ConnectionState::Connecting => "🟡 Connecting...",
            ConnectionState::Error(_) => "🔴 Error",
            ConnectionState::Disconnected => "⚫ Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(message) => write!(f, "{} ({})", self.indicator(), message),
            _ => f.write_str(self.indicator()),
        }
    }
}

/// Events broadcast by a platform connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Error(String),
    Message(ChatMessage),
}

/// A chatter seen for the first time in the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatter {
    pub username: Username,
    pub display_name: String,
    pub already_acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Bot,
    AlreadySeen,
}

/// Outcome of classifying one chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NewChatter(NewChatter),
    Suppressed(SuppressReason),
}

impl Classification {
    pub fn is_new_chatter(&self) -> bool {
        matches!(self, Classification::NewChatter(_))
    }
}

/// Events broadcast by the chatter tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    NewChatter(NewChatter),
    AcknowledgmentChanged { username: Username, acknowledged: bool },
    PeriodReset { date: NaiveDate, manual: bool },
}

/// Reasons a connection attempt is refused before any transport is opened
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("configuration required: missing {}", .missing.join(", "))]
    ConfigurationRequired { missing: Vec<&'static str> },

    #[error("invalid chat endpoint: {0}")]
    InvalidEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_is_case_folded() {
        let upper = Username::new("  CoolUser ");
        let lower = Username::from("cooluser");

        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "cooluser");
    }

    #[test]
    fn test_username_deserializes_canonically() {
        let names: Vec<Username> = serde_json::from_str(r#"["Alice", "BOB"]"#).unwrap();
        assert_eq!(names, vec![Username::new("alice"), Username::new("bob")]);

        let json = serde_json::to_string(&names).unwrap();
        assert_eq!(json, r#"["alice","bob"]"#);
    }

    #[test]
    fn test_connection_state_kind_ignores_error_text() {
        let first = ConnectionState::Error("reset by peer".to_string());
        let second = ConnectionState::Error("timed out".to_string());

        assert!(first.same_kind(&second));
        assert!(!first.same_kind(&ConnectionState::Disconnected));
        assert_eq!(first.indicator(), "🔴 Error");
    }

    #[test]
    fn test_configuration_required_message() {
        let err = ConnectError::ConfigurationRequired {
            missing: vec!["channel", "oauth_token"],
        };
        assert_eq!(err.to_string(), "configuration required: missing channel, oauth_token");
    }
}

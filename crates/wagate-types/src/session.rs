//! Session record types and connection status.

use crate::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A handle is being established (or re-established after a drop).
    Connecting,
    /// The account is linked and the connection is up.
    Open,
    /// Terminal. The record is about to be removed.
    Closed,
}

impl SessionStatus {
    pub fn is_live(self) -> bool {
        !matches!(self, SessionStatus::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the messaging library closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum CloseReason {
    /// The account was unlinked from the phone, or logged out explicitly.
    LoggedOut,
    /// Transport dropped.
    ConnectionLost,
    /// Server stopped responding.
    TimedOut,
    /// Another client took over the session.
    Replaced,
    /// Server asked for a restart (typically right after pairing).
    Restarting,
    /// Any other status code reported by the library.
    Other(u16),
}

impl CloseReason {
    /// Map a disconnect status code as reported by the WhatsApp Web library.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => CloseReason::LoggedOut,
            408 => CloseReason::TimedOut,
            428 => CloseReason::ConnectionLost,
            440 => CloseReason::Replaced,
            515 => CloseReason::Restarting,
            other => CloseReason::Other(other),
        }
    }

    /// Logout-class closures destroy the session and its credentials.
    pub fn is_logout(self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}

/// The linked account, as reported by the library once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Snapshot of one tenant's session, as exposed outside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub identity: Identity,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the status last transitioned to `Open`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Only meaningful while `Connecting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AccountUser>,
    /// Consecutive failed reconnect attempts since the last successful open.
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl SessionRecord {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

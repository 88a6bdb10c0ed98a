//! Messages pushed to event-stream WebSocket clients.

use crate::{AccountUser, Identity, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a record left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The library reported a logout-class close.
    LoggedOut,
    /// Explicit disconnect request.
    Disconnected,
    /// Closed under the `any_close` cleanup policy.
    Closed,
    /// Reconnect attempts ran out; credentials were kept.
    ReconnectExhausted,
    /// The opening handle could not be established.
    InitFailed,
}

/// Messages sent from server to event-stream clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// A record changed status.
    StatusChange {
        identity: Identity,
        old_status: SessionStatus,
        new_status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<AccountUser>,
    },
    /// A pairing code was issued and is waiting to be entered on the phone.
    PairingCode { identity: Identity, code: String },
    /// A reconnect was scheduled after a transient close.
    Reconnecting {
        identity: Identity,
        attempt: u32,
        delay_ms: u64,
    },
    /// A record was removed from the registry.
    Removed {
        identity: Identity,
        reason: RemovalReason,
    },
    /// An inbound message arrived on a tenant's account.
    Message {
        identity: Identity,
        from: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Error notification.
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let msg = WsServerMessage::Removed {
            identity: Identity::parse("628111").unwrap(),
            reason: RemovalReason::LoggedOut,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "removed");
        assert_eq!(json["reason"], "logged_out");
    }
}

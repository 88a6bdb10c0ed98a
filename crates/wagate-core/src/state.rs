//! Per-record connection state machine.

use serde::{Deserialize, Serialize};
use wagate_types::{CloseReason, RemovalReason, SessionStatus};

/// Which closures destroy a record together with its stored credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Only logout-class closes (and explicit disconnects) destroy; anything
    /// else reconnects from the stored credentials.
    #[default]
    LogoutOnly,
    /// Every close destroys the record and erases its credentials.
    AnyClose,
}

/// Inputs that drive a record's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Library reported the connection open.
    Opened,
    /// Library reported the connection closed.
    Closed(CloseReason),
    /// Caller asked for the record to be torn down.
    Disconnect,
}

/// What the registry must do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Connecting -> Open.
    Open,
    /// Back to Connecting; schedule a reconnect from stored credentials.
    Reconnect,
    /// -> Closed; remove the record and erase its credentials.
    Destroy(RemovalReason),
    /// Signal has no effect in the current status.
    Ignore,
}

pub fn transition(status: SessionStatus, signal: Signal, policy: CleanupPolicy) -> Transition {
    match (status, signal) {
        (SessionStatus::Closed, _) => Transition::Ignore,
        (SessionStatus::Connecting, Signal::Opened) => Transition::Open,
        (SessionStatus::Open, Signal::Opened) => Transition::Ignore,
        (_, Signal::Disconnect) => Transition::Destroy(RemovalReason::Disconnected),
        (_, Signal::Closed(reason)) if reason.is_logout() => {
            Transition::Destroy(RemovalReason::LoggedOut)
        }
        (_, Signal::Closed(_)) => match policy {
            CleanupPolicy::LogoutOnly => Transition::Reconnect,
            CleanupPolicy::AnyClose => Transition::Destroy(RemovalReason::Closed),
        },
    }
}

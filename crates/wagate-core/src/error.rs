//! Error types for wagate.

use crate::ClientError;
use std::time::Duration;
use thiserror::Error;
use wagate_types::{Identity, IdentityError};

#[derive(Error, Debug)]
pub enum WagateError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("Failed to open connection for {identity}: {source}")]
    ConnectionInit {
        identity: Identity,
        #[source]
        source: ClientError,
    },

    #[error("Connection for {identity} not ready after {timeout:?}")]
    NotReady { identity: Identity, timeout: Duration },

    #[error("Pairing code request for {identity} failed: {source}")]
    PairingRequest {
        identity: Identity,
        #[source]
        source: ClientError,
    },

    #[error("Unknown identity: {0}")]
    UnknownIdentity(Identity),

    #[error("Session {0} is not connected")]
    NotConnected(Identity),

    #[error("Sending message from {identity} failed: {source}")]
    SendFailed {
        identity: Identity,
        #[source]
        source: ClientError,
    },

    #[error("Connection limit exceeded: max {0} concurrent connections")]
    ConnectionLimitExceeded(usize),

    #[error("Failed to erase credentials for {identity}: {source}")]
    Cleanup {
        identity: Identity,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

//! Connection registry and messaging-client plumbing for wagate.

mod bridge;
mod client;
mod credentials;
mod error;
mod registry;
mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeClient, BridgeConfig};
pub use client::{
    ClientError, ClientEvent, ClientResult, Credentials, EventSender, MessagingClient,
    SessionHandle,
};
pub use credentials::{CredentialStore, FsCredentialStore};
pub use error::WagateError;
pub use registry::{
    ConnectionRegistry, DisconnectOutcome, PairingOutcome, RegistryConfig, RegistryEvent,
    SentMessage,
};
pub use state::{transition, CleanupPolicy, Signal, Transition};

/// Result type for wagate operations.
pub type Result<T> = std::result::Result<T, WagateError>;

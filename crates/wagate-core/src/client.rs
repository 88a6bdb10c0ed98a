//! Capability interface for the external messaging library.
//!
//! The registry never talks WhatsApp itself. It opens one [`SessionHandle`] per
//! identity through a [`MessagingClient`] and consumes the [`ClientEvent`]s the
//! handle emits. Any library that fits this shape can back the gateway.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use wagate_types::{AccountUser, CloseReason, Identity};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque persisted credential blob. Contents are owned by the library.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(<{} bytes>)", self.0.len())
    }
}

/// Events emitted by an open session handle.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport is up; a pairing code can be requested.
    Ready,
    /// The account is authenticated and the connection is open.
    Opened { user: Option<AccountUser> },
    /// The connection closed. No further events follow for this handle.
    Closed { reason: CloseReason },
    /// The library rotated its credentials; they must be persisted.
    CredentialsUpdated(Credentials),
    /// Inbound text message from another account.
    MessageReceived { from: String, text: String },
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Factory for live connections.
#[async_trait]
pub trait MessagingClient: Send + Sync + 'static {
    /// Open a connection for `identity`, resuming from `credentials` when present.
    ///
    /// The handle reports its lifecycle through `events` until it closes.
    async fn open(
        &self,
        identity: &Identity,
        credentials: Option<Credentials>,
        events: EventSender,
    ) -> ClientResult<Arc<dyn SessionHandle>>;
}

/// A single live connection owned by the registry.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    /// Ask the server for a pairing code to link `phone_number`.
    async fn request_pairing_code(&self, phone_number: &str) -> ClientResult<String>;

    /// Send a text message, returning the library's message id.
    async fn send_text(&self, jid: &str, text: &str) -> ClientResult<String>;

    /// Unlink the account on the server side.
    async fn logout(&self) -> ClientResult<()>;

    /// Drop the connection without logging out. Must be idempotent.
    async fn close(&self);
}

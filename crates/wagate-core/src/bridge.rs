//! WebSocket client for the messaging bridge.
//!
//! The bridge is a sidecar that owns the actual WhatsApp protocol stack. Each
//! identity gets its own socket at `<url>/sessions/<identity>`; frames are JSON
//! objects tagged by `type`.

use crate::{
    ClientError, ClientEvent, ClientResult, Credentials, EventSender, MessagingClient,
    SessionHandle,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use wagate_types::{AccountUser, CloseReason, Identity};

/// Bridge connection settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:3100`.
    pub url: String,
    pub connect_timeout: Duration,
    /// Bound on pairing, send and logout round-trips.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3100".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Frames sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayFrame {
    Open {
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<Value>,
    },
    RequestPairingCode {
        request_id: Uuid,
        phone_number: String,
    },
    SendText {
        request_id: Uuid,
        to: String,
        text: String,
    },
    Logout {
        request_id: Uuid,
    },
}

impl GatewayFrame {
    fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::RequestPairingCode { .. } => "request_pairing_code",
            Self::SendText { .. } => "send_text",
            Self::Logout { .. } => "logout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Frames received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Ready,
    ConnectionUpdate {
        state: ConnectionState,
        #[serde(default)]
        user: Option<AccountUser>,
        #[serde(default)]
        status_code: Option<u16>,
    },
    CredentialsUpdate {
        credentials: Value,
    },
    Message {
        from: String,
        text: String,
    },
    Result {
        request_id: Uuid,
        ok: bool,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl BridgeFrame {
    fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::ConnectionUpdate { .. } => "connection_update",
            Self::CredentialsUpdate { .. } => "credentials_update",
            Self::Message { .. } => "message",
            Self::Result { .. } => "result",
        }
    }
}

/// Map a lifecycle frame to a client event. Request results return `None`.
fn translate(frame: BridgeFrame) -> ClientResult<Option<ClientEvent>> {
    let event = match frame {
        BridgeFrame::Ready => Some(ClientEvent::Ready),
        BridgeFrame::ConnectionUpdate { state, user, status_code } => match state {
            ConnectionState::Connecting => None,
            ConnectionState::Open => Some(ClientEvent::Opened { user }),
            ConnectionState::Close => Some(ClientEvent::Closed {
                reason: status_code
                    .map(CloseReason::from_status_code)
                    .unwrap_or(CloseReason::ConnectionLost),
            }),
        },
        BridgeFrame::CredentialsUpdate { credentials } => Some(ClientEvent::CredentialsUpdated(
            Credentials::new(serde_json::to_vec(&credentials)?),
        )),
        BridgeFrame::Message { from, text } => Some(ClientEvent::MessageReceived { from, text }),
        BridgeFrame::Result { .. } => None,
    };
    Ok(event)
}

type PendingReply = oneshot::Sender<ClientResult<Option<Value>>>;

struct Shared {
    pending: DashMap<Uuid, PendingReply>,
    /// We initiated the close; the socket ending is expected.
    closing: AtomicBool,
    /// The bridge already reported a close for this connection.
    close_reported: AtomicBool,
}

impl Shared {
    fn fail_pending(&self) {
        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
    }
}

/// [`MessagingClient`] backed by the bridge sidecar.
pub struct BridgeClient {
    config: BridgeConfig,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    fn session_url(&self, identity: &Identity) -> String {
        format!(
            "{}/sessions/{}",
            self.config.url.trim_end_matches('/'),
            identity
        )
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn open(
        &self,
        identity: &Identity,
        credentials: Option<Credentials>,
        events: EventSender,
    ) -> ClientResult<Arc<dyn SessionHandle>> {
        let url = self.session_url(identity);
        debug!(target: "wagate::bridge", "Connecting to bridge at {}", url);

        let credentials = credentials
            .map(|c| serde_json::from_slice::<Value>(c.as_bytes()))
            .transpose()
            .map_err(|e| ClientError::InvalidCredentials(e.to_string()))?;

        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout))??;
        let (mut sink, mut stream) = ws.split();

        let open = GatewayFrame::Open { credentials };
        trace!(target: "wagate::bridge", "-> {} for {}", open.kind(), identity);
        let open = serde_json::to_string(&open)?;
        sink.send(Message::Text(open.into())).await?;

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closing: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
        });

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Ends once every sender is gone or after writing a close frame.
        let writer_identity = identity.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(target: "wagate::bridge", "Bridge write for {} failed: {}", writer_identity, e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader_identity = identity.clone();
        let reader_shared = Arc::clone(&shared);
        let pong = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(data)) => {
                        let _ = pong.send(Message::Pong(data));
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(target: "wagate::bridge", "Bridge socket for {} failed: {}", reader_identity, e);
                        break;
                    }
                };

                let frame = match serde_json::from_str::<BridgeFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(target: "wagate::bridge", "Ignoring malformed bridge frame for {}: {}", reader_identity, e);
                        continue;
                    }
                };
                // Payloads may carry credentials; only the frame type is logged.
                trace!(target: "wagate::bridge", "<- {} for {}", frame.kind(), reader_identity);

                if let BridgeFrame::Result { request_id, ok, value, error } = frame {
                    if let Some((_, reply)) = reader_shared.pending.remove(&request_id) {
                        let result = if ok {
                            Ok(value)
                        } else {
                            Err(ClientError::Rejected(
                                error.unwrap_or_else(|| "request failed".to_string()),
                            ))
                        };
                        let _ = reply.send(result);
                    }
                    continue;
                }

                match translate(frame) {
                    Ok(Some(event)) => {
                        if matches!(event, ClientEvent::Closed { .. }) {
                            reader_shared.close_reported.store(true, Ordering::SeqCst);
                        }
                        let _ = events.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(target: "wagate::bridge", "Failed to decode bridge frame for {}: {}", reader_identity, e);
                    }
                }
            }

            reader_shared.fail_pending();
            if !reader_shared.closing.load(Ordering::SeqCst)
                && !reader_shared.close_reported.load(Ordering::SeqCst)
            {
                info!(target: "wagate::bridge", "Bridge socket for {} ended unexpectedly", reader_identity);
                let _ = events.send(ClientEvent::Closed {
                    reason: CloseReason::ConnectionLost,
                });
            }
        });

        info!(target: "wagate::bridge", "Bridge session opened for {}", identity);
        Ok(Arc::new(BridgeHandle {
            identity: identity.clone(),
            outbound,
            shared,
            request_timeout: self.config.request_timeout,
            reader,
        }))
    }
}

struct BridgeHandle {
    identity: Identity,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeHandle {
    async fn request(&self, build: impl FnOnce(Uuid) -> GatewayFrame) -> ClientResult<Option<Value>> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let request_id = Uuid::new_v4();
        let frame = build(request_id);
        trace!(target: "wagate::bridge", "-> {} ({}) for {}", frame.kind(), request_id, self.identity);
        let frame = serde_json::to_string(&frame)?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);

        if self.outbound.send(Message::Text(frame.into())).is_err() {
            self.shared.pending.remove(&request_id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(ClientError::Timeout(self.request_timeout))
            }
        }
    }
}

fn expect_string(value: Option<Value>, what: &str) -> ClientResult<String> {
    match value {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Object(map)) => map
            .get(what)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol(format!("result is missing `{}`", what))),
        _ => Err(ClientError::Protocol(format!("result is missing `{}`", what))),
    }
}

#[async_trait]
impl SessionHandle for BridgeHandle {
    async fn request_pairing_code(&self, phone_number: &str) -> ClientResult<String> {
        let value = self
            .request(|request_id| GatewayFrame::RequestPairingCode {
                request_id,
                phone_number: phone_number.to_string(),
            })
            .await?;
        expect_string(value, "code")
    }

    async fn send_text(&self, jid: &str, text: &str) -> ClientResult<String> {
        let value = self
            .request(|request_id| GatewayFrame::SendText {
                request_id,
                to: jid.to_string(),
                text: text.to_string(),
            })
            .await?;
        expect_string(value, "id")
    }

    async fn logout(&self) -> ClientResult<()> {
        self.request(|request_id| GatewayFrame::Logout { request_id })
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "wagate::bridge", "Closing bridge session for {}", self.identity);
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
        self.shared.fail_pending();
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

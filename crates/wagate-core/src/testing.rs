//! In-memory doubles for the messaging client and credential store.
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream crates that drive the registry without a real bridge.

use crate::{
    ClientError, ClientEvent, ClientResult, CredentialStore, Credentials, EventSender,
    MessagingClient, SessionHandle,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use wagate_types::{AccountUser, CloseReason, Identity};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct ScriptedSession {
    sender: Option<EventSender>,
    credentials: Option<Credentials>,
    closed: Arc<AtomicBool>,
    logouts: usize,
    sent: Vec<(String, String)>,
}

struct Script {
    opens: usize,
    failing_opens: usize,
    auto_ready: bool,
    pairing_code: String,
    fail_pairing: bool,
    fail_logout: bool,
    pairing_requests: usize,
    open_delays: HashMap<Identity, Duration>,
    sessions: HashMap<Identity, ScriptedSession>,
}

/// A [`MessagingClient`] whose connections are driven by the test.
#[derive(Clone)]
pub struct ScriptedClient {
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedClient {
    /// Connections become ready immediately and hand out `ABCD-1234` as pairing code.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                opens: 0,
                failing_opens: 0,
                auto_ready: true,
                pairing_code: "ABCD-1234".to_string(),
                fail_pairing: false,
                fail_logout: false,
                pairing_requests: 0,
                open_delays: HashMap::new(),
                sessions: HashMap::new(),
            })),
        }
    }

    /// Total `open` calls, failed ones included.
    pub fn open_count(&self) -> usize {
        lock(&self.script).opens
    }

    pub fn fail_next_opens(&self, n: usize) {
        lock(&self.script).failing_opens = n;
    }

    /// Make every `open` for `identity` take `delay` before it returns.
    pub fn set_open_delay(&self, identity: &Identity, delay: Duration) {
        lock(&self.script).open_delays.insert(identity.clone(), delay);
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        lock(&self.script).auto_ready = auto_ready;
    }

    pub fn set_pairing_code(&self, code: &str) {
        lock(&self.script).pairing_code = code.to_string();
    }

    pub fn fail_pairing(&self, fail: bool) {
        lock(&self.script).fail_pairing = fail;
    }

    pub fn fail_logout(&self, fail: bool) {
        lock(&self.script).fail_logout = fail;
    }

    pub fn pairing_requests(&self) -> usize {
        lock(&self.script).pairing_requests
    }

    /// Event sender of the most recent connection for `identity`.
    pub fn sender(&self, identity: &Identity) -> Option<EventSender> {
        lock(&self.script)
            .sessions
            .get(identity)
            .and_then(|s| s.sender.clone())
    }

    /// Push an event through the most recent connection for `identity`.
    pub fn emit(&self, identity: &Identity, event: ClientEvent) {
        if let Some(sender) = self.sender(identity) {
            let _ = sender.send(event);
        }
    }

    /// Report the connection open, as after a successful pairing.
    pub fn open(&self, identity: &Identity) {
        self.emit(
            identity,
            ClientEvent::Opened {
                user: Some(AccountUser {
                    id: identity.jid(),
                    name: None,
                }),
            },
        );
    }

    pub fn close(&self, identity: &Identity, reason: CloseReason) {
        self.emit(identity, ClientEvent::Closed { reason });
    }

    /// Credentials passed to the most recent `open` for `identity`.
    pub fn opened_with(&self, identity: &Identity) -> Option<Credentials> {
        lock(&self.script)
            .sessions
            .get(identity)
            .and_then(|s| s.credentials.clone())
    }

    pub fn logout_count(&self, identity: &Identity) -> usize {
        lock(&self.script)
            .sessions
            .get(identity)
            .map(|s| s.logouts)
            .unwrap_or(0)
    }

    /// Whether the most recent connection for `identity` was closed.
    pub fn is_closed(&self, identity: &Identity) -> bool {
        lock(&self.script)
            .sessions
            .get(identity)
            .map(|s| s.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// `(jid, text)` pairs sent from `identity`.
    pub fn sent_messages(&self, identity: &Identity) -> Vec<(String, String)> {
        lock(&self.script)
            .sessions
            .get(identity)
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    async fn open(
        &self,
        identity: &Identity,
        credentials: Option<Credentials>,
        events: EventSender,
    ) -> ClientResult<Arc<dyn SessionHandle>> {
        let delay = {
            let mut script = lock(&self.script);
            script.opens += 1;
            script.open_delays.get(identity).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = lock(&self.script);
        if script.failing_opens > 0 {
            script.failing_opens -= 1;
            return Err(ClientError::Connect("scripted failure".to_string()));
        }

        if script.auto_ready {
            let _ = events.send(ClientEvent::Ready);
        }

        let closed = Arc::new(AtomicBool::new(false));
        let session = script.sessions.entry(identity.clone()).or_default();
        session.sender = Some(events.clone());
        session.credentials = credentials;
        session.closed = Arc::clone(&closed);

        Ok(Arc::new(ScriptedHandle {
            identity: identity.clone(),
            script: Arc::clone(&self.script),
            events,
            closed,
        }))
    }
}

struct ScriptedHandle {
    identity: Identity,
    script: Arc<Mutex<Script>>,
    events: EventSender,
    closed: Arc<AtomicBool>,
}

impl ScriptedHandle {
    fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for ScriptedHandle {
    async fn request_pairing_code(&self, _phone_number: &str) -> ClientResult<String> {
        self.ensure_open()?;
        let mut script = lock(&self.script);
        script.pairing_requests += 1;
        if script.fail_pairing {
            return Err(ClientError::Rejected("pairing refused".to_string()));
        }
        Ok(script.pairing_code.clone())
    }

    async fn send_text(&self, jid: &str, text: &str) -> ClientResult<String> {
        self.ensure_open()?;
        let mut script = lock(&self.script);
        let session = script.sessions.entry(self.identity.clone()).or_default();
        session.sent.push((jid.to_string(), text.to_string()));
        Ok(format!("MSG{:04}", session.sent.len()))
    }

    async fn logout(&self) -> ClientResult<()> {
        self.ensure_open()?;
        {
            let mut script = lock(&self.script);
            if script.fail_logout {
                return Err(ClientError::Rejected("logout refused".to_string()));
            }
            script.sessions.entry(self.identity.clone()).or_default().logouts += 1;
        }
        let _ = self.events.send(ClientEvent::Closed {
            reason: CloseReason::LoggedOut,
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A [`CredentialStore`] backed by a map.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    slots: Arc<Mutex<HashMap<Identity, Credentials>>>,
    fail_erase: Arc<AtomicBool>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: &Identity, credentials: Credentials) {
        lock(&self.slots).insert(identity.clone(), credentials);
    }

    /// Make every following `erase` fail.
    pub fn fail_erase(&self, fail: bool) {
        self.fail_erase.store(fail, Ordering::SeqCst);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, identity: &Identity) -> io::Result<Option<Credentials>> {
        Ok(lock(&self.slots).get(identity).cloned())
    }

    fn save(&self, identity: &Identity, credentials: &Credentials) -> io::Result<()> {
        lock(&self.slots).insert(identity.clone(), credentials.clone());
        Ok(())
    }

    fn erase(&self, identity: &Identity) -> io::Result<()> {
        if self.fail_erase.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "scripted erase failure",
            ));
        }
        lock(&self.slots).remove(identity);
        Ok(())
    }

    fn exists(&self, identity: &Identity) -> bool {
        lock(&self.slots).contains_key(identity)
    }

    fn list(&self) -> io::Result<Vec<Identity>> {
        let mut identities: Vec<Identity> = lock(&self.slots).keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }
}

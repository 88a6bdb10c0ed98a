//! Connection registry: one live messaging session per tenant identity.
//!
//! Every state change for an identity happens while holding that identity's
//! entry lock, so library callbacks, reconnect timers, pairing requests and
//! disconnects for the same number never interleave. Different identities
//! never share a lock.
//!
//! The lock may be held across library calls (open, logout). Readers never take
//! it: each mutation publishes a fresh [`SessionRecord`] into the entry's view,
//! and `lookup`/`list_active` read that.

use crate::state::{transition, CleanupPolicy, Signal, Transition};
use crate::{
    ClientError, ClientEvent, CredentialStore, MessagingClient, Result, SessionHandle, WagateError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wagate_types::{
    recipient_jid, AccountUser, Identity, RemovalReason, SessionRecord, SessionStatus,
};

/// Configuration for the connection registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a pairing request waits for the handle to become ready.
    pub ready_timeout: Duration,
    /// Delay before the first reconnect after a transient close.
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential reconnect backoff.
    pub reconnect_max_delay: Duration,
    /// Reconnects scheduled without reaching `Open` before giving up.
    pub max_reconnect_attempts: u32,
    pub max_connections: usize,
    pub cleanup_policy: CleanupPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            max_connections: 100,
            cleanup_policy: CleanupPolicy::LogoutOnly,
        }
    }
}

impl RegistryConfig {
    /// Backoff before reconnect attempt `attempt` (1-based).
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

/// Events broadcast by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    StatusChanged {
        identity: Identity,
        old_status: SessionStatus,
        new_status: SessionStatus,
        user: Option<AccountUser>,
    },
    PairingCodeIssued {
        identity: Identity,
        code: String,
    },
    ReconnectScheduled {
        identity: Identity,
        attempt: u32,
        delay: Duration,
    },
    Removed {
        identity: Identity,
        reason: RemovalReason,
    },
    MessageReceived {
        identity: Identity,
        from: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

/// Result of a pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Code to enter on the phone under "Link with phone number".
    Code(String),
    /// The identity is already linked; no code was issued.
    AlreadyConnected,
}

/// Result of a disconnect.
#[derive(Debug, Clone)]
pub struct DisconnectOutcome {
    /// Final snapshot of the removed record (status `Closed`), if one existed.
    pub record: Option<SessionRecord>,
    /// Whether a graceful logout reached the server.
    pub logged_out: bool,
}

impl DisconnectOutcome {
    pub fn removed(&self) -> bool {
        self.record.is_some()
    }
}

/// A message accepted by the library for delivery.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

struct Entry {
    identity: Identity,
    /// Insertion order into the registry.
    seq: u64,
    created_at: DateTime<Utc>,
    state: Mutex<EntryState>,
    /// Last published record; `None` once removed.
    view: watch::Sender<Option<SessionRecord>>,
    /// Whether the current handle has signalled readiness.
    ready: watch::Sender<bool>,
}

struct EntryState {
    status: SessionStatus,
    handle: Option<Arc<dyn SessionHandle>>,
    /// Bumped on every open; events from older handles are dropped.
    generation: u64,
    connected_at: Option<DateTime<Utc>>,
    pending_pairing_code: Option<String>,
    user: Option<AccountUser>,
    reconnect_attempts: u32,
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    /// Set once the entry has been taken out of the map.
    removed: bool,
}

impl Entry {
    fn new(identity: Identity, seq: u64) -> Self {
        let (ready, _) = watch::channel(false);
        let created_at = Utc::now();
        let (view, _) = watch::channel(Some(SessionRecord {
            identity: identity.clone(),
            status: SessionStatus::Connecting,
            created_at,
            connected_at: None,
            pending_pairing_code: None,
            user: None,
            reconnect_attempts: 0,
        }));
        Self {
            identity,
            seq,
            created_at,
            state: Mutex::new(EntryState {
                status: SessionStatus::Connecting,
                handle: None,
                generation: 0,
                connected_at: None,
                pending_pairing_code: None,
                user: None,
                reconnect_attempts: 0,
                reconnect: None,
                pump: None,
                removed: false,
            }),
            view,
            ready,
        }
    }

    fn snapshot(&self, state: &EntryState) -> SessionRecord {
        SessionRecord {
            identity: self.identity.clone(),
            status: state.status,
            created_at: self.created_at,
            connected_at: state.connected_at,
            pending_pairing_code: state.pending_pairing_code.clone(),
            user: state.user.clone(),
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    /// Make the current state visible to readers. Caller holds the lock.
    fn publish(&self, state: &EntryState) {
        let record = (!state.removed).then(|| self.snapshot(state));
        self.view.send_replace(record);
    }

    fn current(&self) -> Option<SessionRecord> {
        self.view.borrow().clone()
    }
}

struct Inner {
    config: RegistryConfig,
    client: Arc<dyn MessagingClient>,
    store: Arc<dyn CredentialStore>,
    entries: DashMap<Identity, Arc<Entry>>,
    next_seq: AtomicU64,
    event_tx: broadcast::Sender<RegistryEvent>,
}

/// Registry of live sessions keyed by identity.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        client: Arc<dyn MessagingClient>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                store,
                entries: DashMap::new(),
                next_seq: AtomicU64::new(0),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Return the live record for `identity`, opening a new connection if there is none.
    pub async fn get_or_create(&self, identity: &Identity) -> Result<SessionRecord> {
        self.inner.get_or_create(identity).await
    }

    /// Request a pairing code for `identity`, linking the account of `phone_number`.
    pub async fn request_pairing(
        &self,
        identity: &Identity,
        phone_number: &Identity,
    ) -> Result<PairingOutcome> {
        self.inner.request_pairing(identity, phone_number).await
    }

    /// Current record for `identity`. Never waits on an in-flight library call.
    pub fn lookup(&self, identity: &Identity) -> Option<SessionRecord> {
        self.inner.entry(identity)?.current()
    }

    /// Snapshot of all live records in insertion order.
    pub fn list_active(&self) -> Vec<SessionRecord> {
        let mut entries: Vec<Arc<Entry>> = self
            .inner
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        entries.sort_by_key(|e| e.seq);

        entries
            .iter()
            .filter_map(|entry| entry.current())
            .filter(|record| record.status.is_live())
            .collect()
    }

    /// Tear down the session for `identity` and erase its stored credentials.
    ///
    /// Unless `forced`, a graceful logout is attempted first. Calling this for an
    /// unknown identity still erases any credentials left on disk.
    pub async fn disconnect(&self, identity: &Identity, forced: bool) -> Result<DisconnectOutcome> {
        self.inner.disconnect(identity, forced).await
    }

    /// Send a text message from an open session.
    pub async fn send_text(
        &self,
        from: &Identity,
        recipient: &str,
        text: &str,
    ) -> Result<SentMessage> {
        self.inner.send_text(from, recipient, text).await
    }

    /// Reopen every identity that has stored credentials. Returns how many opened.
    pub async fn restore_persisted(&self) -> Result<usize> {
        let identities = self.inner.store.list()?;
        let mut restored = 0;

        for identity in identities {
            match self.inner.get_or_create(&identity).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(target: "wagate::registry", "Failed to restore session {}: {}", identity, e)
                }
            }
        }

        if restored > 0 {
            debug!(target: "wagate::registry", "Reopened {} persisted sessions", restored);
        }
        Ok(restored)
    }

    /// Close every handle without logging out. Stored credentials are kept.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<Entry>> = self
            .inner
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for entry in entries {
            let mut state = entry.state.lock().await;
            if state.removed {
                continue;
            }
            if let Some(task) = state.reconnect.take() {
                task.abort();
            }
            if let Some(task) = state.pump.take() {
                task.abort();
            }
            if let Some(handle) = state.handle.take() {
                handle.close().await;
            }
            state.removed = true;
            state.status = SessionStatus::Closed;
            entry.publish(&state);
            entry.ready.send_replace(false);
            self.inner
                .entries
                .remove_if(&entry.identity, |_, v| Arc::ptr_eq(v, &entry));
        }

        info!(target: "wagate::registry", "Connection registry shut down");
    }

    /// Number of records currently in the registry.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl Inner {
    fn entry(&self, identity: &Identity) -> Option<Arc<Entry>> {
        self.entries.get(identity).map(|e| Arc::clone(e.value()))
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn get_or_create(self: &Arc<Self>, identity: &Identity) -> Result<SessionRecord> {
        loop {
            let entry = match self.entry(identity) {
                Some(entry) => entry,
                None => {
                    if self.entries.len() >= self.config.max_connections {
                        return Err(WagateError::ConnectionLimitExceeded(
                            self.config.max_connections,
                        ));
                    }
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    let candidate = Arc::new(Entry::new(identity.clone(), seq));
                    Arc::clone(self.entries.entry(identity.clone()).or_insert(candidate).value())
                }
            };

            let mut state = entry.state.lock().await;
            if state.removed {
                // Lost a race with a teardown; look again.
                continue;
            }
            if state.handle.is_some() || state.reconnect.is_some() {
                return Ok(entry.snapshot(&state));
            }

            match self.open_handle(&entry, &mut state).await {
                Ok(()) => {
                    info!(target: "wagate::registry", "Opened connection for {}", identity);
                    return Ok(entry.snapshot(&state));
                }
                Err(source) => {
                    error!(target: "wagate::registry", "Failed to open connection for {}: {}", identity, source);
                    state.removed = true;
                    state.status = SessionStatus::Closed;
                    entry.publish(&state);
                    self.entries
                        .remove_if(identity, |_, v| Arc::ptr_eq(v, &entry));
                    self.emit(RegistryEvent::Removed {
                        identity: identity.clone(),
                        reason: RemovalReason::InitFailed,
                    });
                    return Err(WagateError::ConnectionInit {
                        identity: identity.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Open a fresh handle for `entry`. Caller holds the entry lock.
    async fn open_handle(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        state: &mut EntryState,
    ) -> std::result::Result<(), ClientError> {
        let credentials = self
            .store
            .load(&entry.identity)
            .map_err(|e| ClientError::InvalidCredentials(e.to_string()))?;

        debug!(
            target: "wagate::registry",
            "Opening connection for {} ({})",
            entry.identity,
            if credentials.is_some() { "resuming" } else { "new" }
        );

        state.generation += 1;
        let generation = state.generation;
        // A code belongs to the handle that issued it.
        state.pending_pairing_code = None;
        entry.ready.send_replace(false);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.client.open(&entry.identity, credentials, tx).await?;

        state.handle = Some(handle);
        state.status = SessionStatus::Connecting;
        if let Some(old) = state.pump.replace(self.spawn_pump(Arc::clone(entry), generation, rx)) {
            old.abort();
        }
        entry.publish(state);
        Ok(())
    }

    fn spawn_pump(
        self: &Arc<Self>,
        entry: Arc<Entry>,
        generation: u64,
        mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.apply_event(&entry, generation, event).await {
                    break;
                }
            }
            debug!(target: "wagate::registry", "Event pump for {} (generation {}) stopped", entry.identity, generation);
        })
    }

    /// Apply one library event. Returns false once the handle that produced it is finished.
    async fn apply_event(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        generation: u64,
        event: ClientEvent,
    ) -> bool {
        let mut state = entry.state.lock().await;
        if state.removed || state.generation != generation {
            debug!(target: "wagate::registry", "Dropping stale event for {}: {:?}", entry.identity, event);
            return false;
        }

        match event {
            ClientEvent::Ready => {
                debug!(target: "wagate::registry", "Connection for {} is ready", entry.identity);
                entry.ready.send_replace(true);
                true
            }
            ClientEvent::CredentialsUpdated(credentials) => {
                if let Err(e) = self.store.save(&entry.identity, &credentials) {
                    warn!(target: "wagate::registry", "Failed to persist credentials for {}: {}", entry.identity, e);
                }
                true
            }
            ClientEvent::MessageReceived { from, text } => {
                info!(target: "wagate::registry", "Received message for {} from {}", entry.identity, from);
                self.emit(RegistryEvent::MessageReceived {
                    identity: entry.identity.clone(),
                    from,
                    text,
                    timestamp: Utc::now(),
                });
                true
            }
            ClientEvent::Opened { user } => {
                self.apply_signal(entry, &mut state, Signal::Opened, user)
                    .await
            }
            ClientEvent::Closed { reason } => {
                info!(target: "wagate::registry", "Connection for {} closed: {:?}", entry.identity, reason);
                self.apply_signal(entry, &mut state, Signal::Closed(reason), None)
                    .await
            }
        }
    }

    async fn apply_signal(
        self: &Arc<Self>,
        entry: &Arc<Entry>,
        state: &mut EntryState,
        signal: Signal,
        user: Option<AccountUser>,
    ) -> bool {
        let old_status = state.status;

        match transition(old_status, signal, self.config.cleanup_policy) {
            Transition::Open => {
                state.status = SessionStatus::Open;
                state.connected_at = Some(Utc::now());
                state.pending_pairing_code = None;
                state.reconnect_attempts = 0;
                if user.is_some() {
                    state.user = user;
                }
                entry.publish(state);
                entry.ready.send_replace(true);

                info!(target: "wagate::registry", "Session {} connected", entry.identity);
                self.emit(RegistryEvent::StatusChanged {
                    identity: entry.identity.clone(),
                    old_status,
                    new_status: SessionStatus::Open,
                    user: state.user.clone(),
                });
                true
            }
            Transition::Reconnect => {
                if let Some(handle) = state.handle.take() {
                    handle.close().await;
                }
                state.status = SessionStatus::Connecting;
                state.pending_pairing_code = None;
                entry.ready.send_replace(false);

                if old_status != SessionStatus::Connecting {
                    self.emit(RegistryEvent::StatusChanged {
                        identity: entry.identity.clone(),
                        old_status,
                        new_status: SessionStatus::Connecting,
                        user: state.user.clone(),
                    });
                }
                self.schedule_reconnect(entry, state);
                false
            }
            Transition::Destroy(reason) => {
                if let Some(handle) = state.handle.take() {
                    handle.close().await;
                }
                if let Err(e) = self.remove_locked(entry, state, reason, true) {
                    warn!(target: "wagate::registry", "Failed to erase credentials for {}: {}", entry.identity, e);
                }
                false
            }
            Transition::Ignore => {
                debug!(target: "wagate::registry", "Ignoring {:?} for {} in status {}", signal, entry.identity, old_status);
                true
            }
        }
    }

    /// Schedule the next reconnect, or give up once attempts run out. Caller holds the lock.
    fn schedule_reconnect(self: &Arc<Self>, entry: &Arc<Entry>, state: &mut EntryState) {
        if state.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                target: "wagate::registry",
                "Giving up on {} after {} reconnect attempts; credentials kept",
                entry.identity,
                state.reconnect_attempts
            );
            // Credentials stay so a later pairing/status call can resume.
            let _ = self.remove_locked(entry, state, RemovalReason::ReconnectExhausted, false);
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let delay = self.config.reconnect_backoff(attempt);
        entry.publish(state);

        let weak = Arc::downgrade(self);
        let target = Arc::clone(entry);
        if let Some(old) = state.reconnect.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(target).await;
            }
        })) {
            old.abort();
        }

        info!(
            target: "wagate::registry",
            "Reconnecting {} in {:?} (attempt {}/{})",
            entry.identity,
            delay,
            attempt,
            self.config.max_reconnect_attempts
        );
        self.emit(RegistryEvent::ReconnectScheduled {
            identity: entry.identity.clone(),
            attempt,
            delay,
        });
    }

    async fn reconnect(self: &Arc<Self>, entry: Arc<Entry>) {
        let mut state = entry.state.lock().await;
        if state.removed {
            return;
        }
        // This task is the one stored in `reconnect`; dropping the handle does not abort it.
        state.reconnect = None;
        if state.handle.is_some() {
            return;
        }

        match self.open_handle(&entry, &mut state).await {
            Ok(()) => {
                info!(target: "wagate::registry", "Reopened connection for {}", entry.identity);
            }
            Err(e) => {
                warn!(target: "wagate::registry", "Reconnect for {} failed: {}", entry.identity, e);
                self.schedule_reconnect(&entry, &mut state);
            }
        }
    }

    /// Remove `entry` from the map and optionally erase its credentials. Caller holds the lock.
    ///
    /// Credentials are erased before the map entry goes away so a concurrent
    /// `get_or_create` cannot resume from them. An erase failure is returned but
    /// the record is removed regardless.
    fn remove_locked(
        &self,
        entry: &Arc<Entry>,
        state: &mut EntryState,
        reason: RemovalReason,
        erase: bool,
    ) -> std::io::Result<()> {
        let old_status = state.status;
        state.removed = true;
        state.status = SessionStatus::Closed;
        state.handle = None;
        state.pending_pairing_code = None;
        if let Some(task) = state.reconnect.take() {
            task.abort();
        }
        entry.publish(state);
        entry.ready.send_replace(false);

        let erased = if erase {
            self.store.erase(&entry.identity)
        } else {
            Ok(())
        };

        self.entries
            .remove_if(&entry.identity, |_, v| Arc::ptr_eq(v, entry));

        info!(target: "wagate::registry", "Session {} removed ({:?})", entry.identity, reason);
        if old_status.is_live() {
            self.emit(RegistryEvent::StatusChanged {
                identity: entry.identity.clone(),
                old_status,
                new_status: SessionStatus::Closed,
                user: state.user.clone(),
            });
        }
        self.emit(RegistryEvent::Removed {
            identity: entry.identity.clone(),
            reason,
        });

        erased
    }

    async fn request_pairing(
        self: &Arc<Self>,
        identity: &Identity,
        phone_number: &Identity,
    ) -> Result<PairingOutcome> {
        let record = self.get_or_create(identity).await?;
        if record.status == SessionStatus::Open {
            debug!(target: "wagate::registry", "{} already connected, not issuing a pairing code", identity);
            return Ok(PairingOutcome::AlreadyConnected);
        }

        let entry = self
            .entry(identity)
            .ok_or_else(|| WagateError::UnknownIdentity(identity.clone()))?;

        // Wait without holding the entry lock: readiness arrives through the event pump.
        let mut ready = entry.ready.subscribe();
        let timeout = self.config.ready_timeout;
        let became_ready = matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        );
        if !became_ready {
            warn!(target: "wagate::registry", "Connection for {} not ready after {:?}", identity, timeout);
            return Err(WagateError::NotReady {
                identity: identity.clone(),
                timeout,
            });
        }

        let (handle, generation) = {
            let state = entry.state.lock().await;
            if state.removed {
                return Err(WagateError::UnknownIdentity(identity.clone()));
            }
            if state.status == SessionStatus::Open {
                return Ok(PairingOutcome::AlreadyConnected);
            }
            let handle = state.handle.clone().ok_or_else(|| WagateError::NotReady {
                identity: identity.clone(),
                timeout,
            })?;
            (handle, state.generation)
        };

        let code = handle
            .request_pairing_code(phone_number.as_str())
            .await
            .map_err(|source| WagateError::PairingRequest {
                identity: identity.clone(),
                source,
            })?;

        let mut state = entry.state.lock().await;
        if !state.removed
            && state.generation == generation
            && state.status == SessionStatus::Connecting
        {
            state.pending_pairing_code = Some(code.clone());
            entry.publish(&state);
        }
        drop(state);

        info!(target: "wagate::registry", "Issued pairing code for {}", identity);
        self.emit(RegistryEvent::PairingCodeIssued {
            identity: identity.clone(),
            code: code.clone(),
        });

        Ok(PairingOutcome::Code(code))
    }

    async fn disconnect(&self, identity: &Identity, forced: bool) -> Result<DisconnectOutcome> {
        let cleanup = |source: std::io::Error| WagateError::Cleanup {
            identity: identity.clone(),
            source,
        };

        let Some(entry) = self.entry(identity) else {
            debug!(target: "wagate::registry", "Disconnect for unknown {}; erasing stored credentials", identity);
            self.store.erase(identity).map_err(cleanup)?;
            return Ok(DisconnectOutcome {
                record: None,
                logged_out: false,
            });
        };

        let mut state = entry.state.lock().await;
        if state.removed {
            drop(state);
            self.store.erase(identity).map_err(cleanup)?;
            return Ok(DisconnectOutcome {
                record: None,
                logged_out: false,
            });
        }

        let mut logged_out = false;
        if let Some(handle) = state.handle.take() {
            if !forced {
                match handle.logout().await {
                    Ok(()) => logged_out = true,
                    Err(e) => {
                        warn!(target: "wagate::registry", "Graceful logout for {} failed, continuing cleanup: {}", identity, e)
                    }
                }
            }
            handle.close().await;
        }
        if let Some(task) = state.pump.take() {
            task.abort();
        }

        let reason = match transition(state.status, Signal::Disconnect, self.config.cleanup_policy) {
            Transition::Destroy(reason) => reason,
            _ => RemovalReason::Disconnected,
        };
        let erased = self.remove_locked(&entry, &mut state, reason, true);
        let record = entry.snapshot(&state);
        drop(state);

        erased.map_err(cleanup)?;
        info!(target: "wagate::registry", "Session {} disconnected (forced: {})", identity, forced);

        Ok(DisconnectOutcome {
            record: Some(record),
            logged_out,
        })
    }

    async fn send_text(&self, from: &Identity, recipient: &str, text: &str) -> Result<SentMessage> {
        let to = recipient_jid(recipient)?;

        let entry = self
            .entry(from)
            .ok_or_else(|| WagateError::UnknownIdentity(from.clone()))?;
        let handle = {
            let state = entry.state.lock().await;
            if state.removed {
                return Err(WagateError::UnknownIdentity(from.clone()));
            }
            if state.status != SessionStatus::Open {
                return Err(WagateError::NotConnected(from.clone()));
            }
            state
                .handle
                .clone()
                .ok_or_else(|| WagateError::NotConnected(from.clone()))?
        };

        let message_id = handle
            .send_text(&to, text)
            .await
            .map_err(|source| WagateError::SendFailed {
                identity: from.clone(),
                source,
            })?;

        info!(target: "wagate::registry", "Sent message {} from {} to {}", message_id, from, to);
        Ok(SentMessage {
            to,
            message_id,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryCredentialStore, ScriptedClient};
    use crate::Credentials;
    use wagate_types::CloseReason;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn fixture(config: RegistryConfig) -> (ConnectionRegistry, ScriptedClient, MemoryCredentialStore) {
        let client = ScriptedClient::new();
        let store = MemoryCredentialStore::new();
        let registry =
            ConnectionRegistry::new(config, Arc::new(client.clone()), Arc::new(store.clone()));
        (registry, client, store)
    }

    /// Let spawned pumps and timers run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_reconnect_backoff_caps() {
        let config = RegistryConfig {
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(2), Duration::from_secs(2));
        assert_eq!(config.reconnect_backoff(4), Duration::from_secs(8));
        assert_eq!(config.reconnect_backoff(5), Duration::from_secs(10));
        assert_eq!(config.reconnect_backoff(64), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");

        let first = registry.get_or_create(&identity).await.unwrap();
        let second = registry.get_or_create(&identity).await.unwrap();

        assert_eq!(first.status, SessionStatus::Connecting);
        assert_eq!(first.identity, second.identity);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(client.open_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_handle() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");

        let (a, b) = tokio::join!(
            registry.get_or_create(&identity),
            registry.get_or_create(&identity)
        );

        assert_eq!(a.unwrap().created_at, b.unwrap().created_at);
        assert_eq!(client.open_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pairing_requests_share_one_handle() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");
        client.set_pairing_code("K7QW-M2XP");

        let (a, b) = tokio::join!(
            registry.request_pairing(&identity, &identity),
            registry.request_pairing(&identity, &identity)
        );

        let code = PairingOutcome::Code("K7QW-M2XP".to_string());
        assert_eq!(a.unwrap(), code);
        assert_eq!(b.unwrap(), code);
        assert_eq!(client.open_count(), 1);

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identity, identity);
        assert_eq!(active[0].pending_pairing_code.as_deref(), Some("K7QW-M2XP"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readers_do_not_wait_on_slow_open() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let (fast, slow) = (id("628111"), id("628222"));

        registry.get_or_create(&fast).await.unwrap();
        client.open(&fast);
        settle().await;

        client.set_open_delay(&slow, Duration::from_secs(10));
        let opening = {
            let registry = registry.clone();
            let slow = slow.clone();
            tokio::spawn(async move { registry.get_or_create(&slow).await })
        };
        while client.open_count() < 2 {
            tokio::task::yield_now().await;
        }

        // 628222 is still inside `open`.
        let active = registry.list_active();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].status, SessionStatus::Open);
        assert_eq!(
            registry.lookup(&slow).unwrap().status,
            SessionStatus::Connecting
        );
        registry.get_or_create(&id("628333")).await.unwrap();
        assert_eq!(registry.list_active().len(), 3);

        opening.await.unwrap().unwrap();
        assert_eq!(client.open_count(), 3);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_record() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        client.fail_next_opens(1);

        let err = registry.get_or_create(&id("628111")).await.unwrap_err();
        assert!(matches!(err, WagateError::ConnectionInit { .. }));
        assert!(registry.lookup(&id("628111")).is_none());

        // Next attempt succeeds from a clean slate.
        registry.get_or_create(&id("628111")).await.unwrap();
        assert_eq!(client.open_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (registry, _, _) = fixture(RegistryConfig {
            max_connections: 1,
            ..Default::default()
        });

        registry.get_or_create(&id("628111")).await.unwrap();
        let err = registry.get_or_create(&id("628222")).await.unwrap_err();
        assert!(matches!(err, WagateError::ConnectionLimitExceeded(1)));
    }

    #[tokio::test]
    async fn test_open_resumes_stored_credentials() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{\"me\":\"628111\"}".to_vec()));

        registry.get_or_create(&identity).await.unwrap();
        assert_eq!(
            client.opened_with(&identity).unwrap().as_bytes(),
            b"{\"me\":\"628111\"}"
        );
    }

    #[tokio::test]
    async fn test_pairing_lifecycle_scenario() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        client.set_pairing_code("K7QW-M2XP");

        let outcome = registry.request_pairing(&identity, &identity).await.unwrap();
        assert_eq!(outcome, PairingOutcome::Code("K7QW-M2XP".to_string()));

        let record = registry.lookup(&identity).unwrap();
        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.pending_pairing_code.as_deref(), Some("K7QW-M2XP"));

        client.emit(&identity, ClientEvent::CredentialsUpdated(Credentials::new(b"{}".to_vec())));
        client.open(&identity);
        settle().await;

        let record = registry.lookup(&identity).unwrap();
        assert_eq!(record.status, SessionStatus::Open);
        assert!(record.pending_pairing_code.is_none());
        assert!(record.connected_at.is_some());
        assert!(store.exists(&identity));

        let outcome = registry.disconnect(&identity, false).await.unwrap();
        assert!(outcome.logged_out);
        assert_eq!(outcome.record.unwrap().status, SessionStatus::Closed);
        assert!(registry.list_active().is_empty());
        assert!(!store.exists(&identity));
        assert_eq!(client.logout_count(&identity), 1);
    }

    #[tokio::test]
    async fn test_pairing_on_open_identity_short_circuits() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");

        registry.request_pairing(&identity, &identity).await.unwrap();
        client.open(&identity);
        settle().await;

        let outcome = registry.request_pairing(&identity, &identity).await.unwrap();
        assert_eq!(outcome, PairingOutcome::AlreadyConnected);
        assert_eq!(client.pairing_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_times_out_when_not_ready() {
        let (registry, client, _) = fixture(RegistryConfig {
            ready_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        client.set_auto_ready(false);

        let err = registry
            .request_pairing(&id("628111"), &id("628111"))
            .await
            .unwrap_err();
        assert!(matches!(err, WagateError::NotReady { .. }));
        assert_eq!(client.pairing_requests(), 0);
        // The record stays; a later Ready lets pairing proceed.
        assert!(registry.lookup(&id("628111")).is_some());
    }

    #[tokio::test]
    async fn test_pairing_waits_for_late_ready() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        client.set_auto_ready(false);
        let identity = id("628111");

        let pairing = {
            let registry = registry.clone();
            let identity = identity.clone();
            tokio::spawn(async move { registry.request_pairing(&identity, &identity).await })
        };
        while client.open_count() == 0 {
            tokio::task::yield_now().await;
        }
        client.emit(&identity, ClientEvent::Ready);

        let outcome = pairing.await.unwrap().unwrap();
        assert!(matches!(outcome, PairingOutcome::Code(_)));
    }

    #[tokio::test]
    async fn test_pairing_library_error() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        client.fail_pairing(true);

        let err = registry
            .request_pairing(&id("628111"), &id("628111"))
            .await
            .unwrap_err();
        assert!(matches!(err, WagateError::PairingRequest { .. }));
    }

    #[tokio::test]
    async fn test_logout_close_destroys_record_and_credentials() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        registry.get_or_create(&identity).await.unwrap();
        client.open(&identity);
        client.close(&identity, CloseReason::LoggedOut);
        settle().await;

        assert!(registry.lookup(&identity).is_none());
        assert!(!store.exists(&identity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_close_schedules_one_reconnect() {
        let (registry, client, store) = fixture(RegistryConfig {
            reconnect_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let identity = id("628111");
        let mut events = registry.subscribe();

        registry.get_or_create(&identity).await.unwrap();
        client.open(&identity);
        settle().await;
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        client.close(&identity, CloseReason::ConnectionLost);
        settle().await;

        let record = registry.lookup(&identity).unwrap();
        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.reconnect_attempts, 1);
        assert!(store.exists(&identity));
        assert_eq!(client.open_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(client.open_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(client.open_count(), 2);

        let mut scheduled = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RegistryEvent::ReconnectScheduled { .. }) {
                scheduled += 1;
            }
        }
        assert_eq!(scheduled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_code_from_closed_handle() {
        let (registry, client, _) = fixture(RegistryConfig {
            reconnect_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let identity = id("628111");

        registry.request_pairing(&identity, &identity).await.unwrap();
        assert!(registry.lookup(&identity).unwrap().pending_pairing_code.is_some());

        client.close(&identity, CloseReason::TimedOut);
        settle().await;
        assert!(registry.lookup(&identity).unwrap().pending_pairing_code.is_none());

        tokio::time::sleep(Duration::from_secs(4)).await;
        settle().await;
        let record = registry.lookup(&identity).unwrap();
        assert_eq!(client.open_count(), 2);
        assert_eq!(record.status, SessionStatus::Connecting);
        assert!(record.pending_pairing_code.is_none());

        // A new request pairs against the reopened handle.
        let outcome = registry.request_pairing(&identity, &identity).await.unwrap();
        assert!(matches!(outcome, PairingOutcome::Code(_)));
        assert_eq!(client.pairing_requests(), 2);
        assert!(registry.lookup(&identity).unwrap().pending_pairing_code.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_but_keeps_credentials() {
        let (registry, client, store) = fixture(RegistryConfig {
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(1),
            max_reconnect_attempts: 2,
            ..Default::default()
        });
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        registry.get_or_create(&identity).await.unwrap();
        client.fail_next_opens(5);
        client.close(&identity, CloseReason::TimedOut);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            settle().await;
        }

        assert!(registry.lookup(&identity).is_none());
        assert!(store.exists(&identity));
        // Initial open plus two failed reconnects.
        assert_eq!(client.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");

        registry.get_or_create(&identity).await.unwrap();
        client.open(&identity);
        client.close(&identity, CloseReason::ConnectionLost);
        settle().await;
        assert_eq!(registry.lookup(&identity).unwrap().reconnect_attempts, 1);

        registry.disconnect(&identity, true).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(client.open_count(), 1);
        assert!(registry.lookup(&identity).is_none());
        assert!(!store.exists(&identity));
    }

    #[tokio::test]
    async fn test_any_close_policy_erases_on_transient_close() {
        let (registry, client, store) = fixture(RegistryConfig {
            cleanup_policy: CleanupPolicy::AnyClose,
            ..Default::default()
        });
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        registry.get_or_create(&identity).await.unwrap();
        client.close(&identity, CloseReason::ConnectionLost);
        settle().await;

        assert!(registry.lookup(&identity).is_none());
        assert!(!store.exists(&identity));
        assert_eq!(client.open_count(), 1);
    }

    #[tokio::test]
    async fn test_forced_disconnect_skips_logout() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");

        registry.get_or_create(&identity).await.unwrap();
        let outcome = registry.disconnect(&identity, true).await.unwrap();

        assert!(outcome.removed());
        assert!(!outcome.logged_out);
        assert_eq!(client.logout_count(&identity), 0);
        assert!(client.is_closed(&identity));
    }

    #[tokio::test]
    async fn test_disconnect_survives_logout_failure() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));
        client.fail_logout(true);

        registry.get_or_create(&identity).await.unwrap();
        let outcome = registry.disconnect(&identity, false).await.unwrap();

        assert!(outcome.removed());
        assert!(!outcome.logged_out);
        assert!(registry.lookup(&identity).is_none());
        assert!(!store.exists(&identity));
    }

    #[tokio::test]
    async fn test_disconnect_absent_identity_erases_leftovers() {
        let (registry, _, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        let outcome = registry.disconnect(&identity, true).await.unwrap();
        assert!(!outcome.removed());
        assert!(!store.exists(&identity));

        // Idempotent.
        registry.disconnect(&identity, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_error_still_removes_record() {
        let (registry, _, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));
        store.fail_erase(true);

        registry.get_or_create(&identity).await.unwrap();
        let err = registry.disconnect(&identity, true).await.unwrap_err();

        assert!(matches!(err, WagateError::Cleanup { .. }));
        assert!(registry.lookup(&identity).is_none());
    }

    #[tokio::test]
    async fn test_list_active_keeps_insertion_order() {
        let (registry, _, _) = fixture(RegistryConfig::default());
        for n in ["628333", "628111", "628222"] {
            registry.get_or_create(&id(n)).await.unwrap();
        }
        registry.disconnect(&id("628111"), true).await.unwrap();
        registry.get_or_create(&id("628111")).await.unwrap();

        let order: Vec<String> = registry
            .list_active()
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(order, vec!["628333", "628222", "628111"]);
    }

    #[tokio::test]
    async fn test_send_text_requires_open_session() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");

        let err = registry.send_text(&identity, "628222", "hi").await.unwrap_err();
        assert!(matches!(err, WagateError::UnknownIdentity(_)));

        registry.get_or_create(&identity).await.unwrap();
        let err = registry.send_text(&identity, "628222", "hi").await.unwrap_err();
        assert!(matches!(err, WagateError::NotConnected(_)));

        client.open(&identity);
        settle().await;
        let sent = registry.send_text(&identity, "+62 822-2", "hi").await.unwrap();
        assert_eq!(sent.to, "628222@s.whatsapp.net");
        assert_eq!(
            client.sent_messages(&identity),
            vec![("628222@s.whatsapp.net".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stale_events_from_old_handle_are_ignored() {
        let (registry, client, _) = fixture(RegistryConfig {
            reconnect_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let identity = id("628111");

        registry.get_or_create(&identity).await.unwrap();
        let old_sender = client.sender(&identity).unwrap();
        client.close(&identity, CloseReason::Restarting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(client.open_count(), 2);

        // The first handle's channel no longer drives the record.
        let _ = old_sender.send(ClientEvent::Opened { user: None });
        settle().await;
        assert_eq!(
            registry.lookup(&identity).unwrap().status,
            SessionStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_restore_persisted_reopens_stored_sessions() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        store.insert(&id("628111"), Credentials::new(b"{}".to_vec()));
        store.insert(&id("628222"), Credentials::new(b"{}".to_vec()));

        let restored = registry.restore_persisted().await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(client.open_count(), 2);
        assert_eq!(registry.list_active().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_credentials() {
        let (registry, client, store) = fixture(RegistryConfig::default());
        let identity = id("628111");
        store.insert(&identity, Credentials::new(b"{}".to_vec()));

        registry.get_or_create(&identity).await.unwrap();
        registry.shutdown().await;

        assert!(registry.is_empty());
        assert!(store.exists(&identity));
        assert!(client.is_closed(&identity));
        assert_eq!(client.logout_count(&identity), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create(usize),
        Open(usize),
        Close(usize, CloseReason),
        Disconnect(usize, bool),
    }

    fn any_op() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;
        let reason = prop_oneof![
            Just(CloseReason::LoggedOut),
            Just(CloseReason::ConnectionLost),
            Just(CloseReason::Replaced),
        ];
        prop_oneof![
            (0..3usize).prop_map(Op::Create),
            (0..3usize).prop_map(Op::Open),
            ((0..3usize), reason).prop_map(|(i, r)| Op::Close(i, r)),
            ((0..3usize), any::<bool>()).prop_map(|(i, f)| Op::Disconnect(i, f)),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_registry_invariants(ops in proptest::collection::vec(any_op(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (registry, client, store) = fixture(RegistryConfig::default());
                let ids = [id("628111"), id("628222"), id("628333")];

                for op in ops {
                    match op {
                        Op::Create(i) => {
                            registry.get_or_create(&ids[i]).await.unwrap();
                        }
                        Op::Open(i) => client.open(&ids[i]),
                        Op::Close(i, reason) => client.close(&ids[i], reason),
                        Op::Disconnect(i, forced) => {
                            registry.disconnect(&ids[i], forced).await.unwrap();
                            settle().await;
                            assert!(registry.lookup(&ids[i]).is_none());
                            assert!(!store.exists(&ids[i]));
                        }
                    }
                    settle().await;

                    let active = registry.list_active();
                    let mut seen: Vec<&Identity> = active.iter().map(|r| &r.identity).collect();
                    seen.sort();
                    seen.dedup();
                    assert_eq!(seen.len(), active.len());
                    for record in &active {
                        if record.status == SessionStatus::Open {
                            assert!(record.pending_pairing_code.is_none());
                            assert!(record.connected_at.is_some());
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_message_events_are_broadcast() {
        let (registry, client, _) = fixture(RegistryConfig::default());
        let identity = id("628111");
        let mut events = registry.subscribe();

        registry.get_or_create(&identity).await.unwrap();
        client.emit(
            &identity,
            ClientEvent::MessageReceived {
                from: "628999@s.whatsapp.net".to_string(),
                text: "halo".to_string(),
            },
        );
        settle().await;

        let mut seen = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::MessageReceived { from, text, .. } = event {
                assert_eq!(from, "628999@s.whatsapp.net");
                assert_eq!(text, "halo");
                seen = true;
            }
        }
        assert!(seen);
    }
}

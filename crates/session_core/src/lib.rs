use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use authcrypt::{Credentials, KeyTypeCollection, SessionAuthStore, StoredAuth};
use protocol_link::{
    ConnectOptions, HistorySink, ProtocolConnection, ProtocolConnector, ProtocolEvent, SessionAuth,
};
use shared::{
    domain::{CloseCause, ConnectionState, SessionKey},
    protocol::{BridgeEvent, HistorySyncBatch, InboundMessage},
};

pub mod bridge;
pub mod coalescer;
pub mod state;

pub use bridge::EventBridge;
pub use coalescer::{FlushCoalescer, FlushTarget};
pub use state::SessionStateCache;

use state::StateFlusher;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts (no backoff).
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub flush_debounce: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 4,
            reconnect_delay: Duration::from_millis(4000),
            connect_timeout: Duration::from_secs(30),
            flush_debounce: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {session} has no ready connection")]
    NotReady { session: SessionKey },
    #[error("message delivery failed for session {session}")]
    Delivery {
        session: SessionKey,
        #[source]
        source: anyhow::Error,
    },
}

/// Registry entry for one live (or reconnecting) session.
struct ConnectionSession {
    state: ConnectionState,
    ready: bool,
    reconnect_attempts: u32,
    auth: Option<Arc<SessionStateCache>>,
    connection: Option<Arc<dyn ProtocolConnection>>,
    event_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            ready: false,
            reconnect_attempts: 0,
            auth: None,
            connection: None,
            event_task: None,
            reconnect_timer: None,
        }
    }
}

/// Owns the lifecycle of one external protocol connection per session key:
/// credential load/synthesis, connect with a bounded timeout, reconnect
/// with a fixed delay up to an attempt budget, and terminal teardown.
///
/// At most one `ConnectionSession` exists per key; concurrent `start`
/// calls on a running key are no-ops. Different keys proceed fully in
/// parallel.
pub struct SessionManager {
    store: Arc<dyn SessionAuthStore>,
    history: Arc<dyn HistorySink>,
    connector: Arc<dyn ProtocolConnector>,
    bridge: Arc<EventBridge>,
    coalescer: Arc<FlushCoalescer>,
    flusher: Arc<StateFlusher>,
    sessions: Mutex<HashMap<SessionKey, ConnectionSession>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionAuthStore>,
        history: Arc<dyn HistorySink>,
        connector: Arc<dyn ProtocolConnector>,
        config: SessionManagerConfig,
    ) -> Arc<Self> {
        let flusher = StateFlusher::new(Arc::clone(&store));
        let target: Arc<dyn FlushTarget> = flusher.clone();
        let coalescer = FlushCoalescer::new(target, config.flush_debounce);
        Arc::new(Self {
            store,
            history,
            connector,
            bridge: Arc::new(EventBridge::new()),
            coalescer,
            flusher,
            sessions: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn bridge(&self) -> Arc<EventBridge> {
        Arc::clone(&self.bridge)
    }

    /// Starts a session: loads or synthesizes credentials, opens the
    /// protocol connection, and registers event handling. Idempotent while
    /// the session is running.
    pub async fn start(self: &Arc<Self>, key: SessionKey) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&key) {
                debug!(session = %key, "start ignored; session already running");
                return Ok(());
            }
            sessions.insert(key, ConnectionSession::new());
        }

        let (stored, record_missing) = match self.store.load_auth(&key).await {
            Ok(Some(stored)) => (stored, false),
            Ok(None) => {
                info!(session = %key, "no stored credentials; synthesizing fresh identity");
                (
                    StoredAuth {
                        credentials: Credentials::generate(),
                        keys: KeyTypeCollection::default(),
                    },
                    true,
                )
            }
            Err(error) => {
                // Read failure is not "no record": run on a fresh in-memory
                // identity but do not eagerly overwrite whatever is stored.
                warn!(session = %key, %error, "credential load failed; starting with fresh in-memory identity");
                (
                    StoredAuth {
                        credentials: Credentials::generate(),
                        keys: KeyTypeCollection::default(),
                    },
                    false,
                )
            }
        };

        let auth = SessionStateCache::new(
            key,
            stored.credentials,
            stored.keys,
            Arc::clone(&self.coalescer),
        );
        self.flusher.register(key, Arc::clone(&auth)).await;
        if record_missing {
            // A new session must be durable before any key exchange happens.
            self.coalescer.force_flush(key).await;
        }

        {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key) {
                Some(entry) => entry.auth = Some(Arc::clone(&auth)),
                None => {
                    // Stopped while loading; leave no stray registrations.
                    self.flusher.unregister(key).await;
                    return Ok(());
                }
            }
        }

        self.open_connection(key, auth).await;
        Ok(())
    }

    /// Stops a session: cancels any pending reconnect, removes the registry
    /// entry (guaranteed), then attempts a graceful logout. A successful
    /// logout is terminal and deletes the credential record; a failed one
    /// leaves the session resumable via a later `start`.
    pub async fn stop(&self, key: SessionKey) -> Result<()> {
        let Some(mut session) = self.sessions.lock().await.remove(&key) else {
            debug!(session = %key, "stop ignored; session not running");
            return Ok(());
        };
        if let Some(timer) = session.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(task) = session.event_task.take() {
            task.abort();
        }
        self.coalescer.cancel(key).await;

        let mut logged_out = false;
        if let Some(connection) = session.connection.take() {
            match connection.logout().await {
                Ok(()) => logged_out = true,
                Err(error) => {
                    warn!(session = %key, %error, "graceful logout failed; keeping credentials")
                }
            }
            let _ = connection.close().await;
        }

        if logged_out {
            if let Err(error) = self.store.delete_auth(&key).await {
                error!(session = %key, %error, "failed to delete credentials after logout");
            }
            info!(session = %key, "session stopped; logged out and credentials deleted");
            self.publish(
                key,
                BridgeEvent::Status {
                    session: key,
                    state: ConnectionState::LoggedOut,
                },
            )
            .await;
        } else {
            self.coalescer.force_flush(key).await;
            info!(session = %key, "session stopped; credentials retained");
            self.publish(
                key,
                BridgeEvent::Status {
                    session: key,
                    state: ConnectionState::Disconnected,
                },
            )
            .await;
        }
        self.flusher.unregister(key).await;
        Ok(())
    }

    /// Sends a text message through the session's live connection.
    /// Delivery errors are propagated without retry; retrying is the
    /// caller's policy decision.
    pub async fn send(
        &self,
        key: SessionKey,
        to: &str,
        text: &str,
    ) -> Result<String, SessionError> {
        let connection = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&key)
                .filter(|entry| entry.ready)
                .and_then(|entry| entry.connection.clone())
        }
        .ok_or(SessionError::NotReady { session: key })?;

        connection
            .send_text(to, text)
            .await
            .map_err(|source| SessionError::Delivery {
                session: key,
                source,
            })
    }

    pub async fn is_ready(&self, key: SessionKey) -> bool {
        self.sessions
            .lock()
            .await
            .get(&key)
            .map(|entry| entry.ready)
            .unwrap_or(false)
    }

    pub async fn session_status(&self, key: SessionKey) -> Option<(ConnectionState, bool)> {
        self.sessions
            .lock()
            .await
            .get(&key)
            .map(|entry| (entry.state, entry.ready))
    }

    /// Drains the registry by stopping every session. Called at process
    /// shutdown.
    pub async fn shutdown_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.lock().await.keys().copied().collect();
        for key in keys {
            if let Err(error) = self.stop(key).await {
                warn!(session = %key, %error, "failed to stop session during shutdown");
            }
        }
    }

    async fn open_connection(self: &Arc<Self>, key: SessionKey, auth: Arc<SessionStateCache>) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&key) else {
                return;
            };
            entry.state = ConnectionState::Connecting;
            entry.ready = false;
        }

        let auth_handle: Arc<dyn SessionAuth> = auth;
        let options = ConnectOptions {
            session_key: key,
            auth: auth_handle,
        };
        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(options))
                .await;

        let connection = match connected {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => {
                warn!(session = %key, %error, "protocol connect failed");
                self.publish(
                    key,
                    BridgeEvent::Error {
                        session: key,
                        error: error.to_string(),
                    },
                )
                .await;
                self.handle_close(key, CloseCause::ConnectionLost).await;
                return;
            }
            Err(_elapsed) => {
                warn!(
                    session = %key,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "protocol connect timed out"
                );
                self.handle_close(key, CloseCause::TimedOut).await;
                return;
            }
        };

        let events = connection.subscribe_events();
        let stopped_meanwhile = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key) {
                Some(entry) => {
                    entry.connection = Some(Arc::clone(&connection));
                    entry.event_task = Some(self.spawn_event_pump(key, events));
                    false
                }
                None => true,
            }
        };
        if stopped_meanwhile {
            let _ = connection.close().await;
        }
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        key: SessionKey,
        mut events: tokio::sync::broadcast::Receiver<ProtocolEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !manager.handle_protocol_event(key, event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = %key, skipped, "protocol event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Returns `false` once this connection's event stream is finished.
    async fn handle_protocol_event(
        self: &Arc<Self>,
        key: SessionKey,
        event: ProtocolEvent,
    ) -> bool {
        match event {
            ProtocolEvent::QrCode { code } => {
                {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(entry) = sessions.get_mut(&key) {
                        entry.state = ConnectionState::QrPending;
                    }
                }
                info!(session = %key, "pairing qr issued");
                self.publish(
                    key,
                    BridgeEvent::Qr {
                        session: key,
                        qr: code,
                    },
                )
                .await;
                true
            }
            ProtocolEvent::Opened => {
                let known = {
                    let mut sessions = self.sessions.lock().await;
                    match sessions.get_mut(&key) {
                        Some(entry) => {
                            entry.ready = true;
                            entry.reconnect_attempts = 0;
                            entry.state = ConnectionState::Connected;
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    info!(session = %key, "connection open");
                    self.publish(key, BridgeEvent::Ready { session: key }).await;
                    self.publish(
                        key,
                        BridgeEvent::Status {
                            session: key,
                            state: ConnectionState::Connected,
                        },
                    )
                    .await;
                }
                true
            }
            ProtocolEvent::Closed { cause } => {
                self.handle_close(key, cause).await;
                false
            }
            ProtocolEvent::MessagesReceived { messages } => {
                self.handle_inbound_messages(key, messages).await;
                true
            }
            ProtocolEvent::HistorySync { batch } => {
                self.handle_history_sync(key, batch).await;
                true
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, key: SessionKey, cause: CloseCause) {
        if cause.is_logged_out() {
            let Some(mut session) = self.sessions.lock().await.remove(&key) else {
                return;
            };
            if let Some(timer) = session.reconnect_timer.take() {
                timer.abort();
            }
            self.coalescer.cancel(key).await;
            self.flusher.unregister(key).await;
            if let Err(error) = self.store.delete_auth(&key).await {
                error!(session = %key, %error, "failed to delete credentials after logout");
            }
            info!(session = %key, "logged out; credentials deleted");
            self.publish(
                key,
                BridgeEvent::Status {
                    session: key,
                    state: ConnectionState::LoggedOut,
                },
            )
            .await;
            if let Some(connection) = session.connection.take() {
                let _ = connection.close().await;
            }
            return;
        }

        enum Next {
            Retry {
                attempt: u32,
                stale: Option<Arc<dyn ProtocolConnection>>,
            },
            Park {
                stale: Option<Arc<dyn ProtocolConnection>>,
            },
            Gone,
        }

        let next = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key) {
                None => Next::Gone,
                Some(entry) => {
                    entry.ready = false;
                    let stale = entry.connection.take();
                    if entry.reconnect_attempts < self.config.max_reconnect_attempts {
                        entry.reconnect_attempts += 1;
                        entry.state = ConnectionState::Reconnecting;
                        Next::Retry {
                            attempt: entry.reconnect_attempts,
                            stale,
                        }
                    } else {
                        Next::Park { stale }
                    }
                }
            }
        };

        match next {
            Next::Gone => {}
            Next::Retry { attempt, stale } => {
                if let Some(stale) = stale {
                    let _ = stale.close().await;
                }
                warn!(
                    session = %key,
                    %cause,
                    attempt,
                    max_attempts = self.config.max_reconnect_attempts,
                    delay_ms = self.config.reconnect_delay.as_millis() as u64,
                    "connection closed; reconnect scheduled"
                );
                self.publish(
                    key,
                    BridgeEvent::Status {
                        session: key,
                        state: ConnectionState::Reconnecting,
                    },
                )
                .await;

                let timer = tokio::spawn(reconnect_after(
                    Arc::clone(self),
                    key,
                    self.config.reconnect_delay,
                ));
                let mut sessions = self.sessions.lock().await;
                match sessions.get_mut(&key) {
                    Some(entry) => {
                        if let Some(old) = entry.reconnect_timer.replace(timer) {
                            old.abort();
                        }
                    }
                    None => timer.abort(),
                }
            }
            Next::Park { stale } => {
                if let Some(stale) = stale {
                    let _ = stale.close().await;
                }
                warn!(
                    session = %key,
                    %cause,
                    "reconnect attempts exhausted; session parked until restarted"
                );
                // Credentials survive; a manual start resumes the session.
                self.coalescer.force_flush(key).await;
                self.sessions.lock().await.remove(&key);
                self.flusher.unregister(key).await;
                self.publish(
                    key,
                    BridgeEvent::Status {
                        session: key,
                        state: ConnectionState::Disconnected,
                    },
                )
                .await;
            }
        }
    }

    async fn reconnect_now(self: &Arc<Self>, key: SessionKey) {
        let auth = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&key) {
                None => {
                    debug!(session = %key, "reconnect timer fired for stopped session");
                    return;
                }
                Some(entry) => {
                    entry.reconnect_timer = None;
                    match &entry.auth {
                        Some(auth) => Arc::clone(auth),
                        None => return,
                    }
                }
            }
        };
        self.open_connection(key, auth).await;
    }

    async fn handle_inbound_messages(&self, key: SessionKey, messages: Vec<InboundMessage>) {
        for message in messages {
            // Self-authored echoes are already known to the sender side.
            if message.from_me {
                continue;
            }
            let Some(text) = message.text else {
                debug!(session = %key, message_id = %message.message_id, "skipping non-text message");
                continue;
            };
            if text.is_empty() {
                continue;
            }
            self.publish(
                key,
                BridgeEvent::Message {
                    session: key,
                    from: message.sender,
                    text,
                    ts: message.sent_at,
                    message_id: message.message_id,
                },
            )
            .await;
        }
    }

    /// Best-effort backfill: one bad item never aborts the batch.
    async fn handle_history_sync(&self, key: SessionKey, batch: HistorySyncBatch) {
        let mut contacts_count = 0u64;
        for contact in &batch.contacts {
            match self.history.upsert_contact(&key, contact).await {
                Ok(()) => contacts_count += 1,
                Err(error) => {
                    warn!(session = %key, contact = %contact.contact_id, %error, "history contact upsert failed")
                }
            }
        }

        let mut chats_count = 0u64;
        for chat in &batch.chats {
            match self.history.upsert_chat(&key, chat).await {
                Ok(()) => chats_count += 1,
                Err(error) => {
                    warn!(session = %key, chat = %chat.chat_id, %error, "history chat upsert failed")
                }
            }
        }

        let mut messages_count = 0u64;
        for message in &batch.messages {
            match self.history.upsert_message(&key, message).await {
                Ok(()) => messages_count += 1,
                Err(error) => {
                    warn!(session = %key, message_id = %message.message_id, %error, "history message upsert failed")
                }
            }
        }

        info!(
            session = %key,
            chats_count,
            contacts_count,
            messages_count,
            "history sync complete"
        );
        self.publish(
            key,
            BridgeEvent::HistorySynced {
                session: key,
                chats_count,
                contacts_count,
                messages_count,
            },
        )
        .await;
    }

    async fn publish(&self, key: SessionKey, event: BridgeEvent) {
        self.bridge.publish(key.tenant_id, event).await;
    }
}

/// Boxed so the reconnect cycle (close → timer → connect → close) does not
/// recurse at the type level.
fn reconnect_after(
    manager: Arc<SessionManager>,
    key: SessionKey,
    delay: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        manager.reconnect_now(key).await;
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use authcrypt::{Credentials, KeyMutations};
use shared::{
    domain::{CloseCause, KeyKind, SessionKey},
    protocol::{ChatUpsert, ContactUpsert, HistorySyncBatch, InboundMessage},
};

/// Events a live protocol connection reports, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    QrCode { code: String },
    Opened,
    Closed { cause: CloseCause },
    MessagesReceived { messages: Vec<InboundMessage> },
    HistorySync { batch: HistorySyncBatch },
}

/// Read/write access to one session's credential and key material,
/// handed to the protocol layer for its signing and verification needs.
#[async_trait]
pub trait SessionAuth: Send + Sync {
    async fn credentials(&self) -> Credentials;
    async fn update_credentials(&self, credentials: Credentials) -> Result<()>;
    async fn get_keys(&self, kind: KeyKind, ids: &[String]) -> Result<HashMap<String, Vec<u8>>>;
    async fn set_keys(&self, mutations: KeyMutations) -> Result<bool>;
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub session_key: SessionKey,
    pub auth: Arc<dyn SessionAuth>,
}

#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    fn subscribe_events(&self) -> broadcast::Receiver<ProtocolEvent>;
    /// Sends a text message; returns the protocol-assigned message id.
    async fn send_text(&self, to: &str, body: &str) -> Result<String>;
    async fn logout(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn ProtocolConnection>>;
}

/// Default wiring when no transport crate is linked in.
pub struct UnboundConnector;

#[async_trait]
impl ProtocolConnector for UnboundConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn ProtocolConnection>> {
        Err(anyhow!(
            "chat protocol transport is not configured for session {}",
            options.session_key
        ))
    }
}

/// Best-effort persistence for history-sync backfill batches.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn upsert_contact(&self, key: &SessionKey, contact: &ContactUpsert) -> Result<()>;
    async fn upsert_chat(&self, key: &SessionKey, chat: &ChatUpsert) -> Result<()>;
    async fn upsert_message(&self, key: &SessionKey, message: &InboundMessage) -> Result<()>;
}

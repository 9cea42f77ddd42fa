use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConnectionState, SessionKey};

/// One message delivered by the external protocol, live or via history sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub from_me: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpsert {
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUpsert {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Bulk backfill delivered once by the protocol shortly after first login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySyncBatch {
    pub contacts: Vec<ContactUpsert>,
    pub chats: Vec<ChatUpsert>,
    pub messages: Vec<InboundMessage>,
}

/// Live events fanned out per tenant by the event bridge.
///
/// Delivery is at-most-once and best-effort; durable state is persisted
/// independently, so a subscriber that misses events loses nothing it
/// cannot re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        session: SessionKey,
        qr: String,
    },
    Ready {
        session: SessionKey,
    },
    Status {
        session: SessionKey,
        state: ConnectionState,
    },
    Message {
        session: SessionKey,
        from: String,
        text: String,
        ts: DateTime<Utc>,
        message_id: String,
    },
    HistorySynced {
        session: SessionKey,
        chats_count: u64,
        contacts_count: u64,
        messages_count: u64,
    },
    Error {
        session: SessionKey,
        error: String,
    },
}

//! End-to-end acceptance: the session manager against the real SQLite
//! store. A session started with no durable record synthesizes fresh
//! credentials and is flushed before any key exchange; a logout close
//! removes the record.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::{broadcast, Mutex};

use authcrypt::{FieldCipher, MasterKey};
use protocol_link::{ConnectOptions, ProtocolConnection, ProtocolConnector, ProtocolEvent};
use session_core::{SessionManager, SessionManagerConfig};
use shared::domain::{ChannelId, CloseCause, SessionKey, TenantId};
use storage::Storage;

struct LinkedConnection {
    events: broadcast::Sender<ProtocolEvent>,
}

#[async_trait]
impl ProtocolConnection for LinkedConnection {
    fn subscribe_events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    async fn send_text(&self, _to: &str, _body: &str) -> anyhow::Result<String> {
        Ok("id".to_string())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LinkedConnector {
    connections: Mutex<Vec<Arc<LinkedConnection>>>,
}

impl LinkedConnector {
    async fn latest(&self) -> Arc<LinkedConnection> {
        self.connections
            .lock()
            .await
            .last()
            .cloned()
            .expect("no connection")
    }
}

#[async_trait]
impl ProtocolConnector for LinkedConnector {
    async fn connect(&self, _options: ConnectOptions) -> anyhow::Result<Arc<dyn ProtocolConnection>> {
        let (events, _) = broadcast::channel(16);
        let connection = Arc::new(LinkedConnection { events });
        self.connections.lock().await.push(connection.clone());
        Ok(connection)
    }
}

async fn storage() -> Storage {
    let encoded = format!("base64:{}", STANDARD.encode([0x77; 32]));
    let master_key = MasterKey::from_encoded(&encoded).expect("master key");
    Storage::new("sqlite::memory:", FieldCipher::new(&master_key))
        .await
        .expect("storage")
}

#[tokio::test]
async fn fresh_session_is_durable_before_any_key_exchange() {
    let storage = storage().await;
    let connector = Arc::new(LinkedConnector::default());
    let manager = SessionManager::new(
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        connector,
        SessionManagerConfig::default(),
    );
    let key = SessionKey::new(TenantId(1), ChannelId(1));

    assert!(storage.load_credential_row(&key).await.expect("row").is_none());

    manager.start(key).await.expect("start");

    let row = storage
        .load_credential_row(&key)
        .await
        .expect("row")
        .expect("record created by forced flush");
    assert!(!row.creds_cipher.is_empty());
}

#[tokio::test]
async fn logout_close_removes_the_durable_record() {
    let storage = storage().await;
    let connector = Arc::new(LinkedConnector::default());
    let manager = SessionManager::new(
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        connector.clone(),
        SessionManagerConfig::default(),
    );
    let key = SessionKey::new(TenantId(2), ChannelId(1));

    manager.start(key).await.expect("start");
    assert!(storage.load_credential_row(&key).await.expect("row").is_some());

    let _ = connector
        .latest()
        .await
        .events
        .send(ProtocolEvent::Closed {
            cause: CloseCause::LoggedOut,
        });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert!(storage.load_credential_row(&key).await.expect("row").is_none());
    assert!(!manager.is_ready(key).await);
}

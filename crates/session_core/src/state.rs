use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use authcrypt::{Credentials, KeyMutations, KeyTypeCollection, SessionAuthStore};
use protocol_link::SessionAuth;
use shared::domain::{KeyKind, SessionKey};

use crate::coalescer::{FlushCoalescer, FlushTarget};

/// In-memory auth state for one session: the credential block plus the
/// typed key collections the protocol layer reads and writes.
///
/// Loaded once at session start and owned exclusively by that session's
/// registry entry; reads never touch the durable store. Mutations mark the
/// session for a coalesced flush.
pub struct SessionStateCache {
    session_key: SessionKey,
    coalescer: Arc<FlushCoalescer>,
    credentials: Mutex<Credentials>,
    keys: Mutex<KeyTypeCollection>,
}

impl SessionStateCache {
    pub fn new(
        session_key: SessionKey,
        credentials: Credentials,
        keys: KeyTypeCollection,
        coalescer: Arc<FlushCoalescer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_key,
            coalescer,
            credentials: Mutex::new(credentials),
            keys: Mutex::new(keys),
        })
    }

    /// Consistent copy of both blocks for persistence.
    pub async fn snapshot(&self) -> (Credentials, KeyTypeCollection) {
        let credentials = self.credentials.lock().await;
        let keys = self.keys.lock().await;
        (credentials.clone(), keys.clone())
    }
}

#[async_trait]
impl SessionAuth for SessionStateCache {
    async fn credentials(&self) -> Credentials {
        self.credentials.lock().await.clone()
    }

    async fn update_credentials(&self, credentials: Credentials) -> Result<()> {
        {
            let mut current = self.credentials.lock().await;
            if *current == credentials {
                return Ok(());
            }
            *current = credentials;
        }
        self.coalescer.schedule(self.session_key).await;
        Ok(())
    }

    async fn get_keys(&self, kind: KeyKind, ids: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.keys.lock().await.get(kind, ids))
    }

    async fn set_keys(&self, mutations: KeyMutations) -> Result<bool> {
        let changed = { self.keys.lock().await.apply(mutations) };
        if changed {
            self.coalescer.schedule(self.session_key).await;
        }
        Ok(changed)
    }
}

/// Flush target backed by the registry of live session caches: reads the
/// current in-memory state for a key and writes it through the store.
pub(crate) struct StateFlusher {
    store: Arc<dyn SessionAuthStore>,
    states: Mutex<HashMap<SessionKey, Arc<SessionStateCache>>>,
}

impl StateFlusher {
    pub(crate) fn new(store: Arc<dyn SessionAuthStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) async fn register(&self, key: SessionKey, state: Arc<SessionStateCache>) {
        self.states.lock().await.insert(key, state);
    }

    pub(crate) async fn unregister(&self, key: SessionKey) {
        self.states.lock().await.remove(&key);
    }
}

#[async_trait]
impl FlushTarget for StateFlusher {
    async fn flush(&self, key: SessionKey) -> Result<()> {
        let state = { self.states.lock().await.get(&key).cloned() };
        let Some(state) = state else {
            // Session torn down between trigger and flush.
            debug!(session = %key, "skipping flush for removed session");
            return Ok(());
        };
        let (credentials, keys) = state.snapshot().await;
        self.store.save_auth(&key, &credentials, &keys).await
    }
}

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::SessionKey;

pub mod cipher;
pub mod creds;

pub use cipher::{CipherError, FieldCipher, MasterKey};
pub use creds::{Credentials, KeyMutations, KeyTypeCollection};

/// Decrypted, structurally valid auth state for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAuth {
    pub credentials: Credentials,
    pub keys: KeyTypeCollection,
}

/// Durable persistence seam for per-session auth state.
///
/// Implementations own encryption-at-rest and the degrade-not-crash decode
/// policy: a record whose credential blob cannot be decrypted or decoded is
/// reported as absent so the caller synthesizes a fresh identity, and a
/// record with an unusable key blob is reported with an empty collection.
#[async_trait]
pub trait SessionAuthStore: Send + Sync {
    async fn load_auth(&self, key: &SessionKey) -> Result<Option<StoredAuth>>;
    async fn save_auth(
        &self,
        key: &SessionKey,
        credentials: &Credentials,
        keys: &KeyTypeCollection,
    ) -> Result<()>;
    async fn delete_auth(&self, key: &SessionKey) -> Result<()>;
}

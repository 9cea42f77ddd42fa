use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tracing::warn;

use authcrypt::{
    Credentials, FieldCipher, KeyTypeCollection, SessionAuthStore, StoredAuth,
};
use protocol_link::HistorySink;
use shared::{
    domain::SessionKey,
    protocol::{ChatUpsert, ContactUpsert, InboundMessage},
};

/// SQLite-backed persistence. Credential and key blobs pass through the
/// field cipher at this boundary; SQL never sees plaintext.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    cipher: FieldCipher,
}

/// Raw durable row, still encrypted. Exposed for audit and tests.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub session_key: String,
    pub creds_cipher: Vec<u8>,
    pub keys_cipher: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str, cipher: FieldCipher) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, cipher })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_credential_row(&self, key: &SessionKey) -> Result<Option<CredentialRow>> {
        let row = sqlx::query(
            "SELECT session_key, creds_cipher, keys_cipher, updated_at
             FROM session_credentials
             WHERE session_key = ?",
        )
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CredentialRow {
            session_key: r.get::<String, _>(0),
            creds_cipher: r.get::<Vec<u8>, _>(1),
            keys_cipher: r.get::<Option<Vec<u8>>, _>(2),
            updated_at: r.get::<DateTime<Utc>, _>(3),
        }))
    }
}

#[async_trait]
impl SessionAuthStore for Storage {
    async fn load_auth(&self, key: &SessionKey) -> Result<Option<StoredAuth>> {
        let Some(row) = self.load_credential_row(key).await? else {
            return Ok(None);
        };

        // A record we cannot decrypt or decode is unrecoverable; report it
        // as absent so the caller synthesizes a fresh identity instead of
        // failing session start.
        let creds_bytes = match self.cipher.decrypt(&row.creds_cipher) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(session = %key, %error, "credential blob unusable; treating record as absent");
                return Ok(None);
            }
        };
        let credentials = match Credentials::from_bytes(&creds_bytes) {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(session = %key, %error, "credential blob undecodable; treating record as absent");
                return Ok(None);
            }
        };

        let keys = match row.keys_cipher {
            None => KeyTypeCollection::default(),
            Some(sealed) => match self
                .cipher
                .decrypt(&sealed)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| KeyTypeCollection::from_bytes(&bytes))
            {
                Ok(keys) => keys,
                Err(error) => {
                    warn!(session = %key, %error, "key blob unusable; starting with empty key material");
                    KeyTypeCollection::default()
                }
            },
        };

        Ok(Some(StoredAuth { credentials, keys }))
    }

    async fn save_auth(
        &self,
        key: &SessionKey,
        credentials: &Credentials,
        keys: &KeyTypeCollection,
    ) -> Result<()> {
        let creds_cipher = self.cipher.encrypt(&credentials.to_bytes()?)?;
        let keys_cipher = if keys.is_empty() {
            None
        } else {
            Some(self.cipher.encrypt(&keys.to_bytes()?)?)
        };

        sqlx::query(
            "INSERT INTO session_credentials (session_key, creds_cipher, keys_cipher, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(session_key) DO UPDATE SET
                creds_cipher = excluded.creds_cipher,
                keys_cipher = excluded.keys_cipher,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key.storage_key())
        .bind(creds_cipher)
        .bind(keys_cipher)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_auth(&self, key: &SessionKey) -> Result<()> {
        sqlx::query("DELETE FROM session_credentials WHERE session_key = ?")
            .bind(key.storage_key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HistorySink for Storage {
    async fn upsert_contact(&self, key: &SessionKey, contact: &ContactUpsert) -> Result<()> {
        sqlx::query(
            "INSERT INTO contacts (tenant_id, channel_id, contact_id, display_name, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(tenant_id, channel_id, contact_id) DO UPDATE SET
                display_name = excluded.display_name,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key.tenant_id.0)
        .bind(key.channel_id.0)
        .bind(&contact.contact_id)
        .bind(contact.display_name.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_chat(&self, key: &SessionKey, chat: &ChatUpsert) -> Result<()> {
        sqlx::query(
            "INSERT INTO chats (tenant_id, channel_id, chat_id, title, last_activity_at, updated_at)
             VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(tenant_id, channel_id, chat_id) DO UPDATE SET
                title = excluded.title,
                last_activity_at = excluded.last_activity_at,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key.tenant_id.0)
        .bind(key.channel_id.0)
        .bind(&chat.chat_id)
        .bind(chat.title.as_deref())
        .bind(chat.last_activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_message(&self, key: &SessionKey, message: &InboundMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (tenant_id, channel_id, message_id, chat_id, sender_id, body, from_me, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, channel_id, message_id) DO UPDATE SET
                chat_id = excluded.chat_id,
                sender_id = excluded.sender_id,
                body = excluded.body,
                from_me = excluded.from_me,
                sent_at = excluded.sent_at",
        )
        .bind(key.tenant_id.0)
        .bind(key.channel_id.0)
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(&message.sender)
        .bind(message.text.as_deref())
        .bind(message.from_me)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

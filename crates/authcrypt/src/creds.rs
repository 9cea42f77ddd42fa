use std::collections::HashMap;

use anyhow::{Context, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use shared::domain::KeyKind;
use x25519_dalek::{PublicKey, StaticSecret};

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairBytes {
    #[serde(with = "b64")]
    pub public: Vec<u8>,
    #[serde(with = "b64")]
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPairBytes,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Long-lived identity material for one session, stored encrypted as the
/// credential blob. A freshly synthesized value is valid on its own; key
/// material accumulates separately as the protocol runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub registration_id: u32,
    /// Ed25519 signing pair identifying this session to the protocol.
    pub identity_key: KeyPairBytes,
    /// X25519 pair for the transport handshake.
    pub noise_key: KeyPairBytes,
    /// X25519 pre-key whose public half is signed by the identity key.
    pub signed_pre_key: SignedPreKey,
    #[serde(with = "b64")]
    pub account_sync_secret: Vec<u8>,
    pub next_pre_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_device: Option<String>,
}

impl Credentials {
    /// Synthesizes a fresh identity from OS randomness.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let identity = SigningKey::from_bytes(&seed);

        let noise_key = x25519_pair();
        let pre_key_pair = x25519_pair();
        let signature = identity.sign(&pre_key_pair.public).to_bytes().to_vec();

        let mut account_sync_secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut account_sync_secret);

        Self {
            registration_id: (OsRng.next_u32() % 16_383) + 1,
            identity_key: KeyPairBytes {
                public: identity.verifying_key().to_bytes().to_vec(),
                secret: identity.to_bytes().to_vec(),
            },
            noise_key,
            signed_pre_key: SignedPreKey {
                key_id: 1,
                key_pair: pre_key_pair,
                signature,
            },
            account_sync_secret,
            next_pre_key_id: 1,
            paired_device: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode credentials")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to decode credentials")
    }
}

fn x25519_pair() -> KeyPairBytes {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPairBytes {
        public: public.as_bytes().to_vec(),
        secret: secret.to_bytes().to_vec(),
    }
}

/// Batch of key mutations: `Some` upserts, `None` deletes.
pub type KeyMutations = HashMap<KeyKind, HashMap<String, Option<Vec<u8>>>>;

/// Categorized key material for one session, cached in memory and stored
/// encrypted as the key blob. Mutations are last-writer-wins per (kind, id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTypeCollection {
    entries: HashMap<KeyKind, HashMap<String, Vec<u8>>>,
}

impl KeyTypeCollection {
    /// Returns only the ids that are present.
    pub fn get(&self, kind: KeyKind, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let Some(keys) = self.entries.get(&kind) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| keys.get(id).map(|payload| (id.clone(), payload.clone())))
            .collect()
    }

    /// Applies a mutation batch; returns `true` iff any entry actually
    /// changed, so callers can skip persistence for no-op batches.
    pub fn apply(&mut self, mutations: KeyMutations) -> bool {
        let mut changed = false;
        for (kind, ids) in mutations {
            for (id, payload) in ids {
                match payload {
                    Some(payload) => {
                        let keys = self.entries.entry(kind).or_default();
                        if keys.get(&id) != Some(&payload) {
                            keys.insert(id, payload);
                            changed = true;
                        }
                    }
                    None => {
                        if let Some(keys) = self.entries.get_mut(&kind) {
                            if keys.remove(&id).is_some() {
                                changed = true;
                            }
                            if keys.is_empty() {
                                self.entries.remove(&kind);
                            }
                        }
                    }
                }
            }
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode key collection")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to decode key collection")
    }
}

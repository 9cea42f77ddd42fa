use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce length for ChaCha20-Poly1305 (96 bits).
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length (128 bits).
pub const TAG_LEN: usize = 16;

/// Fixed header a sealed blob carries before the ciphertext.
pub const SEALED_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Master key length (256 bits).
pub const MASTER_KEY_LEN: usize = 32;

const MASTER_KEY_PREFIX: &str = "base64:";
const MASTER_KEY_B64_LEN: usize = 44;

#[derive(Debug, Error)]
pub enum CipherError {
    /// Fatal: the configured master key is missing or malformed.
    #[error("master key configuration invalid: {0}")]
    Config(String),
    /// The sealed payload is truncated, tampered with, or was produced
    /// under a different key. No plaintext is ever returned alongside it.
    #[error("sealed payload failed integrity check")]
    Integrity,
    #[error("sealing payload failed")]
    Seal,
}

/// Process-wide 256-bit symmetric key, read once from configuration.
///
/// Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    /// Parses the configured `base64:<44 chars>` form.
    pub fn from_encoded(encoded: &str) -> Result<Self, CipherError> {
        let b64 = encoded.strip_prefix(MASTER_KEY_PREFIX).ok_or_else(|| {
            CipherError::Config(format!("expected '{MASTER_KEY_PREFIX}<44 chars>' prefix"))
        })?;
        if b64.len() != MASTER_KEY_B64_LEN {
            return Err(CipherError::Config(format!(
                "expected {MASTER_KEY_B64_LEN} base64 chars, got {}",
                b64.len()
            )));
        }
        let decoded = STANDARD
            .decode(b64)
            .map_err(|e| CipherError::Config(format!("invalid base64: {e}")))?;
        let mut bytes = [0u8; MASTER_KEY_LEN];
        if decoded.len() != MASTER_KEY_LEN {
            return Err(CipherError::Config(format!(
                "key must decode to {MASTER_KEY_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Authenticated encryption for blobs persisted at rest.
///
/// Sealed frame layout: `[12B nonce][16B tag][ciphertext]`. The nonce is
/// freshly random per call and never reused for the same key within the
/// process.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: ChaCha20Poly1305,
}

impl FieldCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        // The aead crate appends the tag to the ciphertext; the frame wants
        // it up front so truncation is detectable before any decryption.
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Seal)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut framed = Vec::with_capacity(SEALED_OVERHEAD + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(tag);
        framed.extend_from_slice(ciphertext);
        Ok(framed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(CipherError::Integrity);
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut joined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        joined.extend_from_slice(ciphertext);
        joined.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), joined.as_slice())
            .map_err(|_| CipherError::Integrity)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn test_cipher() -> FieldCipher {
        FieldCipher::new(&MasterKey::from_bytes([0x42; MASTER_KEY_LEN]))
    }

    #[test]
    fn round_trips_arbitrary_payloads() {
        let cipher = test_cipher();
        for plaintext in [&b""[..], &b"x"[..], &b"credentials blob"[..], &[0u8; 4096][..]] {
            let sealed = cipher.encrypt(plaintext).expect("encrypt");
            assert_eq!(sealed.len(), SEALED_OVERHEAD + plaintext.len());
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn flipping_any_byte_fails_integrity() {
        let cipher = test_cipher();
        let sealed = cipher.encrypt(b"tamper target").expect("encrypt");
        for index in 0..sealed.len() {
            let mut corrupted = sealed.clone();
            corrupted[index] ^= 0x01;
            match cipher.decrypt(&corrupted) {
                Err(CipherError::Integrity) => {}
                other => panic!("byte {index}: expected integrity failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn short_frames_are_rejected() {
        let cipher = test_cipher();
        assert!(matches!(cipher.decrypt(&[]), Err(CipherError::Integrity)));
        assert!(matches!(
            cipher.decrypt(&[0u8; SEALED_OVERHEAD - 1]),
            Err(CipherError::Integrity)
        ));
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let sealed = test_cipher().encrypt(b"secret").expect("encrypt");
        let other = FieldCipher::new(&MasterKey::from_bytes([0x24; MASTER_KEY_LEN]));
        assert!(matches!(other.decrypt(&sealed), Err(CipherError::Integrity)));
    }

    #[test]
    fn nonces_are_unique_across_many_calls() {
        let cipher = test_cipher();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let sealed = cipher.encrypt(b"n").expect("encrypt");
            assert!(seen.insert(sealed[..NONCE_LEN].to_vec()), "nonce reused");
        }
    }

    #[test]
    fn master_key_accepts_canonical_encoding() {
        let encoded = format!("base64:{}", STANDARD.encode([7u8; MASTER_KEY_LEN]));
        assert!(MasterKey::from_encoded(&encoded).is_ok());
    }

    #[test]
    fn master_key_rejects_malformed_encodings() {
        let valid_b64 = STANDARD.encode([7u8; MASTER_KEY_LEN]);
        for encoded in [
            String::new(),
            valid_b64.clone(),
            format!("base64:{}", &valid_b64[..43]),
            format!("base64:{}", "!".repeat(44)),
            format!("base64:{}", STANDARD.encode([7u8; 33])),
        ] {
            assert!(
                matches!(MasterKey::from_encoded(&encoded), Err(CipherError::Config(_))),
                "accepted malformed key {encoded:?}"
            );
        }
    }
}

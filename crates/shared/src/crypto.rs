//! Symmetric encryption envelope for at-rest server secrets
//!
//! Backend server arguments, environment variables, and outbound headers are
//! stored encrypted. Tokens are `version || nonce || ciphertext+tag`,
//! base64-encoded for text columns. The key is loaded once at startup from
//! `MCP_ENCRYPTION_KEY`; losing it renders encrypted fields unrecoverable.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Serialize};

/// Current token format version
const TOKEN_VERSION: u8 = 1;

/// AES-256-GCM nonce size in bytes
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encryption key")]
    InvalidKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed")]
    Decryption,
    #[error("Unknown token version: {0}")]
    UnknownVersion(u8),
    #[error("Malformed token")]
    Malformed,
}

/// Process-wide symmetric envelope. Holds no lock; each operation is
/// self-contained and completes in microseconds for plaintexts up to 64 KiB.
pub struct CryptoEnvelope {
    cipher: Aes256Gcm,
}

impl CryptoEnvelope {
    /// Build an envelope from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CryptoError> {
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Encrypt plaintext into a base64 token with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut token = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(token))
    }

    /// Decrypt a base64 token produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, token_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let token = BASE64
            .decode(token_b64.trim())
            .map_err(|_| CryptoError::Malformed)?;

        if token.len() < 1 + NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        if token[0] != TOKEN_VERSION {
            return Err(CryptoError::UnknownVersion(token[0]));
        }

        let nonce = Nonce::from_slice(&token[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &token[1 + NONCE_LEN..])
            .map_err(|_| CryptoError::Decryption)
    }

    /// Encrypt a JSON-serializable value (argument lists, env maps, headers).
    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| CryptoError::Encryption)?;
        self.encrypt(&plaintext)
    }

    /// Decrypt a token back into a JSON value.
    pub fn decrypt_json<T: DeserializeOwned>(&self, token_b64: &str) -> Result<T, CryptoError> {
        let plaintext = self.decrypt(token_b64)?;
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output
        f.debug_struct("CryptoEnvelope").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_envelope() -> CryptoEnvelope {
        let key = [0x42u8; 32];
        CryptoEnvelope::from_base64_key(&BASE64.encode(key)).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let envelope = test_envelope();
        let token = envelope.encrypt(b"TOKEN=abc").unwrap();
        assert_ne!(token.as_bytes(), b"TOKEN=abc");
        assert_eq!(envelope.decrypt(&token).unwrap(), b"TOKEN=abc");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let envelope = test_envelope();
        let a = envelope.encrypt(b"same plaintext").unwrap();
        let b = envelope.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let envelope = test_envelope();
        let token = envelope.encrypt(b"secret").unwrap();

        let mut raw = BASE64.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            envelope.decrypt(&tampered),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = test_envelope();
        let token = envelope.encrypt(b"secret").unwrap();

        let other = CryptoEnvelope::from_base64_key(&BASE64.encode([0x7fu8; 32])).unwrap();
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let envelope = test_envelope();
        let token = envelope.encrypt(b"secret").unwrap();

        let mut raw = BASE64.decode(&token).unwrap();
        raw[0] = 9;
        let future = BASE64.encode(raw);

        assert!(matches!(
            envelope.decrypt(&future),
            Err(CryptoError::UnknownVersion(9))
        ));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let envelope = test_envelope();
        assert!(matches!(
            envelope.decrypt("not base64 at all!!!"),
            Err(CryptoError::Malformed)
        ));
        assert!(matches!(
            envelope.decrypt(&BASE64.encode([1u8; 4])),
            Err(CryptoError::Malformed)
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(CryptoEnvelope::from_base64_key(&BASE64.encode([1u8; 16])).is_err());
        assert!(CryptoEnvelope::from_base64_key("not-base64!").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let envelope = test_envelope();
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "abc".to_string());

        let token = envelope.encrypt_json(&env).unwrap();
        assert!(!token.contains("abc"));

        let recovered: HashMap<String, String> = envelope.decrypt_json(&token).unwrap();
        assert_eq!(recovered, env);
    }
}

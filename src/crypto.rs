//! Connector secret encryption using AES-256-GCM
//!
//! Sensitive connector configuration fields (API keys, client secrets,
//! passwords) are encrypted before the connector row is persisted. The
//! additional authenticated data binds each ciphertext to its owning
//! `tenant_id|connector_type|connector_id`, so a value copied into another
//! connector row fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Prefix marking an encrypted string value inside connector config JSON.
pub const ENCRYPTED_VALUE_PREFIX: &str = "enc:v1:";

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Identity of the connector row a secret belongs to.
#[derive(Debug, Clone, Copy)]
pub struct SecretContext<'a> {
    pub tenant_id: Uuid,
    pub connector_type: &'a str,
    pub connector_id: Uuid,
}

impl SecretContext<'_> {
    fn aad(&self) -> String {
        format!(
            "{}|{}|{}",
            self.tenant_id, self.connector_type, self.connector_id
        )
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // version || nonce || ciphertext+tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Encrypt a single string secret into its `enc:v1:` config representation.
pub fn encrypt_secret(
    key: &CryptoKey,
    ctx: SecretContext<'_>,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let bytes = encrypt_bytes(key, ctx.aad().as_bytes(), plaintext.as_bytes())?;
    Ok(format!(
        "{}{}",
        ENCRYPTED_VALUE_PREFIX,
        general_purpose::STANDARD.encode(bytes)
    ))
}

/// Decrypt a single `enc:v1:` value. Values without the prefix are returned as-is.
pub fn decrypt_secret(
    key: &CryptoKey,
    ctx: SecretContext<'_>,
    value: &str,
) -> Result<String, CryptoError> {
    let Some(encoded) = value.strip_prefix(ENCRYPTED_VALUE_PREFIX) else {
        return Ok(value.to_string());
    };

    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidFormat)?;
    let plaintext = decrypt_bytes(key, ctx.aad().as_bytes(), &bytes)?;

    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}

/// Encrypt the named top-level string fields of a connector config in place.
pub fn encrypt_config_secrets(
    key: &CryptoKey,
    ctx: SecretContext<'_>,
    config: &mut JsonValue,
    secret_fields: &[&str],
) -> Result<(), CryptoError> {
    let Some(object) = config.as_object_mut() else {
        return Ok(());
    };

    for field in secret_fields {
        if let Some(JsonValue::String(value)) = object.get_mut(*field)
            && !value.starts_with(ENCRYPTED_VALUE_PREFIX)
        {
            *value = encrypt_secret(key, ctx, value)?;
        }
    }

    Ok(())
}

/// Decrypt every `enc:v1:` string field of a connector config in place.
pub fn decrypt_config_secrets(
    key: &CryptoKey,
    ctx: SecretContext<'_>,
    config: &mut JsonValue,
) -> Result<(), CryptoError> {
    let Some(object) = config.as_object_mut() else {
        return Ok(());
    };

    for value in object.values_mut() {
        if let JsonValue::String(s) = value
            && s.starts_with(ENCRYPTED_VALUE_PREFIX)
        {
            *s = decrypt_secret(key, ctx, s)?;
        }
    }

    Ok(())
}

/// Replace the named fields with a fixed mask for API responses.
pub fn redact_config_secrets(config: &mut JsonValue, secret_fields: &[&str]) {
    if let Some(object) = config.as_object_mut() {
        for field in secret_fields {
            if let Some(value) = object.get_mut(*field) {
                *value = JsonValue::String("********".to_string());
            }
        }
    }
}

//! Webhook payload decryption.
//!
//! Feishu encrypts event bodies as `base64(iv || ciphertext)` with
//! AES-256-CBC, where the AES key is the SHA-256 digest of the configured
//! encrypt key. A pure transform with no state.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Decrypt an `encrypt` field from a webhook envelope into its plaintext
/// JSON string.
pub fn decrypt_webhook(payload_b64: &str, encrypt_key: &str) -> Result<String> {
    let data = STANDARD
        .decode(payload_b64.trim())
        .map_err(|e| RelayError::InvalidPayload(format!("bad base64: {e}")))?;
    if data.len() <= IV_LEN {
        return Err(RelayError::InvalidPayload("ciphertext too short".into()));
    }

    let key = Sha256::digest(encrypt_key.as_bytes());
    let (iv, ciphertext) = data.split_at(IV_LEN);

    let decryptor = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|e| RelayError::InvalidPayload(format!("bad key/iv: {e}")))?;
    let mut buf = ciphertext.to_vec();
    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| RelayError::InvalidPayload("decryption failed".into()))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| RelayError::InvalidPayload("plaintext is not utf-8".into()))
}

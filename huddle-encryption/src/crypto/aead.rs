// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption.
//!
//! The 24-byte nonce is generated per message and prepended to the
//! ciphertext, so a ciphertext is always `NONCE_SIZE + plaintext + 16`
//! bytes long.
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::crypto::{Rng, RngError, SecretBytes, SECRET_SIZE};

/// Symmetric AEAD key size in bytes.
pub const KEY_SIZE: usize = SECRET_SIZE;

/// XChaCha nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// 32-byte symmetric AEAD key.
pub type AeadKey = SecretBytes;

/// Encrypt plaintext with optional additional authenticated data.
///
/// Returns the random nonce prepended to the ciphertext.
pub fn encrypt(
    plaintext: &[u8],
    key: &AeadKey,
    aad: &[u8],
    rng: &Rng,
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| AeadError::InvalidKeyLength)?;

    let nonce_bytes = rng.random_nonce()?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a nonce-prepended ciphertext.
pub fn decrypt(ciphertext: &[u8], key: &AeadKey, aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    // Minimum length is one nonce plus the Poly1305 tag.
    if ciphertext.len() < NONCE_SIZE + 16 {
        return Err(AeadError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| AeadError::InvalidKeyLength)?;

    let (nonce_bytes, ciphertext) = ciphertext.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::DecryptionFailed)?;

    Ok(plaintext)
}

/// Generate a fresh random AEAD key.
pub fn generate_key(rng: &Rng) -> Result<AeadKey, RngError> {
    Ok(SecretBytes::from_bytes(rng.random_key_material()?))
}

/// Build an AEAD key from externally agreed bytes, for example a session
/// key negotiated between two peers.
pub fn key_from_bytes(bytes: [u8; KEY_SIZE]) -> AeadKey {
    SecretBytes::from_bytes(bytes)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("aead key has invalid length")]
    InvalidKeyLength,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error(transparent)]
    Rng(#[from] RngError),
}

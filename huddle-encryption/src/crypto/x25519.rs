// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 key agreement and ephemeral-key sealed boxes.
//!
//! A sealed box encrypts a payload to a recipient's public key without any
//! prior shared state: the sender generates an ephemeral key pair, computes
//! the Diffie-Hellman agreement against the recipient key, derives an AEAD
//! key from it and attaches the ephemeral public key so the recipient can
//! perform the same computation.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::{self, AeadError};
use crate::crypto::hkdf::{hkdf_32, HkdfError};
use crate::crypto::{Rng, RngError, SecretBytes, SECRET_SIZE};

/// X25519 key size in bytes.
pub const KEY_SIZE: usize = SECRET_SIZE;

/// Info string binding sealed-box AEAD keys to this construction.
const SEALED_BOX_INFO: &[u8] = b"huddle-sealed-box-v1";

/// X25519 secret key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(SecretBytes);

impl SecretKey {
    /// Generate a new secret key from the given random number generator.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(SecretBytes::from_bytes(rng.random_key_material()?)))
    }

    /// Derive a secret key from the given bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(SecretBytes::from_bytes(bytes))
    }

    /// Matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(*self.0.as_bytes());
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Compute the shared secret between our secret key and their public key.
    pub fn calculate_agreement(&self, their_key: &PublicKey) -> SecretBytes {
        let secret = x25519_dalek::StaticSecret::from(*self.0.as_bytes());
        let their_key = x25519_dalek::PublicKey::from(their_key.0);
        SecretBytes::from_bytes(secret.diffie_hellman(&their_key).to_bytes())
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; KEY_SIZE]);

impl PublicKey {
    /// Create a `PublicKey` from its raw bytes representation.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Convert the public key to a base58 string.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base58())
    }
}

/// Payload encrypted to a public key with an ephemeral sender key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ephemeral_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload to the recipient's public key.
pub fn seal(
    plaintext: &[u8],
    recipient: &PublicKey,
    rng: &Rng,
) -> Result<SealedBox, X25519Error> {
    let ephemeral = SecretKey::generate(rng)?;
    let agreement = ephemeral.calculate_agreement(recipient);
    let key = hkdf_32(agreement.as_bytes(), SEALED_BOX_INFO)?;

    let ciphertext = aead::encrypt(plaintext, &key, &[], rng)?;

    Ok(SealedBox {
        ephemeral_key: ephemeral.public_key(),
        ciphertext,
    })
}

/// Decrypt a sealed box with the recipient's secret key.
pub fn open(sealed: &SealedBox, recipient_secret: &SecretKey) -> Result<Vec<u8>, X25519Error> {
    let agreement = recipient_secret.calculate_agreement(&sealed.ephemeral_key);
    let key = hkdf_32(agreement.as_bytes(), SEALED_BOX_INFO)?;

    let plaintext = aead::decrypt(&sealed.ciphertext, &key, &[])?;

    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{open, seal, SecretKey};

    #[test]
    fn agreement_is_symmetric() {
        let rng = Rng::from_seed([1; 32]);

        let alice = SecretKey::generate(&rng).unwrap();
        let bob = SecretKey::generate(&rng).unwrap();

        let alice_side = alice.calculate_agreement(&bob.public_key());
        let bob_side = bob.calculate_agreement(&alice.public_key());

        assert_eq!(alice_side, bob_side);
    }

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([2; 32]);

        let recipient = SecretKey::generate(&rng).unwrap();
        let sealed = seal(b"half of a session seed", &recipient.public_key(), &rng).unwrap();

        let plaintext = open(&sealed, &recipient).unwrap();
        assert_eq!(plaintext, b"half of a session seed");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let rng = Rng::from_seed([3; 32]);

        let recipient = SecretKey::generate(&rng).unwrap();
        let other = SecretKey::generate(&rng).unwrap();

        let sealed = seal(b"half of a session seed", &recipient.public_key(), &rng).unwrap();

        assert!(open(&sealed, &other).is_err());
    }
}

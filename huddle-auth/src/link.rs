// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signed, encrypted entries in the team graph.
//!
//! A link body is CBOR-encoded, encrypted under the team keyset generation
//! recorded in the wrapper, hashed and signed. The ciphertext hash is the
//! link's identity, so two links with identical content are the same link.
use huddle_core::cbor::{decode_cbor, encode_cbor};
use huddle_core::identity::{PrivateKey, PublicKey as SigningPublicKey, Signature};
use huddle_core::Hash;
use huddle_encryption::crypto::aead;
use huddle_encryption::{Keyring, KeysetWithSecrets, Lockbox, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::TeamAction;

/// Info string binding link AEAD keys to the team scope.
pub(crate) const LINK_KEY_INFO: &[u8] = b"huddle-team-link-v1";

/// The plaintext content of a link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkBody {
    pub action: TeamAction,

    /// User the authoring device belongs to.
    pub user_id: String,

    /// Device which signed this link.
    pub device_id: String,

    /// Author's wall-clock time in milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Hashes of the graph heads at the author's moment of authorship.
    pub prev: Vec<Hash>,

    /// Key envelopes granted by this action.
    pub lockboxes: Vec<Lockbox>,
}

/// The wire and storage form of a link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedLink {
    /// AEAD ciphertext of the CBOR-encoded body.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    /// Team keyset generation the body is encrypted under.
    pub generation: u32,

    /// Signing key of the authoring device.
    pub author: SigningPublicKey,

    /// Signature over the ciphertext hash.
    pub signature: Signature,
}

impl EncryptedLink {
    /// Content hash identifying this link.
    pub fn hash(&self) -> Hash {
        Hash::new(&self.ciphertext)
    }

    /// Verify the author's signature over the ciphertext hash.
    pub fn verify_signature(&self) -> bool {
        self.author
            .verify(self.hash().as_bytes(), &self.signature)
    }

    /// Encrypt and sign a body, producing the sealed link and its decrypted
    /// in-memory twin.
    pub fn seal(
        body: LinkBody,
        team_keys: &KeysetWithSecrets,
        signing_key: &PrivateKey,
        rng: &Rng,
    ) -> Result<(Self, Link), LinkError> {
        let plaintext = encode_cbor(&body)?;
        let key = team_keys
            .derive_symmetric_key(LINK_KEY_INFO)
            .map_err(|_| LinkError::KeyDerivation)?;

        // The generation rides outside the ciphertext so receivers can pick
        // the right key; binding it as AAD stops it being swapped.
        let generation = team_keys.generation;
        let ciphertext = aead::encrypt(&plaintext, &key, &generation.to_be_bytes(), rng)?;

        let hash = Hash::new(&ciphertext);
        let signature = signing_key.sign(hash.as_bytes());
        let author = signing_key.public_key();

        let encrypted = Self {
            ciphertext,
            generation,
            author,
            signature,
        };
        let link = Link {
            hash,
            body,
            author,
            signature,
        };

        Ok((encrypted, link))
    }

    /// Decrypt the body with the matching generation from the team keyring
    /// and verify the signature.
    ///
    /// Every keyset variant of the recorded generation is tried: after a
    /// partition, both sides may have rotated to the same generation number
    /// and links from both branches must stay readable.
    pub fn open(&self, keyring: &Keyring) -> Result<Link, LinkError> {
        let hash = self.hash();

        if !self.verify_signature() {
            return Err(LinkError::SignatureInvalid(hash));
        }

        let candidates = keyring.get_all(self.generation);
        if candidates.is_empty() {
            return Err(LinkError::UnknownGeneration(hash, self.generation));
        }

        for team_keys in candidates {
            let key = team_keys
                .derive_symmetric_key(LINK_KEY_INFO)
                .map_err(|_| LinkError::KeyDerivation)?;

            if let Ok(plaintext) =
                aead::decrypt(&self.ciphertext, &key, &self.generation.to_be_bytes())
            {
                let body: LinkBody = decode_cbor(&plaintext)?;

                return Ok(Link {
                    hash,
                    body,
                    author: self.author,
                    signature: self.signature,
                });
            }
        }

        Err(LinkError::DecryptionFailed(hash))
    }
}

/// A decrypted link as held in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    pub hash: Hash,
    pub body: LinkBody,
    pub author: SigningPublicKey,
    pub signature: Signature,
}

impl Link {
    /// Return `true` if this link has no predecessors.
    pub fn is_root(&self) -> bool {
        self.body.prev.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("signature of link {0} is invalid")]
    SignatureInvalid(Hash),

    #[error("unable to decrypt link {0}")]
    DecryptionFailed(Hash),

    #[error("no team key of generation {1} known for link {0}")]
    UnknownGeneration(Hash, u32),

    #[error("unable to derive link encryption key")]
    KeyDerivation,

    #[error(transparent)]
    Aead(#[from] aead::AeadError),

    #[error(transparent)]
    Encode(#[from] huddle_core::cbor::EncodeError),

    #[error(transparent)]
    Decode(#[from] huddle_core::cbor::DecodeError),
}

#[cfg(test)]
mod tests {
    use huddle_core::identity::PrivateKey;
    use huddle_encryption::{KeyScope, Keyring, KeysetWithSecrets, Rng};

    use crate::action::TeamAction;
    use crate::state::Role;

    use super::{EncryptedLink, LinkBody, LinkError};

    fn body() -> LinkBody {
        LinkBody {
            action: TeamAction::AddRole {
                role: Role::new("ops"),
            },
            user_id: "alice".to_string(),
            device_id: "alice::laptop".to_string(),
            timestamp: 170_000,
            prev: Vec::new(),
            lockboxes: Vec::new(),
        }
    }

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);
        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let signing_key = PrivateKey::from_bytes(&[7; 32]);

        let (encrypted, link) =
            EncryptedLink::seal(body(), &team_keys, &signing_key, &rng).unwrap();

        assert_eq!(encrypted.hash(), link.hash);
        assert!(encrypted.verify_signature());

        let keyring = Keyring::new(team_keys);
        let opened = encrypted.open(&keyring).unwrap();

        assert_eq!(opened.body, link.body);
        assert_eq!(opened.hash, link.hash);
    }

    #[test]
    fn wrong_generation_is_rejected() {
        let rng = Rng::from_seed([2; 32]);
        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let signing_key = PrivateKey::from_bytes(&[7; 32]);

        let (encrypted, _) = EncryptedLink::seal(body(), &team_keys, &signing_key, &rng).unwrap();

        // A keyring which never saw generation zero.
        let other_ring = Keyring::new(team_keys.rotate(&rng).unwrap());

        assert!(matches!(
            encrypted.open(&other_ring),
            Err(LinkError::UnknownGeneration(_, 0))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let rng = Rng::from_seed([3; 32]);
        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let signing_key = PrivateKey::from_bytes(&[7; 32]);

        let (mut encrypted, _) =
            EncryptedLink::seal(body(), &team_keys, &signing_key, &rng).unwrap();

        // Flipping a byte changes the hash, so the signature no longer
        // covers the content.
        let last = encrypted.ciphertext.len() - 1;
        encrypted.ciphertext[last] ^= 0xff;

        let keyring = Keyring::new(team_keys);
        assert!(matches!(
            encrypted.open(&keyring),
            Err(LinkError::SignatureInvalid(_))
        ));
    }
}

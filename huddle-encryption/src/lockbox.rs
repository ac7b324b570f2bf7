// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted envelopes delivering one keyset to the holder of a recipient
//! scope's secret key.
use huddle_core::cbor::{decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::{self, AeadError};
use crate::crypto::hkdf::{hkdf_32, HkdfError};
use crate::crypto::x25519;
use crate::crypto::{Rng, RngError};
use crate::keyset::{Keyset, KeysetRef, KeysetWithSecrets};

/// Info string binding lockbox AEAD keys to this construction.
const LOCKBOX_INFO: &[u8] = b"huddle-lockbox-v1";

/// An encrypted keyset envelope.
///
/// Whoever holds the secret encryption key of `recipient` can open the box
/// and learn the full `contents` keyset, secrets included. A lockbox is a
/// directed "can-read" edge from the recipient scope to the contents scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockbox {
    /// Who can open this box.
    pub recipient: KeysetRef,

    /// Public encryption key of the recipient generation the box was
    /// created for.
    pub recipient_key: x25519::PublicKey,

    /// Which keyset is inside (public knowledge; the secrets are not).
    pub contents: KeysetRef,

    /// Ephemeral sender key for the Diffie-Hellman agreement.
    pub ephemeral_key: x25519::PublicKey,

    /// AEAD ciphertext of the CBOR-encoded contents keyset.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Lockbox {
    /// Encrypt `contents` to the recipient keyset.
    pub fn create(
        contents: &KeysetWithSecrets,
        recipient: &Keyset,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        Self::create_for(contents, recipient.to_ref(), recipient.encryption, rng)
    }

    /// Encrypt `contents` to a recipient known only by reference and
    /// encryption key.
    ///
    /// Replacement lockboxes are built this way during rotation, where the
    /// recipient's full keyset is not at hand but its reference and public
    /// encryption key survive in the lockbox being replaced.
    pub fn create_for(
        contents: &KeysetWithSecrets,
        recipient: KeysetRef,
        recipient_key: x25519::PublicKey,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        let ephemeral = x25519::SecretKey::generate(rng)?;
        let agreement = ephemeral.calculate_agreement(&recipient_key);
        let key = hkdf_32(agreement.as_bytes(), LOCKBOX_INFO)?;

        let plaintext = encode_cbor(contents).map_err(|_| LockboxError::Encoding)?;
        let ciphertext = aead::encrypt(&plaintext, &key, &[], rng)?;

        Ok(Self {
            recipient,
            recipient_key,
            contents: contents.to_ref(),
            ephemeral_key: ephemeral.public_key(),
            ciphertext,
        })
    }

    /// Decrypt the box with the recipient's secret encryption key.
    pub fn open(
        &self,
        recipient_secret: &x25519::SecretKey,
    ) -> Result<KeysetWithSecrets, LockboxError> {
        let agreement = recipient_secret.calculate_agreement(&self.ephemeral_key);
        let key = hkdf_32(agreement.as_bytes(), LOCKBOX_INFO)?;

        let plaintext =
            aead::decrypt(&self.ciphertext, &key, &[]).map_err(|_| LockboxError::DecryptionFailed)?;

        let keys: KeysetWithSecrets =
            decode_cbor(&plaintext).map_err(|_| LockboxError::Encoding)?;

        if keys.to_ref() != self.contents {
            return Err(LockboxError::ContentsMismatch);
        }

        Ok(keys)
    }

    /// Re-issue this box with new contents, optionally re-targeted at a new
    /// generation of the recipient's keys.
    ///
    /// The recipient scope never changes; rotation advances the contents
    /// generation, the recipient generation, or both.
    pub fn rotate(
        &self,
        new_contents: &KeysetWithSecrets,
        new_recipient: Option<&Keyset>,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        match new_recipient {
            Some(recipient) => {
                if recipient.scope != self.recipient.scope {
                    return Err(LockboxError::RecipientMismatch(
                        recipient.to_ref(),
                        self.recipient.clone(),
                    ));
                }

                Self::create(new_contents, recipient, rng)
            }
            // Same recipient generation, new contents.
            None => Self::create_for(new_contents, self.recipient.clone(), self.recipient_key, rng),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error("lockbox decryption failed")]
    DecryptionFailed,

    #[error("lockbox contents do not match the declared keyset reference")]
    ContentsMismatch,

    #[error("new recipient {0} does not match lockbox recipient {1}")]
    RecipientMismatch(KeysetRef, KeysetRef),

    #[error("unable to encode or decode lockbox contents")]
    Encoding,

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
    use crate::keyset::{KeyScope, KeysetWithSecrets};

    use super::{Lockbox, LockboxError};

    #[test]
    fn create_and_open() {
        let rng = Rng::from_seed([1; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let user_keys = KeysetWithSecrets::generate(KeyScope::user("alice"), &rng).unwrap();

        // Team keys, readable by Alice.
        let lockbox = Lockbox::create(&team_keys, &user_keys.public(), &rng).unwrap();

        let opened = lockbox.open(&user_keys.encryption).unwrap();
        assert_eq!(opened.scope, KeyScope::team());
        assert_eq!(opened.public(), team_keys.public());
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let rng = Rng::from_seed([2; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let alice_keys = KeysetWithSecrets::generate(KeyScope::user("alice"), &rng).unwrap();
        let eve_keys = KeysetWithSecrets::generate(KeyScope::user("eve"), &rng).unwrap();

        let lockbox = Lockbox::create(&team_keys, &alice_keys.public(), &rng).unwrap();

        assert!(matches!(
            lockbox.open(&eve_keys.encryption),
            Err(LockboxError::DecryptionFailed)
        ));
    }

    #[test]
    fn rotate_contents() {
        let rng = Rng::from_seed([3; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let alice_keys = KeysetWithSecrets::generate(KeyScope::user("alice"), &rng).unwrap();

        let lockbox = Lockbox::create(&team_keys, &alice_keys.public(), &rng).unwrap();

        // Team keys are rotated after a removal; Alice keeps her keys.
        let next_team_keys = team_keys.rotate(&rng).unwrap();
        let rotated = lockbox.rotate(&next_team_keys, None, &rng).unwrap();

        assert_eq!(rotated.contents.generation, 1);
        assert_eq!(rotated.recipient, lockbox.recipient);

        let opened = rotated.open(&alice_keys.encryption).unwrap();
        assert_eq!(opened.generation, 1);
    }

    #[test]
    fn rotate_recipient_and_contents() {
        let rng = Rng::from_seed([4; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let alice_keys = KeysetWithSecrets::generate(KeyScope::user("alice"), &rng).unwrap();

        let lockbox = Lockbox::create(&team_keys, &alice_keys.public(), &rng).unwrap();

        // Alice's own keys rotate too; the replacement box targets the new
        // generation.
        let next_team_keys = team_keys.rotate(&rng).unwrap();
        let next_alice_keys = alice_keys.rotate(&rng).unwrap();

        let rotated = lockbox
            .rotate(&next_team_keys, Some(&next_alice_keys.public()), &rng)
            .unwrap();

        assert_eq!(rotated.recipient.generation, 1);
        assert!(rotated.open(&alice_keys.encryption).is_err());
        assert!(rotated.open(&next_alice_keys.encryption).is_ok());
    }

    #[test]
    fn rotate_cannot_change_recipient_scope() {
        let rng = Rng::from_seed([5; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let alice_keys = KeysetWithSecrets::generate(KeyScope::user("alice"), &rng).unwrap();
        let bob_keys = KeysetWithSecrets::generate(KeyScope::user("bob"), &rng).unwrap();

        let lockbox = Lockbox::create(&team_keys, &alice_keys.public(), &rng).unwrap();

        let result = lockbox.rotate(&team_keys, Some(&bob_keys.public()), &rng);
        assert!(matches!(result, Err(LockboxError::RecipientMismatch(_, _))));
    }
}

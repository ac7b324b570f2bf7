// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key scopes and generation-tagged keysets.
use std::fmt;

use huddle_core::identity::{PrivateKey, PublicKey as SigningPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::AeadKey;
use crate::crypto::hkdf::hkdf_32;
use crate::crypto::x25519;
use crate::crypto::{Rng, RngError};

/// Info string for deriving a signing key from seed material.
const SIGNING_INFO: &[u8] = b"huddle-keyset-signing-v1";

/// Info string for deriving an encryption key from seed material.
const ENCRYPTION_INFO: &[u8] = b"huddle-keyset-encryption-v1";

/// The kind of principal a keyset belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeType {
    Team,
    Role,
    User,
    Device,
    Server,
    Ephemeral,
}

/// A principal or grant-target under which keys exist.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyScope {
    pub scope_type: ScopeType,
    pub name: String,
}

impl KeyScope {
    pub fn team() -> Self {
        Self {
            scope_type: ScopeType::Team,
            name: "team".to_string(),
        }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Role,
            name: name.into(),
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::User,
            name: user_id.into(),
        }
    }

    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Device,
            name: device_id.into(),
        }
    }

    pub fn server(host: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Server,
            name: host.into(),
        }
    }

    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Ephemeral,
            name: name.into(),
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.scope_type {
            ScopeType::Team => "team",
            ScopeType::Role => "role",
            ScopeType::User => "user",
            ScopeType::Device => "device",
            ScopeType::Server => "server",
            ScopeType::Ephemeral => "ephemeral",
        };

        write!(f, "{}:{}", kind, self.name)
    }
}

/// Public keys of one scope at one generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyset {
    pub scope: KeyScope,
    pub generation: u32,
    pub signing: SigningPublicKey,
    pub encryption: x25519::PublicKey,
}

impl Keyset {
    /// Reference identifying this keyset by scope and generation.
    pub fn to_ref(&self) -> KeysetRef {
        KeysetRef {
            scope: self.scope.clone(),
            generation: self.generation,
        }
    }
}

/// Reference to a keyset: the scope it belongs to and the generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeysetRef {
    pub scope: KeyScope,
    pub generation: u32,
}

impl fmt::Display for KeysetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.generation)
    }
}

/// A keyset together with its secret halves.
///
/// A generation's keys are immutable; rotation always produces a fresh
/// keyset at the next generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysetWithSecrets {
    pub scope: KeyScope,
    pub generation: u32,
    pub signing: PrivateKey,
    pub encryption: x25519::SecretKey,
}

impl KeysetWithSecrets {
    /// Generate a fresh generation-zero keyset for the given scope.
    pub fn generate(scope: KeyScope, rng: &Rng) -> Result<Self, KeysetError> {
        Ok(Self {
            scope,
            generation: 0,
            signing: PrivateKey::from_bytes(&rng.random_key_material()?),
            encryption: x25519::SecretKey::generate(rng)?,
        })
    }

    /// Deterministically derive a generation-zero keyset from seed material.
    ///
    /// Both parties of an invitation derive the same keyset from the shared
    /// seed, which is how an invitee proves possession of the seed.
    pub fn from_seed(scope: KeyScope, seed: &[u8]) -> Result<Self, KeysetError> {
        let signing_bytes = hkdf_32(seed, SIGNING_INFO)
            .map_err(|_| KeysetError::SeedDerivation)?;
        let encryption_bytes = hkdf_32(seed, ENCRYPTION_INFO)
            .map_err(|_| KeysetError::SeedDerivation)?;

        Ok(Self {
            scope,
            generation: 0,
            signing: PrivateKey::from_bytes(signing_bytes.as_bytes()),
            encryption: x25519::SecretKey::from_bytes(*encryption_bytes.as_bytes()),
        })
    }

    /// Public halves of this keyset.
    pub fn public(&self) -> Keyset {
        Keyset {
            scope: self.scope.clone(),
            generation: self.generation,
            signing: self.signing.public_key(),
            encryption: self.encryption.public_key(),
        }
    }

    /// Reference identifying this keyset by scope and generation.
    pub fn to_ref(&self) -> KeysetRef {
        KeysetRef {
            scope: self.scope.clone(),
            generation: self.generation,
        }
    }

    /// Derive a symmetric AEAD key from this keyset's encryption secret.
    ///
    /// The info string domain-separates the derived keys, so one keyset can
    /// back several symmetric purposes (link encryption, application
    /// payloads) without key reuse.
    pub fn derive_symmetric_key(&self, info: &[u8]) -> Result<AeadKey, KeysetError> {
        hkdf_32(self.encryption.secret_bytes(), info).map_err(|_| KeysetError::SeedDerivation)
    }

    /// Produce a fresh keyset for the same scope at the next generation.
    pub fn rotate(&self, rng: &Rng) -> Result<Self, KeysetError> {
        Ok(Self {
            scope: self.scope.clone(),
            generation: self.generation + 1,
            signing: PrivateKey::from_bytes(&rng.random_key_material()?),
            encryption: x25519::SecretKey::generate(rng)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum KeysetError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("unable to derive keys from seed material")]
    SeedDerivation,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{KeyScope, KeysetWithSecrets};

    #[test]
    fn generate_and_rotate() {
        let rng = Rng::from_seed([1; 32]);

        let keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        assert_eq!(keys.generation, 0);

        let rotated = keys.rotate(&rng).unwrap();
        assert_eq!(rotated.generation, 1);
        assert_eq!(rotated.scope, keys.scope);
        assert_ne!(rotated.public().signing, keys.public().signing);
        assert_ne!(rotated.public().encryption, keys.public().encryption);
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let scope = KeyScope::ephemeral("invitation");

        let keys_1 = KeysetWithSecrets::from_seed(scope.clone(), b"abc123").unwrap();
        let keys_2 = KeysetWithSecrets::from_seed(scope.clone(), b"abc123").unwrap();
        let keys_3 = KeysetWithSecrets::from_seed(scope, b"different").unwrap();

        assert_eq!(keys_1.public(), keys_2.public());
        assert_ne!(keys_1.public().signing, keys_3.public().signing);
    }

    #[test]
    fn signing_and_encryption_keys_differ() {
        let keys =
            KeysetWithSecrets::from_seed(KeyScope::ephemeral("invitation"), b"abc123").unwrap();

        // The two halves are derived with distinct info strings.
        assert_ne!(
            keys.signing.as_bytes().as_slice(),
            keys.encryption.public_key().as_bytes().as_slice()
        );
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Historical sequence of keysets for one scope.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keyset::{KeyScope, KeysetWithSecrets};

/// All generations of one scope's keys, oldest first.
///
/// Earlier generations are retained so that ciphertexts created under them
/// (for example old graph links) remain readable after rotation.
///
/// A generation can hold more than one keyset: peers on both sides of a
/// partition may each rotate to the same generation number, and until the
/// conflict is resolved both variants are needed to read both branches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keyring {
    scope: KeyScope,
    generations: BTreeMap<u32, Vec<KeysetWithSecrets>>,
}

impl Keyring {
    /// Start a keyring from its first known keyset.
    pub fn new(keys: KeysetWithSecrets) -> Self {
        let scope = keys.scope.clone();
        let mut generations = BTreeMap::new();
        generations.insert(keys.generation, vec![keys]);

        Self { scope, generations }
    }

    pub fn scope(&self) -> &KeyScope {
        &self.scope
    }

    /// The most recent generation's keys.
    ///
    /// When a generation holds conflicting variants, the first one learned
    /// is returned; callers which append new material rebuild their rings
    /// from resolved state, where each generation is unique.
    pub fn latest(&self) -> &KeysetWithSecrets {
        self.generations
            .values()
            .next_back()
            .and_then(|variants| variants.first())
            // A keyring is constructed from a first keyset and only grows.
            .expect("keyring contains at least one generation")
    }

    /// The most recent generation number.
    pub fn generation(&self) -> u32 {
        self.latest().generation
    }

    /// First known keys of a specific generation, if any.
    pub fn get(&self, generation: u32) -> Option<&KeysetWithSecrets> {
        self.generations
            .get(&generation)
            .and_then(|variants| variants.first())
    }

    /// All known keys of a specific generation.
    pub fn get_all(&self, generation: u32) -> &[KeysetWithSecrets] {
        self.generations
            .get(&generation)
            .map(|variants| variants.as_slice())
            .unwrap_or(&[])
    }

    /// Add a keyset to the ring.
    ///
    /// Returns `true` if the keyset was new. Re-inserting a known keyset is
    /// a no-op; a divergent keyset for a known generation is kept as an
    /// additional variant.
    pub fn insert(&mut self, keys: KeysetWithSecrets) -> Result<bool, KeyringError> {
        if keys.scope != self.scope {
            return Err(KeyringError::ScopeMismatch(keys.scope, self.scope.clone()));
        }

        let variants = self.generations.entry(keys.generation).or_default();
        if variants
            .iter()
            .any(|known| known.public() == keys.public())
        {
            return Ok(false);
        }

        variants.push(keys);
        Ok(true)
    }

    /// All keysets in the ring, oldest generation first.
    pub fn iter(&self) -> impl Iterator<Item = &KeysetWithSecrets> {
        self.generations.values().flatten()
    }
}

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("keyset for scope {0} does not belong in keyring for scope {1}")]
    ScopeMismatch(KeyScope, KeyScope),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::keyset::{KeyScope, KeysetWithSecrets};

    use super::Keyring;

    #[test]
    fn latest_tracks_rotations() {
        let rng = Rng::from_seed([1; 32]);

        let keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let mut keyring = Keyring::new(keys.clone());

        assert_eq!(keyring.generation(), 0);

        let rotated = keys.rotate(&rng).unwrap();
        assert!(keyring.insert(rotated).unwrap());

        assert_eq!(keyring.generation(), 1);
        assert!(keyring.get(0).is_some());
        assert!(keyring.get(1).is_some());
        assert!(keyring.get(2).is_none());
    }

    #[test]
    fn rejects_foreign_scope() {
        let rng = Rng::from_seed([2; 32]);

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let role_keys = KeysetWithSecrets::generate(KeyScope::role("admin"), &rng).unwrap();

        let mut keyring = Keyring::new(team_keys);
        assert!(keyring.insert(role_keys).is_err());
    }

    #[test]
    fn divergent_generations_accumulate_variants() {
        let rng = Rng::from_seed([3; 32]);

        let keys = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        let mut keyring = Keyring::new(keys.clone());

        // Re-inserting the same keyset changes nothing.
        assert!(!keyring.insert(keys.clone()).unwrap());
        assert_eq!(keyring.get_all(0).len(), 1);

        // Two partitioned admins both rotated to the same generation; both
        // variants are retained so both branches stay readable.
        let divergent = KeysetWithSecrets::generate(KeyScope::team(), &rng).unwrap();
        assert!(keyring.insert(divergent).unwrap());
        assert_eq!(keyring.get_all(0).len(), 2);

        // The first learned variant stays the primary one.
        assert_eq!(
            keyring.get(0).unwrap().public().signing,
            keys.public().signing
        );
    }
}

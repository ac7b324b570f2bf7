// SPDX-License-Identifier: MIT OR Apache-2.0

//! Read-only queries over a team state.
//!
//! Includes identity lookups for the connection protocol, the lockbox
//! visibility closure and decryption of the local keyring cache.
use std::collections::{HashMap, HashSet, VecDeque};

use huddle_encryption::{KeyScope, Keyring, KeysetWithSecrets, Lockbox};
use thiserror::Error;

use crate::state::{Device, Member, TeamState};

/// Outcome kinds of an identity lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("member is not known to the team")]
    MemberUnknown,

    #[error("member was removed from the team")]
    MemberRemoved,

    #[error("device is not known to the team")]
    DeviceUnknown,

    #[error("device was removed from the team")]
    DeviceRemoved,
}

/// Find an active device by its qualified id.
///
/// This is how a connection decides whether an identity claim names a
/// legitimate peer.
pub fn lookup_device<'a>(
    state: &'a TeamState,
    device_id: &str,
) -> Result<&'a Device, IdentityError> {
    let Some((user_id, _)) = device_id.split_once("::") else {
        return Err(IdentityError::DeviceUnknown);
    };

    let member = match state.member(user_id) {
        Some(member) => member,
        None => {
            return if member_was_removed(state, user_id) {
                Err(IdentityError::MemberRemoved)
            } else {
                Err(IdentityError::MemberUnknown)
            };
        }
    };

    match member.device(device_id) {
        Some(device) => Ok(device),
        None => {
            if device_was_removed(state, device_id) {
                Err(IdentityError::DeviceRemoved)
            } else {
                Err(IdentityError::DeviceUnknown)
            }
        }
    }
}

pub fn has_member(state: &TeamState, user_id: &str) -> bool {
    state.member(user_id).is_some()
}

pub fn member_was_removed(state: &TeamState, user_id: &str) -> bool {
    state
        .removed_members
        .iter()
        .any(|member| member.user_id == user_id)
}

pub fn device_was_removed(state: &TeamState, device_id: &str) -> bool {
    state
        .removed_devices
        .iter()
        .any(|device| device.device_id() == device_id)
}

pub fn member_is_admin(state: &TeamState, user_id: &str) -> bool {
    state
        .member(user_id)
        .map(|member| member.is_admin())
        .unwrap_or(false)
}

pub fn member_has_role(state: &TeamState, user_id: &str, role_name: &str) -> bool {
    state
        .member(user_id)
        .map(|member| member.has_role(role_name))
        .unwrap_or(false)
}

/// Members holding the given role.
pub fn members_in_role<'a>(state: &'a TeamState, role_name: &str) -> Vec<&'a Member> {
    state
        .members
        .iter()
        .filter(|member| member.has_role(role_name))
        .collect()
}

/// All scopes reachable from `from` by following lockbox edges.
///
/// Scope A sees scope B when a chain of lockboxes leads from A to B; this
/// closure is what decides which keys must rotate when A is compromised.
pub fn visible_scopes(state: &TeamState, from: &KeyScope) -> Vec<KeyScope> {
    let mut seen: HashSet<KeyScope> = HashSet::new();
    let mut queue: VecDeque<KeyScope> = VecDeque::new();
    queue.push_back(from.clone());

    let mut visible = Vec::new();

    while let Some(scope) = queue.pop_front() {
        for lockbox in &state.lockboxes {
            if lockbox.recipient.scope != scope {
                continue;
            }

            let contents = lockbox.contents.scope.clone();
            if contents != *from && seen.insert(contents.clone()) {
                visible.push(contents.clone());
                queue.push_back(contents);
            }
        }
    }

    visible
}

/// Lockboxes whose recipient is the given scope.
pub fn lockboxes_for<'a>(state: &'a TeamState, recipient: &KeyScope) -> Vec<&'a Lockbox> {
    state
        .lockboxes
        .iter()
        .filter(|lockbox| lockbox.recipient.scope == *recipient)
        .collect()
}

/// Every keyring the holder of the given secrets can reach.
///
/// Built by opening lockboxes transitively: device secrets unlock the user
/// keys, user keys unlock role and team keys, admin keys unlock the other
/// role keys. All generations are collected so historic material stays
/// readable.
#[derive(Clone, Debug, Default)]
pub struct KeyCache {
    rings: HashMap<KeyScope, Keyring>,
}

impl KeyCache {
    /// Seed the cache with secrets held directly, outside any lockbox.
    pub fn seed(own_keys: impl IntoIterator<Item = KeysetWithSecrets>) -> Self {
        let mut cache = Self::default();
        for keys in own_keys {
            cache.insert(keys);
        }
        cache
    }

    /// Add a keyset, returning `true` if it was new.
    pub fn insert(&mut self, keys: KeysetWithSecrets) -> bool {
        match self.rings.get_mut(&keys.scope) {
            // Scope equality is guaranteed by the map key.
            Some(ring) => ring.insert(keys).unwrap_or(false),
            None => {
                self.rings.insert(keys.scope.clone(), Keyring::new(keys));
                true
            }
        }
    }

    pub fn keyring(&self, scope: &KeyScope) -> Option<&Keyring> {
        self.rings.get(scope)
    }

    /// Latest keys for a scope, if we can read them.
    pub fn latest(&self, scope: &KeyScope) -> Option<&KeysetWithSecrets> {
        self.rings.get(scope).map(|ring| ring.latest())
    }

    pub fn scopes(&self) -> impl Iterator<Item = &KeyScope> {
        self.rings.keys()
    }

    /// Open every lockbox in the state that any held key can unlock, until
    /// nothing new is learned.
    pub fn absorb(&mut self, lockboxes: &[Lockbox]) {
        loop {
            let mut learned = false;

            for lockbox in lockboxes {
                let recipient_keys: Vec<_> = match self.rings.get(&lockbox.recipient.scope) {
                    Some(ring) => ring
                        .get_all(lockbox.recipient.generation)
                        .iter()
                        .map(|keys| keys.encryption.clone())
                        .collect(),
                    None => continue,
                };

                for recipient in &recipient_keys {
                    if let Ok(contents) = lockbox.open(recipient) {
                        learned |= self.insert(contents);
                        break;
                    }
                }
            }

            if !learned {
                break;
            }
        }
    }
}

/// Decrypt everything the given device (and user) secrets can reach in the
/// state's lockboxes.
pub fn decrypt_keys(
    state: &TeamState,
    own_keys: impl IntoIterator<Item = KeysetWithSecrets>,
) -> KeyCache {
    let mut cache = KeyCache::seed(own_keys);
    cache.absorb(&state.lockboxes);
    cache
}

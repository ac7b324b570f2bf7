// SPDX-License-Identifier: MIT OR Apache-2.0

//! Team state derived from the link graph.
//!
//! None of this is ever persisted: any peer can rebuild the exact same
//! state from the same set of links.
use std::collections::BTreeMap;

use huddle_core::identity::PublicKey as SigningPublicKey;
use huddle_core::Hash;
use huddle_encryption::crypto::x25519;
use huddle_encryption::{Keyset, Lockbox};
use serde::{Deserialize, Serialize};

/// Name of the built-in administrator role.
pub const ADMIN: &str = "admin";

/// A user who belongs to the team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub user_name: String,

    /// Public keys of the member's user scope, at their latest generation.
    pub keys: Keyset,

    /// Devices the member has enrolled.
    pub devices: Vec<Device>,

    /// Names of the roles the member holds.
    pub roles: Vec<String>,
}

impl Member {
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN)
    }

    pub fn has_role(&self, role_name: &str) -> bool {
        self.roles.iter().any(|role| role == role_name)
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|device| device.device_id() == device_id)
    }
}

/// A device enrolled by a member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub user_id: String,
    pub device_name: String,

    /// Public keys of the device scope, at their latest generation.
    pub keys: Keyset,
}

impl Device {
    /// Devices are identified by their owner and name together, so two
    /// users can both own a device called "laptop".
    pub fn device_id(&self) -> String {
        format!("{}::{}", self.user_id, self.device_name)
    }
}

/// A named role members can hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub role_name: String,
    pub permissions: Vec<String>,
}

impl Role {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            permissions: Vec::new(),
        }
    }
}

/// A non-member peer trusted to relay and store team data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub keys: Keyset,
}

/// An open invitation to join the team or to enroll a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    /// Short identifier derived from the invitation public key.
    pub id: String,

    /// Signing key derived from the invitation seed; proofs are verified
    /// against it.
    pub public_key: SigningPublicKey,

    /// Encryption key derived from the invitation seed; the team keyring is
    /// sealed to it when the invitee is let in.
    pub encryption_key: x25519::PublicKey,

    /// Unix time in milliseconds after which the invitation is dead.
    /// Zero means no expiration.
    pub expiration: u64,

    /// How many admissions this invitation allows.
    pub max_uses: u32,

    /// How many admissions have been recorded so far.
    pub uses: u32,

    pub revoked: bool,

    /// For device invitations: the member the new device must belong to.
    pub user_id: Option<String>,
}

/// Everything the team knows, derived by reducing the link graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    pub team_name: String,

    pub members: Vec<Member>,
    pub roles: Vec<Role>,
    pub servers: Vec<Server>,

    /// Every lockbox ever attached to an applied link. Superseded
    /// generations are kept for historic lookbacks.
    pub lockboxes: Vec<Lockbox>,

    pub invitations: BTreeMap<String, Invitation>,

    pub removed_members: Vec<Member>,
    pub removed_devices: Vec<Device>,
    pub removed_servers: Vec<Server>,

    /// Users whose visible keys still await rotation. Populated when a
    /// removal link arrives without replacement lockboxes attached.
    pub pending_key_rotations: Vec<String>,

    /// Graph heads this state was reduced at.
    pub head: Vec<Hash>,
}

impl TeamState {
    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.user_id == user_id)
    }

    pub(crate) fn member_mut(&mut self, user_id: &str) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|member| member.user_id == user_id)
    }

    pub fn role(&self, role_name: &str) -> Option<&Role> {
        self.roles.iter().find(|role| role.role_name == role_name)
    }

    pub fn server(&self, host: &str) -> Option<&Server> {
        self.servers.iter().find(|server| server.host == host)
    }

    /// Number of active members holding the admin role.
    pub fn admin_count(&self) -> usize {
        self.members.iter().filter(|member| member.is_admin()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, Member, Role, ADMIN};
    use huddle_encryption::{KeyScope, KeysetWithSecrets, Rng};

    fn member(user_id: &str, roles: &[&str]) -> Member {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeysetWithSecrets::generate(KeyScope::user(user_id), &rng).unwrap();

        Member {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            keys: keys.public(),
            devices: Vec::new(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
        }
    }

    #[test]
    fn member_roles() {
        let alice = member("alice", &[ADMIN, "ops"]);
        let bob = member("bob", &[]);

        assert!(alice.is_admin());
        assert!(alice.has_role("ops"));
        assert!(!bob.is_admin());
    }

    #[test]
    fn device_ids_are_qualified() {
        let rng = Rng::from_seed([2; 32]);
        let keys =
            KeysetWithSecrets::generate(KeyScope::device("alice::laptop"), &rng).unwrap();

        let device = Device {
            user_id: "alice".to_string(),
            device_name: "laptop".to_string(),
            keys: keys.public(),
        };

        assert_eq!(device.device_id(), "alice::laptop");
    }

    #[test]
    fn role_without_permissions() {
        let role = Role::new("ops");
        assert!(role.permissions.is_empty());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! The high-level team façade.
//!
//! A `Team` owns one link graph and the state derived from it. Every public
//! operation builds a [`TeamAction`], signs and encrypts it into a link,
//! appends it, re-reduces and notifies listeners. Merging absorbs links
//! produced elsewhere and converges on the same state as every other peer
//! holding the same link set.
use std::collections::BTreeMap;
use std::fmt;

use huddle_core::identity::{PrivateKey, Signature};
use huddle_core::Hash;
use huddle_encryption::crypto::aead;
use huddle_encryption::crypto::x25519;
use huddle_encryption::{
    KeyScope, Keyring, KeysetRef, KeysetWithSecrets, Lockbox, Rng, ScopeType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::action::TeamAction;
use crate::graph::{GraphError, TeamGraph};
use crate::invitation::{self, InvitationError, InvitationProof};
use crate::link::{EncryptedLink, LinkBody, LinkError};
use crate::reducer;
use crate::resolver::{self, Resolution};
use crate::selectors::{self, IdentityError, KeyCache};
use crate::state::{Device, Invitation, Member, Role, Server, TeamState, ADMIN};

/// Info string for application payload encryption under the team scope.
const PAYLOAD_KEY_INFO: &[u8] = b"huddle-app-payload-v1";

/// The local user with their secret keys.
#[derive(Clone, Debug)]
pub struct LocalUser {
    pub user_id: String,
    pub user_name: String,
    pub keys: KeysetWithSecrets,
}

/// The local device with its secret keys.
#[derive(Clone, Debug)]
pub struct LocalDevice {
    pub user_id: String,
    pub device_name: String,
    pub keys: KeysetWithSecrets,
}

impl LocalDevice {
    pub fn device_id(&self) -> String {
        format!("{}::{}", self.user_id, self.device_name)
    }

    /// Public half, as recorded in the team state.
    pub fn public(&self) -> Device {
        Device {
            user_id: self.user_id.clone(),
            device_name: self.device_name.clone(),
            keys: self.keys.public(),
        }
    }
}

/// A server principal with its secret keys.
#[derive(Clone, Debug)]
pub struct LocalServer {
    pub host: String,
    pub keys: KeysetWithSecrets,
}

/// Who is operating this team instance.
#[derive(Clone, Debug)]
pub enum LocalContext {
    Member { user: LocalUser, device: LocalDevice },
    Server(LocalServer),
}

impl LocalContext {
    pub fn member(user: LocalUser, device: LocalDevice) -> Self {
        Self::Member { user, device }
    }

    pub fn server(server: LocalServer) -> Self {
        Self::Server(server)
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server(_))
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Member { user, .. } => &user.user_id,
            Self::Server(server) => &server.host,
        }
    }

    pub fn device_id(&self) -> String {
        match self {
            Self::Member { device, .. } => device.device_id(),
            Self::Server(server) => server.host.clone(),
        }
    }

    /// Key which signs this context's links and identity proofs.
    pub fn signing_key(&self) -> &PrivateKey {
        match self {
            Self::Member { device, .. } => &device.keys.signing,
            Self::Server(server) => &server.keys.signing,
        }
    }

    /// Key which opens sealed boxes addressed to this context's device.
    pub fn encryption_key(&self) -> &x25519::SecretKey {
        match self {
            Self::Member { device, .. } => &device.keys.encryption,
            Self::Server(server) => &server.keys.encryption,
        }
    }

    /// Secrets held directly, outside any lockbox.
    fn own_keysets(&self) -> Vec<KeysetWithSecrets> {
        match self {
            Self::Member { user, device } => vec![user.keys.clone(), device.keys.clone()],
            Self::Server(server) => vec![server.keys.clone()],
        }
    }
}

/// Notifications emitted at dispatch boundaries.
#[derive(Clone, Debug, PartialEq)]
pub enum TeamEvent {
    Updated { head: Vec<Hash> },
}

/// Application payload encrypted under a team keyset generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub generation: u32,
}

/// Arbitrary payload signed by a member's device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: Signature,
    pub device_id: String,
}

type Listener = Box<dyn FnMut(&TeamEvent)>;

/// A team: one graph, its derived state and the local secrets to act in it.
pub struct Team {
    graph: TeamGraph,
    state: TeamState,
    resolution: Resolution,
    context: LocalContext,

    /// Keys proven valid by the resolved state; used for appending and for
    /// answering key queries.
    keys: KeyCache,

    /// Every key ever harvested from any link, including branches later
    /// discarded by the resolver; used only to decrypt incoming links.
    all_keys: KeyCache,

    rng: Rng,
    clock: fn() -> u64,
    listeners: Vec<Listener>,
}

impl fmt::Debug for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Team")
            .field("team_name", &self.state.team_name)
            .field("user_id", &self.context.user_id())
            .field("links", &self.graph.len())
            .finish()
    }
}

fn system_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl Team {
    /// Found a new team. The local user becomes the first member and admin.
    pub fn create(
        team_name: &str,
        context: LocalContext,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let LocalContext::Member { user, device } = &context else {
            return Err(TeamError::CannotJoinOnServer);
        };

        let team_keys = KeysetWithSecrets::generate(KeyScope::team(), &rng)?;
        let admin_keys = KeysetWithSecrets::generate(KeyScope::role(ADMIN), &rng)?;

        let lockboxes = vec![
            Lockbox::create(&team_keys, &user.keys.public(), &rng)?,
            Lockbox::create(&admin_keys, &user.keys.public(), &rng)?,
            Lockbox::create(&user.keys, &device.keys.public(), &rng)?,
        ];

        let founder = Member {
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            keys: user.keys.public(),
            devices: vec![device.public()],
            roles: vec![ADMIN.to_string()],
        };

        let clock = system_now_ms;
        let body = LinkBody {
            action: TeamAction::Root {
                team_name: team_name.to_string(),
                founder,
            },
            user_id: user.user_id.clone(),
            device_id: device.device_id(),
            timestamp: clock(),
            prev: Vec::new(),
            lockboxes,
        };

        let graph = TeamGraph::create(body, &team_keys, context.signing_key(), &rng)?;

        let mut team = Self {
            graph,
            state: TeamState::default(),
            resolution: Resolution::default(),
            keys: KeyCache::default(),
            all_keys: KeyCache::seed(context.own_keysets()),
            context,
            rng,
            clock,
            listeners: Vec::new(),
        };
        team.refresh();

        Ok(team)
    }

    /// Rebuild a team from its serialized graph and the team keyring.
    pub fn load(
        bytes: &[u8],
        context: LocalContext,
        keyring: Keyring,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let graph = TeamGraph::load(bytes, &keyring)?;

        let mut all_keys = KeyCache::seed(context.own_keysets());
        for keys in keyring.iter() {
            all_keys.insert(keys.clone());
        }

        let mut team = Self {
            graph,
            state: TeamState::default(),
            resolution: Resolution::default(),
            keys: KeyCache::default(),
            all_keys,
            context,
            rng,
            clock: system_now_ms,
            listeners: Vec::new(),
        };
        team.refresh();

        Ok(team)
    }

    /// Join a team after being admitted: load the graph and enroll the
    /// local device.
    pub fn join(
        bytes: &[u8],
        context: LocalContext,
        keyring: Keyring,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let LocalContext::Member { user, device } = &context else {
            return Err(TeamError::CannotJoinOnServer);
        };
        let user_keys = user.keys.clone();
        let device = device.public();

        let mut team = Self::load(bytes, context, keyring, rng)?;

        if team.state.member(team.context.user_id()).is_none() {
            return Err(TeamError::NotMember);
        }

        let lockboxes = vec![Lockbox::create(&user_keys, &device.keys, &team.rng)?];
        team.dispatch(TeamAction::AddDevice { device }, lockboxes)?;

        Ok(team)
    }

    /// Serialize the graph for storage or transfer.
    pub fn save(&self) -> Result<Vec<u8>, TeamError> {
        Ok(self.graph.save()?)
    }

    /// Absorb links from another replica.
    ///
    /// Links whose key generation is not yet known are returned for a
    /// later attempt (their key travels in a lockbox of a link we may not
    /// have seen yet). A link whose generation is known but fails to
    /// decrypt is a fatal graph-integrity error.
    pub fn merge(
        &mut self,
        links: Vec<EncryptedLink>,
    ) -> Result<Vec<EncryptedLink>, TeamError> {
        let mut pending = links;
        let mut changed = false;

        loop {
            let mut progressed = false;
            let mut remaining = Vec::new();

            for encrypted in pending {
                let hash = encrypted.hash();
                if self.graph.contains(&hash) {
                    continue;
                }

                let ring = self
                    .all_keys
                    .keyring(&KeyScope::team())
                    .ok_or(TeamError::KeysUnavailable(KeyScope::team()))?;

                let link = match encrypted.open(ring) {
                    Ok(link) => link,
                    Err(LinkError::UnknownGeneration(..)) => {
                        // The generation's key may ride in a link we have
                        // not processed yet.
                        remaining.push(encrypted);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

                if !link.body.prev.iter().all(|prev| self.graph.contains(prev)) {
                    remaining.push(encrypted);
                    continue;
                }

                // Harvest keys before resolution: links of a losing branch
                // still need their material to be readable.
                self.all_keys.absorb(&link.body.lockboxes);
                self.graph.insert(encrypted, link)?;
                progressed = true;
                changed = true;
            }

            pending = remaining;
            if !progressed {
                break;
            }
        }

        if changed {
            self.refresh();
            self.rotate_pending()?;
        }

        Ok(pending)
    }

    /// All sealed links of the local graph.
    pub fn encrypted_links(&self) -> Vec<EncryptedLink> {
        self.graph.encrypted_links()
    }

    // ------------------------------------------------------------------
    // Membership operations.
    // ------------------------------------------------------------------

    /// Add a member directly (out-of-band key exchange); grants access to
    /// the team keys and any role keys named in the member record.
    pub fn add(&mut self, member: Member) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let mut lockboxes = vec![Lockbox::create(
            self.team_keys()?,
            &member.keys,
            &self.rng,
        )?];
        for role_name in &member.roles {
            let role_keys = self
                .keys
                .latest(&KeyScope::role(role_name))
                .ok_or_else(|| TeamError::KeysUnavailable(KeyScope::role(role_name)))?;
            lockboxes.push(Lockbox::create(role_keys, &member.keys, &self.rng)?);
        }

        self.dispatch(TeamAction::AddMember { member }, lockboxes)
    }

    /// Remove a member and rotate every key they could read.
    pub fn remove(&mut self, user_id: &str) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let member = self
            .state
            .member(user_id)
            .ok_or_else(|| TeamError::MemberUnknown(user_id.to_string()))?;

        if member.is_admin() && self.state.admin_count() == 1 {
            return Err(TeamError::CannotRemoveLastAdmin);
        }

        let lockboxes = self.rotation_lockboxes(&KeyScope::user(user_id), Some(user_id))?;

        self.dispatch(
            TeamAction::RemoveMember {
                user_id: user_id.to_string(),
            },
            lockboxes,
        )
    }

    // ------------------------------------------------------------------
    // Roles.
    // ------------------------------------------------------------------

    /// Create a role with fresh keys, readable by the admins.
    pub fn add_role(&mut self, role: Role) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let role_keys =
            KeysetWithSecrets::generate(KeyScope::role(&role.role_name), &self.rng)?;
        let admin_keys = self.admin_keys()?.public();
        let lockboxes = vec![Lockbox::create(&role_keys, &admin_keys, &self.rng)?];

        self.dispatch(TeamAction::AddRole { role }, lockboxes)
    }

    pub fn remove_role(&mut self, role_name: &str) -> Result<Hash, TeamError> {
        self.require_admin()?;

        if self.state.role(role_name).is_none() {
            return Err(TeamError::RoleUnknown(role_name.to_string()));
        }

        self.dispatch(
            TeamAction::RemoveRole {
                role_name: role_name.to_string(),
            },
            Vec::new(),
        )
    }

    /// Grant a role to a member, delivering the role keys to them.
    pub fn add_member_role(&mut self, user_id: &str, role_name: &str) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let member = self
            .state
            .member(user_id)
            .ok_or_else(|| TeamError::MemberUnknown(user_id.to_string()))?;
        let role_keys = self
            .keys
            .latest(&KeyScope::role(role_name))
            .ok_or_else(|| TeamError::KeysUnavailable(KeyScope::role(role_name)))?;

        let lockboxes = vec![Lockbox::create(role_keys, &member.keys, &self.rng)?];

        self.dispatch(
            TeamAction::AddMemberRole {
                user_id: user_id.to_string(),
                role_name: role_name.to_string(),
            },
            lockboxes,
        )
    }

    /// Revoke a role from a member and rotate the keys the role could read.
    pub fn remove_member_role(
        &mut self,
        user_id: &str,
        role_name: &str,
    ) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let member = self
            .state
            .member(user_id)
            .ok_or_else(|| TeamError::MemberUnknown(user_id.to_string()))?;
        if role_name == ADMIN && member.is_admin() && self.state.admin_count() == 1 {
            return Err(TeamError::CannotRemoveLastAdmin);
        }

        let lockboxes =
            self.rotation_lockboxes(&KeyScope::role(role_name), Some(user_id))?;

        self.dispatch(
            TeamAction::RemoveMemberRole {
                user_id: user_id.to_string(),
                role_name: role_name.to_string(),
            },
            lockboxes,
        )
    }

    // ------------------------------------------------------------------
    // Devices.
    // ------------------------------------------------------------------

    /// Enroll one of the local user's devices.
    pub fn add_device(&mut self, device: Device) -> Result<Hash, TeamError> {
        let LocalContext::Member { user, .. } = &self.context else {
            return Err(TeamError::NotMember);
        };
        let lockboxes = vec![Lockbox::create(&user.keys, &device.keys, &self.rng)?];

        self.dispatch(TeamAction::AddDevice { device }, lockboxes)
    }

    /// Remove a device and rotate the team-level keys it could read.
    pub fn remove_device(&mut self, device_id: &str) -> Result<Hash, TeamError> {
        let device = selectors::lookup_device(&self.state, device_id)?.clone();

        if device.user_id != self.context.user_id() {
            self.require_admin()?;
        }

        let lockboxes =
            self.rotation_lockboxes(&KeyScope::device(device_id), None)?;

        self.dispatch(
            TeamAction::RemoveDevice {
                device_id: device_id.to_string(),
            },
            lockboxes,
        )
    }

    // ------------------------------------------------------------------
    // Servers.
    // ------------------------------------------------------------------

    pub fn add_server(&mut self, server: Server) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let lockboxes = vec![Lockbox::create(
            self.team_keys()?,
            &server.keys,
            &self.rng,
        )?];

        self.dispatch(TeamAction::AddServer { server }, lockboxes)
    }

    pub fn remove_server(&mut self, host: &str) -> Result<Hash, TeamError> {
        self.require_admin()?;

        if self.state.server(host).is_none() {
            return Err(TeamError::ServerUnknown(host.to_string()));
        }

        let lockboxes = self.rotation_lockboxes(&KeyScope::server(host), None)?;

        self.dispatch(
            TeamAction::RemoveServer {
                host: host.to_string(),
            },
            lockboxes,
        )
    }

    // ------------------------------------------------------------------
    // Invitations.
    // ------------------------------------------------------------------

    /// Invite a new member with a shared seed. Returns the invitation id
    /// and the normalized seed to hand to the invitee.
    pub fn invite_member(
        &mut self,
        seed: &str,
        expiration: u64,
        max_uses: u32,
    ) -> Result<(String, String), TeamError> {
        if self.context.is_server() {
            return Err(TeamError::CannotInviteOnServer);
        }
        self.require_admin()?;

        let invitation = invitation::create(seed, expiration, max_uses, None)?;
        let id = invitation.id.clone();

        self.dispatch(TeamAction::InviteMember { invitation }, Vec::new())?;

        Ok((id, invitation::normalize(seed)))
    }

    /// Invite another device of the local user.
    pub fn invite_device(
        &mut self,
        seed: &str,
        expiration: u64,
    ) -> Result<(String, String), TeamError> {
        if self.context.is_server() {
            return Err(TeamError::CannotInviteOnServer);
        }

        let invitation =
            invitation::create(seed, expiration, 1, Some(self.context.user_id().to_string()))?;
        let id = invitation.id.clone();

        self.dispatch(TeamAction::InviteDevice { invitation }, Vec::new())?;

        Ok((id, invitation::normalize(seed)))
    }

    pub fn revoke_invitation(&mut self, id: &str) -> Result<Hash, TeamError> {
        self.require_admin()?;

        if !self.state.invitations.contains_key(id) {
            return Err(TeamError::Invitation(InvitationError::Unknown));
        }

        self.dispatch(
            TeamAction::RevokeInvitation { id: id.to_string() },
            Vec::new(),
        )
    }

    /// Check an invitation proof against the current state.
    pub fn validate_invitation(&self, proof: &InvitationProof) -> Result<&Invitation, TeamError> {
        let invitation = self
            .state
            .invitations
            .get(&proof.id)
            .ok_or(TeamError::Invitation(InvitationError::Unknown))?;

        invitation::can_be_used(invitation, (self.clock)())?;
        invitation::validate(proof, invitation)?;

        Ok(invitation)
    }

    /// Let an invited user in: verify their proof and record their keys.
    pub fn admit_member(
        &mut self,
        proof: &InvitationProof,
        user_keys: huddle_encryption::Keyset,
        user_name: &str,
    ) -> Result<Hash, TeamError> {
        let invitation = self.validate_invitation(proof)?;
        if invitation.user_id.is_some() || user_keys.scope.scope_type != ScopeType::User {
            return Err(TeamError::Invitation(InvitationError::Invalid));
        }

        let id = proof.id.clone();
        let user_id = user_keys.scope.name.clone();

        let lockboxes = vec![Lockbox::create(self.team_keys()?, &user_keys, &self.rng)?];

        self.dispatch(
            TeamAction::AdmitMember {
                id,
                user_id,
                user_name: user_name.to_string(),
                user_keys,
            },
            lockboxes,
        )
    }

    /// Let another device of the local user in.
    pub fn admit_device(
        &mut self,
        proof: &InvitationProof,
        device: Device,
    ) -> Result<Hash, TeamError> {
        let invitation = self.validate_invitation(proof)?;
        if invitation.user_id.as_deref() != Some(self.context.user_id())
            || device.user_id != self.context.user_id()
        {
            return Err(TeamError::Invitation(InvitationError::Invalid));
        }

        let LocalContext::Member { user, .. } = &self.context else {
            return Err(TeamError::CannotJoinOnServer);
        };

        let id = proof.id.clone();
        let lockboxes = vec![Lockbox::create(&user.keys, &device.keys, &self.rng)?];

        self.dispatch(TeamAction::AdmitDevice { id, device }, lockboxes)
    }

    // ------------------------------------------------------------------
    // Keys.
    // ------------------------------------------------------------------

    /// Rotate the local user's keys to the next generation.
    pub fn change_keys(&mut self) -> Result<Hash, TeamError> {
        let LocalContext::Member { user, device } = &self.context else {
            return Err(TeamError::NotMember);
        };

        let next_user_keys = user.keys.rotate(&self.rng)?;
        let member = self
            .state
            .member(&user.user_id)
            .ok_or_else(|| TeamError::MemberUnknown(user.user_id.clone()))?
            .clone();

        // The new user keys go to every enrolled device; everything the
        // user could read is re-delivered to the new generation.
        let mut lockboxes = vec![Lockbox::create(
            &next_user_keys,
            &device.keys.public(),
            &self.rng,
        )?];
        for enrolled in &member.devices {
            if enrolled.device_id() != device.device_id() {
                lockboxes.push(Lockbox::create(&next_user_keys, &enrolled.keys, &self.rng)?);
            }
        }
        lockboxes.push(Lockbox::create(
            self.team_keys()?,
            &next_user_keys.public(),
            &self.rng,
        )?);
        for role_name in &member.roles {
            let role_keys = self
                .keys
                .latest(&KeyScope::role(role_name))
                .ok_or_else(|| TeamError::KeysUnavailable(KeyScope::role(role_name)))?;
            lockboxes.push(Lockbox::create(
                role_keys,
                &next_user_keys.public(),
                &self.rng,
            )?);
        }

        let public = next_user_keys.public();
        let hash = self.dispatch_with(
            TeamAction::ChangeMemberKeys { keys: public },
            lockboxes,
            |team| {
                if let LocalContext::Member { user, .. } = &mut team.context {
                    user.keys = next_user_keys;
                }
            },
        )?;

        Ok(hash)
    }

    /// Rotate the local device's keys to the next generation.
    pub fn change_device_keys(&mut self) -> Result<Hash, TeamError> {
        let LocalContext::Member { user, device } = &self.context else {
            return Err(TeamError::NotMember);
        };

        let next_device_keys = device.keys.rotate(&self.rng)?;
        let lockboxes = vec![Lockbox::create(
            &user.keys,
            &next_device_keys.public(),
            &self.rng,
        )?];

        let public = next_device_keys.public();
        self.dispatch_with(
            TeamAction::ChangeDeviceKeys { keys: public },
            lockboxes,
            |team| {
                if let LocalContext::Member { device, .. } = &mut team.context {
                    device.keys = next_device_keys;
                }
            },
        )
    }

    /// Rotate keys owed after removals merged from elsewhere.
    pub fn rotate_keys(&mut self, user_ids: Vec<String>) -> Result<Hash, TeamError> {
        self.require_admin()?;

        let mut lockboxes = Vec::new();
        for user_id in &user_ids {
            lockboxes.extend(self.rotation_lockboxes(&KeyScope::user(user_id), Some(user_id))?);
        }

        self.dispatch(TeamAction::RotateKeys { user_ids }, lockboxes)
    }

    /// If removals are waiting on a rotation and we are an admin, do it.
    fn rotate_pending(&mut self) -> Result<(), TeamError> {
        let pending = self.state.pending_key_rotations.clone();
        if pending.is_empty()
            || self.context.is_server()
            || !selectors::member_is_admin(&self.state, self.context.user_id())
        {
            return Ok(());
        }

        debug!(users = ?pending, "rotating keys owed from merged removals");
        self.rotate_keys(pending)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Payload crypto.
    // ------------------------------------------------------------------

    /// Encrypt an application payload for the team.
    pub fn encrypt(&self, payload: &[u8]) -> Result<EncryptedPayload, TeamError> {
        let team_keys = self.team_keys()?;
        let key = team_keys
            .derive_symmetric_key(PAYLOAD_KEY_INFO)
            .map_err(|_| TeamError::KeysUnavailable(KeyScope::team()))?;

        let generation = team_keys.generation;
        let ciphertext = aead::encrypt(payload, &key, &generation.to_be_bytes(), &self.rng)?;

        Ok(EncryptedPayload {
            ciphertext,
            generation,
        })
    }

    /// Decrypt an application payload with the recorded generation.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, TeamError> {
        let ring = self
            .keys
            .keyring(&KeyScope::team())
            .ok_or(TeamError::KeysUnavailable(KeyScope::team()))?;

        for team_keys in ring.get_all(payload.generation) {
            let key = team_keys
                .derive_symmetric_key(PAYLOAD_KEY_INFO)
                .map_err(|_| TeamError::KeysUnavailable(KeyScope::team()))?;

            if let Ok(plaintext) = aead::decrypt(
                &payload.ciphertext,
                &key,
                &payload.generation.to_be_bytes(),
            ) {
                return Ok(plaintext);
            }
        }

        Err(TeamError::DecryptionFailed)
    }

    /// Sign an arbitrary payload with the local device key.
    pub fn sign(&self, payload: &[u8]) -> SignedEnvelope {
        SignedEnvelope {
            payload: payload.to_vec(),
            signature: self.context.signing_key().sign(payload),
            device_id: self.context.device_id(),
        }
    }

    /// Verify a signed payload against the authoring device's known keys.
    pub fn verify(&self, envelope: &SignedEnvelope) -> Result<(), TeamError> {
        let device = selectors::lookup_device(&self.state, &envelope.device_id)?;

        if !device
            .keys
            .signing
            .verify(&envelope.payload, &envelope.signature)
        {
            return Err(TeamError::SignatureInvalid);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries.
    // ------------------------------------------------------------------

    pub fn team_name(&self) -> &str {
        &self.state.team_name
    }

    pub fn state(&self) -> &TeamState {
        &self.state
    }

    pub fn graph(&self) -> &TeamGraph {
        &self.graph
    }

    pub fn context(&self) -> &LocalContext {
        &self.context
    }

    pub fn members(&self) -> &[Member] {
        &self.state.members
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.state.member(user_id)
    }

    pub fn roles(&self) -> &[Role] {
        &self.state.roles
    }

    pub fn servers(&self) -> &[Server] {
        &self.state.servers
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        selectors::has_member(&self.state, user_id)
    }

    pub fn member_was_removed(&self, user_id: &str) -> bool {
        selectors::member_was_removed(&self.state, user_id)
    }

    pub fn member_is_admin(&self, user_id: &str) -> bool {
        selectors::member_is_admin(&self.state, user_id)
    }

    pub fn invitation(&self, id: &str) -> Option<&Invitation> {
        self.state.invitations.get(id)
    }

    /// Latest team keys readable by this context.
    pub fn team_keys(&self) -> Result<&KeysetWithSecrets, TeamError> {
        self.keys
            .latest(&KeyScope::team())
            .ok_or(TeamError::KeysUnavailable(KeyScope::team()))
    }

    /// Latest admin role keys readable by this context.
    pub fn admin_keys(&self) -> Result<&KeysetWithSecrets, TeamError> {
        self.keys
            .latest(&KeyScope::role(ADMIN))
            .ok_or(TeamError::KeysUnavailable(KeyScope::role(ADMIN)))
    }

    /// The team keyring with every generation and variant ever seen; this
    /// is what lets a peer decrypt the full graph.
    pub fn team_keyring(&self) -> Result<&Keyring, TeamError> {
        self.all_keys
            .keyring(&KeyScope::team())
            .ok_or(TeamError::KeysUnavailable(KeyScope::team()))
    }

    /// Register a listener for team events.
    pub fn subscribe(&mut self, listener: impl FnMut(&TeamEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Override the wall clock (tests and hosts with their own time
    /// source).
    pub fn set_clock(&mut self, clock: fn() -> u64) {
        self.clock = clock;
    }

    // ------------------------------------------------------------------
    // Internals.
    // ------------------------------------------------------------------

    fn require_admin(&self) -> Result<(), TeamError> {
        if !selectors::member_is_admin(&self.state, self.context.user_id()) {
            return Err(TeamError::NotAdmin);
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        action: TeamAction,
        lockboxes: Vec<Lockbox>,
    ) -> Result<Hash, TeamError> {
        self.dispatch_with(action, lockboxes, |_| {})
    }

    /// Append a link, run a post-append hook (key handover), re-reduce and
    /// notify.
    fn dispatch_with(
        &mut self,
        action: TeamAction,
        lockboxes: Vec<Lockbox>,
        after_append: impl FnOnce(&mut Self),
    ) -> Result<Hash, TeamError> {
        let team_keys = self.team_keys()?.clone();

        let body = LinkBody {
            action,
            user_id: self.context.user_id().to_string(),
            device_id: self.context.device_id(),
            timestamp: (self.clock)(),
            prev: Vec::new(),
            lockboxes,
        };

        let hash = self
            .graph
            .append(body, &team_keys, self.context.signing_key(), &self.rng)?;

        after_append(self);
        self.refresh();

        Ok(hash)
    }

    /// Re-resolve, re-reduce, refresh key caches and emit `updated`.
    fn refresh(&mut self) {
        self.resolution = resolver::resolve(&self.graph);
        self.state = reducer::reduce(&self.graph, &self.resolution);

        // The canonical cache only believes lockboxes that survived
        // resolution; the harvest cache believes everything.
        let mut keys = KeyCache::seed(self.context.own_keysets());
        keys.absorb(&self.state.lockboxes);
        self.keys = keys;
        self.all_keys.absorb(&self.state.lockboxes);

        self.emit(TeamEvent::Updated {
            head: self.state.head.clone(),
        });
    }

    fn emit(&mut self, event: TeamEvent) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            listener(&event);
        }
        listeners.extend(std::mem::take(&mut self.listeners));
        self.listeners = listeners;
    }

    /// Fresh keysets for everything visible from the compromised scope,
    /// delivered to everyone still entitled.
    ///
    /// Only team and role scopes rotate here: user and device scopes are
    /// rotated by their owners through `change_keys`.
    fn rotation_lockboxes(
        &self,
        compromised: &KeyScope,
        excluded_member: Option<&str>,
    ) -> Result<Vec<Lockbox>, TeamError> {
        let mut scopes: Vec<KeyScope> = selectors::visible_scopes(&self.state, compromised)
            .into_iter()
            .filter(|scope| matches!(scope.scope_type, ScopeType::Team | ScopeType::Role))
            .collect();
        if matches!(compromised.scope_type, ScopeType::Team | ScopeType::Role)
            && !scopes.contains(compromised)
        {
            scopes.push(compromised.clone());
        }

        // Rotate every affected scope first, then rebuild the grant edges
        // against the new generations. Sorted for deterministic output.
        let mut rotated: BTreeMap<KeyScope, KeysetWithSecrets> = BTreeMap::new();
        for scope in &scopes {
            let current = self
                .keys
                .latest(scope)
                .ok_or_else(|| TeamError::KeysUnavailable(scope.clone()))?;
            rotated.insert(scope.clone(), current.rotate(&self.rng)?);
        }

        let mut lockboxes = Vec::new();
        for (scope, keys) in &rotated {
            match scope.scope_type {
                ScopeType::Team => {
                    for member in &self.state.members {
                        if Some(member.user_id.as_str()) == excluded_member {
                            continue;
                        }
                        lockboxes.push(Lockbox::create(keys, &member.keys, &self.rng)?);
                    }
                    for server in &self.state.servers {
                        if compromised == &KeyScope::server(&server.host) {
                            continue;
                        }
                        lockboxes.push(Lockbox::create(keys, &server.keys, &self.rng)?);
                    }
                }
                ScopeType::Role => {
                    for member in &self.state.members {
                        if Some(member.user_id.as_str()) == excluded_member
                            || !member.has_role(&scope.name)
                        {
                            continue;
                        }
                        lockboxes.push(Lockbox::create(keys, &member.keys, &self.rng)?);
                    }

                    // Admins read every role; point the role at the admin
                    // keys, rotated or not.
                    if scope.name != ADMIN {
                        let admin_scope = KeyScope::role(ADMIN);
                        let admin_public = match rotated.get(&admin_scope) {
                            Some(keys) => keys.public(),
                            None => self
                                .keys
                                .latest(&admin_scope)
                                .ok_or(TeamError::KeysUnavailable(admin_scope))?
                                .public(),
                        };
                        lockboxes.push(Lockbox::create_for(
                            keys,
                            KeysetRef {
                                scope: admin_public.scope.clone(),
                                generation: admin_public.generation,
                            },
                            admin_public.encryption,
                            &self.rng,
                        )?);
                    }
                }
                _ => {}
            }
        }

        Ok(lockboxes)
    }
}

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("operation requires the admin role")]
    NotAdmin,

    #[error("cannot remove the team's last admin")]
    CannotRemoveLastAdmin,

    #[error("servers cannot create or accept invitations")]
    CannotInviteOnServer,

    #[error("servers cannot join a team as a member")]
    CannotJoinOnServer,

    #[error("local user is not a member of this team")]
    NotMember,

    #[error("member {0} is not known to the team")]
    MemberUnknown(String),

    #[error("role {0} is not known to the team")]
    RoleUnknown(String),

    #[error("server {0} is not known to the team")]
    ServerUnknown(String),

    #[error("no keys available for scope {0}")]
    KeysUnavailable(KeyScope),

    #[error("payload decryption failed")]
    DecryptionFailed,

    #[error("payload signature is invalid")]
    SignatureInvalid,

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Lockbox(#[from] huddle_encryption::LockboxError),

    #[error(transparent)]
    Keyset(#[from] huddle_encryption::KeysetError),

    #[error(transparent)]
    Rng(#[from] huddle_encryption::RngError),

    #[error(transparent)]
    Aead(#[from] aead::AeadError),
}

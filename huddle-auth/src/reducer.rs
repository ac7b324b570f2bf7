// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reducer: a pure fold from the resolved, ordered link sequence to a
//! [`TeamState`].
//!
//! Transforms are total and deterministic. A link which violates an
//! invariant (because a malicious or buggy peer produced it) is applied as
//! a no-op and logged; the fold never fails. Honest peers never hit these
//! paths because the same invariants are enforced at dispatch.
use thiserror::Error;
use tracing::warn;

use crate::action::TeamAction;
use crate::graph::TeamGraph;
use crate::link::Link;
use crate::resolver::Resolution;
use crate::state::{Member, Role, TeamState, ADMIN};
use huddle_encryption::{KeyScope, ScopeType};

/// Fold the resolved graph into a team state.
pub fn reduce(graph: &TeamGraph, resolution: &Resolution) -> TeamState {
    let mut state = TeamState::default();

    for link in graph.sorted(&resolution.ignored, &resolution.seniority_rank) {
        state = apply(state, link);
    }

    state.head = graph.heads();
    state
}

/// Apply a single link to the state, as a no-op if it is invalid.
pub fn apply(state: TeamState, link: &Link) -> TeamState {
    let mut next = state.clone();

    match transform(&mut next, link) {
        Ok(()) => {
            // Only applied links contribute their key envelopes.
            next.lockboxes.extend(link.body.lockboxes.iter().cloned());
            next
        }
        Err(reason) => {
            warn!(
                link = %link.hash,
                action = link.body.action.name(),
                author = %link.body.user_id,
                %reason,
                "ignoring invalid link"
            );
            state
        }
    }
}

fn transform(state: &mut TeamState, link: &Link) -> Result<(), TransformError> {
    let author_id = link.body.user_id.as_str();

    match &link.body.action {
        TeamAction::Root { team_name, founder } => {
            if !state.team_name.is_empty() || !link.is_root() {
                return Err(TransformError::RootAlreadyApplied);
            }

            state.team_name = team_name.clone();
            state.roles.push(Role::new(ADMIN));

            let mut founder = founder.clone();
            if !founder.is_admin() {
                founder.roles.push(ADMIN.to_string());
            }
            state.members.push(founder);

            Ok(())
        }

        TeamAction::AddMember { member } => {
            require_admin(state, author_id)?;

            // An already active member stays untouched.
            if state.member(&member.user_id).is_some() {
                return Ok(());
            }

            state
                .removed_members
                .retain(|removed| removed.user_id != member.user_id);
            state.members.push(member.clone());

            Ok(())
        }

        TeamAction::RemoveMember { user_id } => {
            require_admin(state, author_id)?;

            let index = state
                .members
                .iter()
                .position(|member| member.user_id == *user_id)
                .ok_or_else(|| TransformError::MemberUnknown(user_id.clone()))?;

            if state.members[index].is_admin() && state.admin_count() == 1 {
                return Err(TransformError::LastAdmin);
            }

            let mut member = state.members.remove(index);
            state.removed_devices.append(&mut member.devices);
            state.removed_members.push(member);

            note_pending_rotation(state, link, user_id);

            Ok(())
        }

        TeamAction::AddRole { role } => {
            require_admin(state, author_id)?;

            if state.role(&role.role_name).is_none() {
                state.roles.push(role.clone());
            }

            Ok(())
        }

        TeamAction::RemoveRole { role_name } => {
            require_admin(state, author_id)?;

            if role_name == ADMIN {
                return Err(TransformError::ProtectedRole);
            }
            if state.role(role_name).is_none() {
                return Err(TransformError::RoleUnknown(role_name.clone()));
            }

            state.roles.retain(|role| role.role_name != *role_name);
            for member in &mut state.members {
                member.roles.retain(|role| role != role_name);
            }

            Ok(())
        }

        TeamAction::AddMemberRole { user_id, role_name } => {
            require_admin(state, author_id)?;

            if state.role(role_name).is_none() {
                return Err(TransformError::RoleUnknown(role_name.clone()));
            }

            let member = state
                .member_mut(user_id)
                .ok_or_else(|| TransformError::MemberUnknown(user_id.clone()))?;

            if !member.has_role(role_name) {
                member.roles.push(role_name.clone());
            }

            Ok(())
        }

        TeamAction::RemoveMemberRole { user_id, role_name } => {
            require_admin(state, author_id)?;

            let is_last_admin = role_name == ADMIN
                && state
                    .member(user_id)
                    .map(|member| member.is_admin())
                    .unwrap_or(false)
                && state.admin_count() == 1;
            if is_last_admin {
                return Err(TransformError::LastAdmin);
            }

            let member = state
                .member_mut(user_id)
                .ok_or_else(|| TransformError::MemberUnknown(user_id.clone()))?;
            member.roles.retain(|role| role != role_name);

            Ok(())
        }

        TeamAction::AddDevice { device } => {
            require_member(state, author_id)?;

            // Members enroll their own devices only.
            if device.user_id != author_id {
                return Err(TransformError::NotOwner);
            }

            let device_id = device.device_id();
            let member = state
                .member_mut(author_id)
                .ok_or_else(|| TransformError::MemberUnknown(author_id.to_string()))?;

            if member
                .devices
                .iter()
                .all(|known| known.device_id() != device_id)
            {
                member.devices.push(device.clone());
            }

            Ok(())
        }

        TeamAction::RemoveDevice { device_id } => {
            require_member(state, author_id)?;

            let owner_id = device_id
                .split_once("::")
                .map(|(owner, _)| owner.to_string())
                .ok_or_else(|| TransformError::DeviceUnknown(device_id.clone()))?;

            if owner_id != author_id {
                require_admin(state, author_id)?;
            }

            let owner = state
                .member_mut(&owner_id)
                .ok_or_else(|| TransformError::MemberUnknown(owner_id.clone()))?;
            let index = owner
                .devices
                .iter()
                .position(|device| device.device_id() == *device_id)
                .ok_or_else(|| TransformError::DeviceUnknown(device_id.clone()))?;

            let device = owner.devices.remove(index);
            state.removed_devices.push(device);

            note_pending_rotation(state, link, &owner_id);

            Ok(())
        }

        TeamAction::InviteMember { invitation } => {
            require_admin(state, author_id)?;

            if invitation.user_id.is_some() {
                return Err(TransformError::InvitationMalformed(invitation.id.clone()));
            }

            state
                .invitations
                .entry(invitation.id.clone())
                .or_insert_with(|| invitation.clone());

            Ok(())
        }

        TeamAction::InviteDevice { invitation } => {
            require_member(state, author_id)?;

            // Device invitations are pinned to the inviting member and are
            // single-use.
            if invitation.user_id.as_deref() != Some(author_id) || invitation.max_uses != 1 {
                return Err(TransformError::InvitationMalformed(invitation.id.clone()));
            }

            state
                .invitations
                .entry(invitation.id.clone())
                .or_insert_with(|| invitation.clone());

            Ok(())
        }

        TeamAction::RevokeInvitation { id } => {
            require_admin(state, author_id)?;

            let invitation = state
                .invitations
                .get_mut(id)
                .ok_or_else(|| TransformError::InvitationUnknown(id.clone()))?;
            invitation.revoked = true;

            Ok(())
        }

        TeamAction::AdmitMember {
            id,
            user_id,
            user_name,
            user_keys,
        } => {
            require_member(state, author_id)?;
            consume_invitation(state, id, link.body.timestamp, None)?;

            if state.member(user_id).is_some() {
                return Ok(());
            }

            state
                .removed_members
                .retain(|removed| removed.user_id != *user_id);
            state.members.push(Member {
                user_id: user_id.clone(),
                user_name: user_name.clone(),
                keys: user_keys.clone(),
                devices: Vec::new(),
                roles: Vec::new(),
            });

            Ok(())
        }

        TeamAction::AdmitDevice { id, device } => {
            require_member(state, author_id)?;

            // Members admit their own devices only.
            if device.user_id != author_id {
                return Err(TransformError::NotOwner);
            }

            consume_invitation(state, id, link.body.timestamp, Some(&device.user_id))?;

            let device_id = device.device_id();
            let member = state
                .member_mut(&device.user_id)
                .ok_or_else(|| TransformError::MemberUnknown(device.user_id.clone()))?;

            if member
                .devices
                .iter()
                .all(|known| known.device_id() != device_id)
            {
                member.devices.push(device.clone());
            }

            Ok(())
        }

        TeamAction::ChangeMemberKeys { keys } => {
            require_member(state, author_id)?;

            if keys.scope != KeyScope::user(author_id) {
                return Err(TransformError::NotOwner);
            }

            let member = state
                .member_mut(author_id)
                .ok_or_else(|| TransformError::MemberUnknown(author_id.to_string()))?;
            if keys.generation <= member.keys.generation {
                return Err(TransformError::StaleGeneration);
            }
            member.keys = keys.clone();

            Ok(())
        }

        TeamAction::ChangeDeviceKeys { keys } => {
            require_member(state, author_id)?;

            if keys.scope.scope_type != ScopeType::Device
                || keys.scope.name != link.body.device_id
            {
                return Err(TransformError::NotOwner);
            }

            let member = state
                .member_mut(author_id)
                .ok_or_else(|| TransformError::MemberUnknown(author_id.to_string()))?;
            let device = member
                .devices
                .iter_mut()
                .find(|device| device.device_id() == link.body.device_id)
                .ok_or_else(|| TransformError::DeviceUnknown(link.body.device_id.clone()))?;

            if keys.generation <= device.keys.generation {
                return Err(TransformError::StaleGeneration);
            }
            device.keys = keys.clone();

            Ok(())
        }

        TeamAction::ChangeServerKeys { keys } => {
            require_admin(state, author_id)?;

            if keys.scope.scope_type != ScopeType::Server {
                return Err(TransformError::ServerUnknown(keys.scope.name.clone()));
            }

            let server = state
                .servers
                .iter_mut()
                .find(|server| server.host == keys.scope.name)
                .ok_or_else(|| TransformError::ServerUnknown(keys.scope.name.clone()))?;

            if keys.generation <= server.keys.generation {
                return Err(TransformError::StaleGeneration);
            }
            server.keys = keys.clone();

            Ok(())
        }

        TeamAction::AddServer { server } => {
            require_admin(state, author_id)?;

            if state.server(&server.host).is_none() {
                state.servers.push(server.clone());
            }

            Ok(())
        }

        TeamAction::RemoveServer { host } => {
            require_admin(state, author_id)?;

            let index = state
                .servers
                .iter()
                .position(|server| server.host == *host)
                .ok_or_else(|| TransformError::ServerUnknown(host.clone()))?;

            let server = state.servers.remove(index);
            state.removed_servers.push(server);

            Ok(())
        }

        TeamAction::RotateKeys { user_ids } => {
            require_admin(state, author_id)?;

            state
                .pending_key_rotations
                .retain(|pending| !user_ids.contains(pending));

            Ok(())
        }
    }
}

/// Record that a removal arrived without replacement keys, so an admin
/// still owes the team a rotation.
fn note_pending_rotation(state: &mut TeamState, link: &Link, user_id: &str) {
    let rotated = link
        .body
        .lockboxes
        .iter()
        .any(|lockbox| lockbox.contents.scope == KeyScope::team());

    if !rotated && !state.pending_key_rotations.iter().any(|id| id == user_id) {
        state.pending_key_rotations.push(user_id.to_string());
    }
}

fn require_member<'a>(
    state: &'a TeamState,
    user_id: &str,
) -> Result<&'a Member, TransformError> {
    state
        .member(user_id)
        .ok_or_else(|| TransformError::AuthorUnknown(user_id.to_string()))
}

fn require_admin<'a>(state: &'a TeamState, user_id: &str) -> Result<&'a Member, TransformError> {
    let member = require_member(state, user_id)?;
    if !member.is_admin() {
        return Err(TransformError::AuthorNotAdmin(user_id.to_string()));
    }
    Ok(member)
}

fn consume_invitation(
    state: &mut TeamState,
    id: &str,
    now: u64,
    expected_user: Option<&str>,
) -> Result<(), TransformError> {
    let invitation = state
        .invitations
        .get_mut(id)
        .ok_or_else(|| TransformError::InvitationUnknown(id.to_string()))?;

    if invitation.revoked {
        return Err(TransformError::InvitationUnusable(id.to_string()));
    }
    if invitation.max_uses > 0 && invitation.uses >= invitation.max_uses {
        return Err(TransformError::InvitationUnusable(id.to_string()));
    }
    if invitation.expiration > 0 && now >= invitation.expiration {
        return Err(TransformError::InvitationUnusable(id.to_string()));
    }
    if invitation.user_id.as_deref() != expected_user {
        return Err(TransformError::InvitationMalformed(id.to_string()));
    }

    invitation.uses += 1;

    Ok(())
}

#[derive(Debug, Error)]
enum TransformError {
    #[error("author {0} is not an active member")]
    AuthorUnknown(String),

    #[error("author {0} lacks the admin role")]
    AuthorNotAdmin(String),

    #[error("author does not own the target")]
    NotOwner,

    #[error("team already has a root link")]
    RootAlreadyApplied,

    #[error("member {0} is unknown")]
    MemberUnknown(String),

    #[error("device {0} is unknown")]
    DeviceUnknown(String),

    #[error("server {0} is unknown")]
    ServerUnknown(String),

    #[error("role {0} is unknown")]
    RoleUnknown(String),

    #[error("the admin role cannot be removed")]
    ProtectedRole,

    #[error("cannot remove the team's last admin")]
    LastAdmin,

    #[error("invitation {0} is unknown")]
    InvitationUnknown(String),

    #[error("invitation {0} cannot be used")]
    InvitationUnusable(String),

    #[error("invitation {0} is malformed")]
    InvitationMalformed(String),

    #[error("keyset generation must increase")]
    StaleGeneration,
}

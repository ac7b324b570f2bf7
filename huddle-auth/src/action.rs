// SPDX-License-Identifier: MIT OR Apache-2.0

//! Actions for creating teams and modifying membership, roles, devices,
//! servers, invitations and keys.
use huddle_encryption::Keyset;
use serde::{Deserialize, Serialize};

use crate::state::{Device, Invitation, Member, Role, Server};

/// One team-management action, recorded as the payload of a signed link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TeamAction {
    /// First link of every team graph; the author is the founder.
    Root { team_name: String, founder: Member },

    AddMember { member: Member },
    RemoveMember { user_id: String },

    AddRole { role: Role },
    RemoveRole { role_name: String },

    AddMemberRole { user_id: String, role_name: String },
    RemoveMemberRole { user_id: String, role_name: String },

    AddDevice { device: Device },
    RemoveDevice { device_id: String },

    InviteMember { invitation: Invitation },
    InviteDevice { invitation: Invitation },
    RevokeInvitation { id: String },

    AdmitMember {
        id: String,
        user_id: String,
        user_name: String,
        user_keys: Keyset,
    },
    AdmitDevice { id: String, device: Device },

    ChangeMemberKeys { keys: Keyset },
    ChangeDeviceKeys { keys: Keyset },
    ChangeServerKeys { keys: Keyset },

    AddServer { server: Server },
    RemoveServer { host: String },

    /// Install fresh key generations after a compromise; the replacement
    /// lockboxes ride on the same link.
    RotateKeys { user_ids: Vec<String> },
}

impl TeamAction {
    /// Short name used in log output.
    pub fn name(&self) -> &'static str {
        match self {
            TeamAction::Root { .. } => "root",
            TeamAction::AddMember { .. } => "add_member",
            TeamAction::RemoveMember { .. } => "remove_member",
            TeamAction::AddRole { .. } => "add_role",
            TeamAction::RemoveRole { .. } => "remove_role",
            TeamAction::AddMemberRole { .. } => "add_member_role",
            TeamAction::RemoveMemberRole { .. } => "remove_member_role",
            TeamAction::AddDevice { .. } => "add_device",
            TeamAction::RemoveDevice { .. } => "remove_device",
            TeamAction::InviteMember { .. } => "invite_member",
            TeamAction::InviteDevice { .. } => "invite_device",
            TeamAction::RevokeInvitation { .. } => "revoke_invitation",
            TeamAction::AdmitMember { .. } => "admit_member",
            TeamAction::AdmitDevice { .. } => "admit_device",
            TeamAction::ChangeMemberKeys { .. } => "change_member_keys",
            TeamAction::ChangeDeviceKeys { .. } => "change_device_keys",
            TeamAction::ChangeServerKeys { .. } => "change_server_keys",
            TeamAction::AddServer { .. } => "add_server",
            TeamAction::RemoveServer { .. } => "remove_server",
            TeamAction::RotateKeys { .. } => "rotate_keys",
        }
    }

    /// Return `true` if this is the root action.
    pub fn is_root(&self) -> bool {
        matches!(self, TeamAction::Root { .. })
    }

    /// Return `true` if applying this action requires the author to hold
    /// the admin role.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            TeamAction::AddMember { .. }
                | TeamAction::RemoveMember { .. }
                | TeamAction::AddRole { .. }
                | TeamAction::RemoveRole { .. }
                | TeamAction::AddMemberRole { .. }
                | TeamAction::RemoveMemberRole { .. }
                | TeamAction::InviteMember { .. }
                | TeamAction::RevokeInvitation { .. }
                | TeamAction::ChangeServerKeys { .. }
                | TeamAction::AddServer { .. }
                | TeamAction::RemoveServer { .. }
                | TeamAction::RotateKeys { .. }
        )
    }
}

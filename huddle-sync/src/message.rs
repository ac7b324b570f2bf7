// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages sent over the wire between two peers.
use std::fmt;

use huddle_auth::graph::ParentMap;
use huddle_auth::invitation::InvitationProof;
use huddle_auth::link::EncryptedLink;
use huddle_auth::state::Device;
use huddle_core::identity::Signature;
use huddle_core::Hash;
use huddle_encryption::crypto::x25519::SealedBox;
use huddle_encryption::Keyset;
use serde::{Deserialize, Serialize};

/// Error kinds carried in reject and disconnect messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInvitation,
    ExpiredInvitation,
    UsedInvitation,
    RevokedInvitation,
    MemberUnknown,
    MemberRemoved,
    DeviceUnknown,
    DeviceRemoved,
    IdentityProofInvalid,
    ChallengeStale,
    DecryptionFailed,
    SignatureInvalid,
    GraphCorrupt,
    NotAdmin,
    CannotInviteOnServer,
    CannotJoinOnServer,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::InvalidInvitation => "invitation proof is invalid",
            ErrorKind::ExpiredInvitation => "invitation has expired",
            ErrorKind::UsedInvitation => "invitation has no uses left",
            ErrorKind::RevokedInvitation => "invitation was revoked",
            ErrorKind::MemberUnknown => "member is not known to the team",
            ErrorKind::MemberRemoved => "member was removed from the team",
            ErrorKind::DeviceUnknown => "device is not known to the team",
            ErrorKind::DeviceRemoved => "device was removed from the team",
            ErrorKind::IdentityProofInvalid => "identity proof is invalid",
            ErrorKind::ChallengeStale => "identity challenge is stale",
            ErrorKind::DecryptionFailed => "decryption failed",
            ErrorKind::SignatureInvalid => "signature is invalid",
            ErrorKind::GraphCorrupt => "team graph is corrupt",
            ErrorKind::NotAdmin => "operation requires the admin role",
            ErrorKind::CannotInviteOnServer => "servers cannot create invitations",
            ErrorKind::CannotJoinOnServer => "servers cannot join a team",
            ErrorKind::Timeout => "connection timed out",
        };

        write!(f, "{text}")
    }
}

/// Who a peer claims to be.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub user_id: String,
    pub device_id: String,
}

/// What an invitee presents instead of team credentials: the proof of the
/// invitation seed plus the keys the team should record for them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InviteeClaim {
    pub proof: InvitationProof,
    pub user_id: String,
    pub user_name: String,
    pub user_keys: Keyset,
    pub device: Device,
}

/// A nonce the prover must sign to demonstrate possession of their
/// device's signature key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityChallenge {
    pub device_id: String,
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; 32],
    pub timestamp: u64,
}

/// The signed challenge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub challenge: IdentityChallenge,
    pub signature: Signature,
}

/// One round of graph sync.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Sender's current frontier.
    pub heads: Vec<Hash>,

    /// Link-to-predecessors map around the sender's heads, expanding each
    /// round until a common frontier is found.
    pub parent_map: ParentMap,

    /// Hashes the sender wants shipped.
    pub need: Vec<Hash>,

    /// Links the sender believes the receiver lacks or asked for.
    pub links: Vec<EncryptedLink>,
}

/// Everything two peers say to each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConnectionMessage {
    /// Opening message: a device identity claim, or an invitation proof
    /// for peers that hold no team state yet.
    Hello {
        claim: Option<IdentityClaim>,
        invitation: Option<InviteeClaim>,
    },

    /// Member side letting an invitee in: the serialized graph plus the
    /// team keyring sealed to the invitation keys.
    AcceptInvitation {
        #[serde(with = "serde_bytes")]
        graph: Vec<u8>,
        keyring: SealedBox,
    },

    ChallengeIdentity { challenge: IdentityChallenge },
    ProveIdentity { proof: IdentityProof },
    AcceptIdentity,
    RejectIdentity { error: ErrorKind },

    Sync { payload: SyncPayload },

    /// Half of the session seed, sealed to the peer's device keys.
    Seed { sealed: SealedBox },

    /// Application traffic, AEAD-encrypted under the session key.
    Message {
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },

    Disconnect { error: Option<ErrorKind> },
}

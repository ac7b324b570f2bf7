// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seed-based invitations.
//!
//! An inviting admin and an invitee share a short random seed over any
//! side channel. Both derive the same keypair from the normalized seed:
//! the graph records only the public keys, the invitee proves possession
//! of the seed by signing with the derived secret key. Observers of the
//! graph learn nothing that lets them join.
use huddle_core::identity::Signature;
use huddle_core::Hash;
use huddle_encryption::{KeyScope, KeysetWithSecrets};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Invitation;

/// Length of an invitation id in base58 characters.
pub const ID_LENGTH: usize = 15;

/// Domain tag for invitation ids.
const ID_CONTEXT: &str = "huddle-invitation-id";

/// The invitee's evidence of holding the invitation seed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvitationProof {
    pub id: String,
    pub signature: Signature,
}

/// Lowercase the seed and strip whitespace and punctuation, so that a seed
/// read aloud or retyped still matches.
pub fn normalize(seed: &str) -> String {
    seed.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Derive the invitation keyset from a seed.
pub fn keys_from_seed(seed: &str) -> Result<KeysetWithSecrets, InvitationError> {
    let normalized = normalize(seed);
    if normalized.is_empty() {
        return Err(InvitationError::Invalid);
    }

    KeysetWithSecrets::from_seed(KeyScope::ephemeral("invitation"), normalized.as_bytes())
        .map_err(|_| InvitationError::Invalid)
}

/// Create an invitation record from a seed.
///
/// `expiration` is Unix milliseconds (zero for none), `max_uses` caps
/// admissions (zero for unlimited) and `user_id` pins a device invitation
/// to its member. Device invitations are always single-use.
pub fn create(
    seed: &str,
    expiration: u64,
    max_uses: u32,
    user_id: Option<String>,
) -> Result<Invitation, InvitationError> {
    let keys = keys_from_seed(seed)?.public();

    Ok(Invitation {
        id: invitation_id(&keys.signing),
        public_key: keys.signing,
        encryption_key: keys.encryption,
        expiration,
        max_uses: if user_id.is_some() { 1 } else { max_uses },
        uses: 0,
        revoked: false,
        user_id,
    })
}

/// Short identifier derived from the invitation public key.
pub fn invitation_id(public_key: &huddle_core::identity::PublicKey) -> String {
    let digest = Hash::derive(ID_CONTEXT, public_key.as_bytes());
    let mut id = digest.to_base58();
    id.truncate(ID_LENGTH);
    id
}

/// Derive the invitation keys from the seed and sign the fixed challenge.
pub fn generate_proof(seed: &str) -> Result<InvitationProof, InvitationError> {
    let keys = keys_from_seed(seed)?;
    let id = invitation_id(&keys.signing.public_key());
    let signature = keys.signing.sign(id.as_bytes());

    Ok(InvitationProof { id, signature })
}

/// Check a proof against the stored invitation.
pub fn validate(proof: &InvitationProof, invitation: &Invitation) -> Result<(), InvitationError> {
    if proof.id != invitation.id {
        return Err(InvitationError::Invalid);
    }

    if !invitation
        .public_key
        .verify(proof.id.as_bytes(), &proof.signature)
    {
        return Err(InvitationError::Invalid);
    }

    Ok(())
}

/// Check whether the invitation is still usable at the given time.
pub fn can_be_used(invitation: &Invitation, now: u64) -> Result<(), InvitationError> {
    if invitation.revoked {
        return Err(InvitationError::Revoked);
    }
    if invitation.max_uses > 0 && invitation.uses >= invitation.max_uses {
        return Err(InvitationError::Used);
    }
    if invitation.expiration > 0 && now >= invitation.expiration {
        return Err(InvitationError::Expired);
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InvitationError {
    #[error("invitation proof is invalid")]
    Invalid,

    #[error("invitation has expired")]
    Expired,

    #[error("invitation has no uses left")]
    Used,

    #[error("invitation was revoked")]
    Revoked,

    #[error("invitation is not known to the team")]
    Unknown,
}

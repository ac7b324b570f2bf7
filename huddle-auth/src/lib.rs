// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decentralized team authentication and authorization.
//!
//! A team is a group of users and their devices which establish, modify and
//! verify shared membership and role state without any central authority.
//! Every participant holds a replicated, signed, hash-linked history of
//! team-management actions; peers sync histories opportunistically and
//! converge deterministically, even after arbitrary partitions and
//! conflicting administrative actions.
//!
//! The pieces:
//!
//! - [`graph`]: the append-only, content-addressed DAG of encrypted, signed
//!   links recording every team-management action.
//! - [`reducer`]: a pure fold from a topologically ordered link sequence to
//!   a [`TeamState`].
//! - [`resolver`]: the conflict policy applied to concurrent links before
//!   the reducer sees them (mutual removals, invalidated authority,
//!   duplicate admissions).
//! - [`selectors`]: read-only queries over a team state, including the
//!   lockbox visibility closure and local keyring decryption.
//! - [`invitation`]: seed-based invitation proofs.
//! - [`team`]: the high-level façade tying the above together.
pub mod action;
pub mod graph;
pub mod invitation;
pub mod link;
pub mod reducer;
pub mod resolver;
pub mod selectors;
pub mod state;
pub mod team;

pub use action::TeamAction;
pub use graph::{GraphError, TeamGraph};
pub use invitation::{InvitationError, InvitationProof};
pub use link::{EncryptedLink, Link, LinkBody, LinkError};
pub use resolver::Resolution;
pub use selectors::{IdentityError, KeyCache};
pub use state::{Device, Invitation, Member, Role, Server, TeamState, ADMIN};
pub use team::{
    EncryptedPayload, LocalContext, LocalDevice, LocalServer, LocalUser, SignedEnvelope, Team,
    TeamError, TeamEvent,
};

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symmetric-key distribution for decentralized teams.
//!
//! Every principal in a team (the team itself, each role, user, device and
//! server) owns a generation-tagged bundle of signing and encryption keys.
//! Access to a principal's secret keys is granted through "lockboxes":
//! encrypted envelopes which deliver one keyset to the holder of a recipient
//! scope's secret key. Chains of lockboxes form a visibility graph, for
//! example `device → user → role → team`, so that possession of a single
//! device secret unlocks everything that device is entitled to read.
//!
//! Revoking a privilege rotates the affected keysets to the next generation
//! and replaces every lockbox that the compromised principal could open.
//! Earlier generations are retained so that historic ciphertexts remain
//! readable.
pub mod crypto;
mod keyring;
mod keyset;
mod lockbox;

pub use crypto::{Rng, RngError, SecretBytes};
pub use keyring::{Keyring, KeyringError};
pub use keyset::{KeyScope, Keyset, KeysetError, KeysetRef, KeysetWithSecrets, ScopeType};
pub use lockbox::{Lockbox, LockboxError};

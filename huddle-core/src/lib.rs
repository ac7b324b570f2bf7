// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared building blocks for the huddle team-authentication stack: BLAKE3
//! content hashes with a base58 text form, Ed25519 signing identities and
//! CBOR encoding helpers.
pub mod cbor;
pub mod hash;
pub mod identity;

pub use cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
pub use hash::{Hash, HashError, HASH_LEN};
pub use identity::{IdentityError, PrivateKey, PublicKey, Signature};

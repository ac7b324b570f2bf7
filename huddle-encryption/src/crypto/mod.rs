// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks under the keysets and lockboxes.
//!
//! - XChaCha20-Poly1305 AEAD (24-byte nonce, prepended to the ciphertext)
//! - X25519 Diffie-Hellman with ephemeral-key sealed boxes
//! - SHA256 HKDF for deriving scoped symmetric keys
//! - ChaCha20-based randomness with a seedable test mode
pub mod aead;
pub mod hkdf;
mod rng;
mod secret;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::{SecretBytes, SECRET_SIZE};

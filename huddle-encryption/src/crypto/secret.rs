// SPDX-License-Identifier: MIT OR Apache-2.0

//! The secret half of scoped key material.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Size in bytes of every secret this crate handles. X25519 scalars,
/// Ed25519 seeds, derived AEAD keys and session seed halves are all the
/// same width.
pub const SECRET_SIZE: usize = 32;

/// Raw secret bytes belonging to one generation of a scope's keys.
///
/// Whether the bytes end up as a keyset's encryption scalar, a link
/// encryption key derived from it, or the agreement behind a lockbox, they
/// get the same handling: zeroised on drop, compared in constant time,
/// redacted in debug output, and only readable inside this crate so key
/// material cannot leak through a public accessor.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] [u8; SECRET_SIZE]);

impl SecretBytes {
    pub(crate) fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison.
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never reveal key material, test builds included.
        write!(f, "SecretBytes(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::SecretBytes;

    #[test]
    fn equality_by_value() {
        let secret = SecretBytes::from_bytes([42; 32]);

        assert_eq!(secret, SecretBytes::from_bytes([42; 32]));
        assert_ne!(secret, SecretBytes::from_bytes([43; 32]));
    }

    #[test]
    fn debug_output_is_redacted() {
        let secret = SecretBytes::from_bytes([42; 32]);
        let printed = format!("{secret:?}");

        assert_eq!(printed, "SecretBytes(***)");
        assert!(!printed.contains("42"));
    }
}

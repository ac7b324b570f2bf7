// SPDX-License-Identifier: MIT OR Apache-2.0

//! BLAKE3 hashes over arbitrary bytes with a base58 text form.
//!
//! Hashes are the identities of links in a team graph, so equality and
//! ordering are defined over the raw byte value and the text form is the
//! same base58 alphabet used for all outward-facing identifiers.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The length of a BLAKE3 hash in bytes.
pub const HASH_LEN: usize = 32;

/// 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "serde_bytes")] [u8; HASH_LEN]);

impl Hash {
    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buf.as_ref()).as_bytes())
    }

    /// Calculate a domain-separated hash of the provided bytes.
    ///
    /// Used wherever two different kinds of material must never collide
    /// under the same digest, for example invitation identifiers and
    /// identity challenges.
    pub fn derive(context: &str, buf: impl AsRef<[u8]>) -> Self {
        Self(blake3::derive_key(context, buf.as_ref()))
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Convert the hash to a base58 string.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl From<Hash> for [u8; HASH_LEN] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value_len = value.len();

        let checked_value: [u8; HASH_LEN] = value
            .try_into()
            .map_err(|_| HashError::InvalidLength(value_len, HASH_LEN))?;

        Ok(Self(checked_value))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(value).into_vec()?;
        Self::try_from(bytes.as_slice())
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_base58())
    }
}

/// Error types for `Hash` struct.
#[derive(Error, Debug)]
pub enum HashError {
    /// Hash string has an invalid length.
    #[error("invalid hash length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    /// Hash string contains invalid base58 characters.
    #[error("invalid base58 encoding in hash string")]
    InvalidBase58Encoding(#[from] bs58::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::{Hash, HashError};

    #[test]
    fn hashing() {
        let hash = Hash::new([1, 2, 3]);

        assert_eq!(
            hash.as_bytes(),
            &[
                177, 119, 236, 27, 242, 109, 251, 59, 112, 16, 212, 115, 230, 212, 71, 19, 178,
                155, 118, 91, 153, 198, 230, 14, 203, 250, 231, 66, 222, 73, 101, 67
            ]
        );
    }

    #[test]
    fn base58_round_trip() {
        let hash = Hash::new(b"a team graph link");
        let text = hash.to_base58();
        let hash_again: Hash = text.parse().unwrap();
        assert_eq!(hash, hash_again);
    }

    #[test]
    fn domain_separation() {
        let plain = Hash::new(b"seed material");
        let derived = Hash::derive("huddle-test", b"seed material");
        assert_ne!(plain, derived);

        // Same context and input always gives the same digest.
        assert_eq!(derived, Hash::derive("huddle-test", b"seed material"));
    }

    #[test]
    fn invalid_length() {
        let bytes = vec![254, 100, 4, 7];
        let result: Result<Hash, HashError> = bytes.as_slice().try_into();
        assert!(matches!(result, Err(HashError::InvalidLength(4, 32))));
    }

    #[test]
    fn invalid_base58_encoding() {
        let text = "0OIl-not-base58";
        let result: Result<Hash, HashError> = text.parse();
        assert!(matches!(result, Err(HashError::InvalidBase58Encoding(_))));
    }
}

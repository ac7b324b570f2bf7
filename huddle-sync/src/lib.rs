// SPDX-License-Identifier: MIT OR Apache-2.0

//! Peer-to-peer authentication and graph sync for huddle teams.
//!
//! A [`Connection`] runs between two peers over any ordered byte channel.
//! It mutually authenticates both ends as team members (or lets an invitee
//! in), exchanges graphs until both replicas converge, negotiates a
//! session key and then carries encrypted application traffic. Transport
//! and scheduling stay with the host: it pumps bytes into
//! [`Connection::deliver`] and drives timeouts through
//! [`Connection::tick`].
pub mod connection;
pub mod message;
pub mod sync;

pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState, Proving,
    Verifying, DEFAULT_TIMEOUT_MS,
};
pub use message::{ConnectionMessage, ErrorKind, IdentityClaim, IdentityProof, SyncPayload};

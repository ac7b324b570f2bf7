// SPDX-License-Identifier: MIT OR Apache-2.0

//! The peer connection state machine.
//!
//! Both ends send a `Hello` on start. Members then challenge each other's
//! device identities (the prove and verify tracks run in parallel),
//! synchronize graphs until their frontiers match, exchange sealed session
//! seed halves and end up `Connected`. A peer holding no team state
//! presents an invitation proof instead and is admitted before entering
//! the same identity path.
//!
//! The machine is synchronous and transport-free: the host feeds received
//! bytes into [`Connection::deliver`], forwards outgoing bytes from the
//! send callback, and calls [`Connection::tick`] with its clock to drive
//! timeouts.
use huddle_auth::invitation::{self, InvitationError};
use huddle_auth::selectors::{self, IdentityError};
use huddle_auth::{LocalContext, Team, TeamError};
use huddle_core::cbor::{decode_cbor, encode_cbor};
use huddle_core::Hash;
use huddle_encryption::crypto::aead;
use huddle_encryption::crypto::x25519;
use huddle_encryption::{Keyring, Keyset, Rng};
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{
    ConnectionMessage, ErrorKind, IdentityChallenge, IdentityClaim, IdentityProof, InviteeClaim,
    SyncPayload,
};
use crate::sync;

/// Deadline for every state except `connected`.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Progress of proving our own identity to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proving {
    AwaitingChallenge,
    AwaitingAcceptance,
    Done,
}

/// Progress of verifying the peer's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verifying {
    AwaitingProof,
    Done,
}

/// Where the connection currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingIdentityClaim,
    AwaitingInvitationAcceptance,
    /// The two identity tracks run in parallel; this state is their
    /// product.
    Authenticating {
        proving: Proving,
        verifying: Verifying,
    },
    Synchronizing,
    Negotiating,
    Connected,
}

/// Notifications emitted by a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Joined { team_name: String },
    Updated { head: Vec<Hash> },
    Disconnected { error: Option<ErrorKind> },
    LocalError { error: ErrorKind },
    RemoteError { error: ErrorKind },
    Message { payload: Vec<u8> },
}

/// Errors surfaced by the public connection API.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is not established")]
    NotConnected,

    #[error("{0}")]
    Protocol(ErrorKind),
}

/// What a connection needs to run.
pub struct ConnectionConfig {
    pub team: Option<Team>,
    pub context: LocalContext,
    pub invitation_seed: Option<String>,
    pub peer_user_id: Option<String>,
    pub timeout_ms: u64,
    pub rng: Rng,
    /// Randomness handed to a team joined through this connection.
    pub team_rng: Option<Rng>,
}

impl ConnectionConfig {
    /// Configuration for a peer that already holds the team.
    pub fn for_member(team: Team, rng: Rng) -> Self {
        Self {
            context: team.context().clone(),
            team: Some(team),
            invitation_seed: None,
            peer_user_id: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            rng,
            team_rng: None,
        }
    }

    /// Configuration for an invitee holding only the seed.
    pub fn for_invitee(context: LocalContext, seed: &str, rng: Rng, team_rng: Rng) -> Self {
        Self {
            team: None,
            context,
            invitation_seed: Some(seed.to_string()),
            peer_user_id: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            rng,
            team_rng: Some(team_rng),
        }
    }
}

type Listener = Box<dyn FnMut(&ConnectionEvent)>;

/// One end of a peer-to-peer session.
pub struct Connection {
    send: Box<dyn FnMut(Vec<u8>)>,
    context: LocalContext,
    team: Option<Team>,
    invitation_seed: Option<String>,
    peer_user_id: Option<String>,

    state: ConnectionState,
    peer_claim: Option<IdentityClaim>,
    /// Device keys asserted by an invitee, trusted on the strength of
    /// their invitation proof until the graph records them.
    peer_keys: Option<Keyset>,
    our_challenge: Option<IdentityChallenge>,

    my_half: Option<[u8; 32]>,
    their_half: Option<[u8; 32]>,
    session: Option<aead::AeadKey>,

    sync_depth: usize,
    pending_links: Vec<huddle_auth::EncryptedLink>,

    deadline: u64,
    timeout_ms: u64,
    rng: Rng,
    team_rng: Option<Rng>,
    listeners: Vec<Listener>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, send: impl FnMut(Vec<u8>) + 'static) -> Self {
        Self {
            send: Box::new(send),
            context: config.context,
            team: config.team,
            invitation_seed: config.invitation_seed,
            peer_user_id: config.peer_user_id,
            state: ConnectionState::Disconnected,
            peer_claim: None,
            peer_keys: None,
            our_challenge: None,
            my_half: None,
            their_half: None,
            session: None,
            sync_depth: sync::INITIAL_DEPTH,
            pending_links: Vec::new(),
            deadline: 0,
            timeout_ms: config.timeout_ms,
            rng: config.rng,
            team_rng: config.team_rng,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn team(&self) -> Option<&Team> {
        self.team.as_ref()
    }

    pub fn team_mut(&mut self) -> Option<&mut Team> {
        self.team.as_mut()
    }

    pub fn into_team(self) -> Option<Team> {
        self.team
    }

    /// Register a listener for connection events.
    pub fn subscribe(&mut self, listener: impl FnMut(&ConnectionEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Open the session: announce who we are (or our invitation proof).
    pub fn start(&mut self, now: u64) {
        self.deadline = now + self.timeout_ms;

        let result = match self.hello() {
            Ok(hello) => {
                self.state = if self.invitation_seed.is_some() {
                    ConnectionState::AwaitingInvitationAcceptance
                } else {
                    ConnectionState::AwaitingIdentityClaim
                };
                self.send_msg(&hello)
            }
            Err(kind) => Err(kind),
        };

        if let Err(kind) = result {
            self.fail(kind);
        }
    }

    /// Tear the session down.
    pub fn stop(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let _ = self.send_msg(&ConnectionMessage::Disconnect { error: None });
        self.state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::Disconnected { error: None });
    }

    /// Feed one received message into the machine.
    pub fn deliver(&mut self, bytes: &[u8], now: u64) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let message: ConnectionMessage = match decode_cbor(bytes) {
            Ok(message) => message,
            Err(_) => {
                self.fail(ErrorKind::GraphCorrupt);
                return;
            }
        };

        self.deadline = now + self.timeout_ms;

        if let Err(kind) = self.handle(message, now) {
            self.fail(kind);
        }
    }

    /// Enforce the deadline; any state except `connected` times out.
    pub fn tick(&mut self, now: u64) {
        let exempt = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnected
        );
        if !exempt && now >= self.deadline {
            self.fail(ErrorKind::Timeout);
        }
    }

    /// Send application bytes, AEAD-wrapped under the session key.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let Some(key) = &self.session else {
            return Err(ConnectionError::NotConnected);
        };

        let ciphertext = aead::encrypt(payload, key, &[], &self.rng)
            .map_err(|_| ConnectionError::Protocol(ErrorKind::DecryptionFailed))?;

        self.send_msg(&ConnectionMessage::Message { ciphertext })
            .map_err(ConnectionError::Protocol)
    }

    // ------------------------------------------------------------------
    // Message handling.
    // ------------------------------------------------------------------

    fn handle(&mut self, message: ConnectionMessage, now: u64) -> Result<(), ErrorKind> {
        use ConnectionState::*;

        match (self.state, message) {
            (_, ConnectionMessage::Disconnect { error }) => {
                if let Some(error) = error {
                    self.emit(ConnectionEvent::RemoteError { error });
                }
                self.state = Disconnected;
                self.emit(ConnectionEvent::Disconnected { error });
                Ok(())
            }

            (_, ConnectionMessage::RejectIdentity { error }) => {
                self.emit(ConnectionEvent::RemoteError { error });
                self.state = Disconnected;
                self.emit(ConnectionEvent::Disconnected { error: Some(error) });
                Ok(())
            }

            (AwaitingIdentityClaim, ConnectionMessage::Hello { claim, invitation }) => {
                match invitation {
                    Some(invitee) => self.handle_invitee_hello(invitee, now),
                    None => {
                        let claim = claim.ok_or(ErrorKind::IdentityProofInvalid)?;
                        self.handle_identity_claim(claim, now)
                    }
                }
            }

            // The member's hello arrives while we still wait to be let in.
            (AwaitingInvitationAcceptance, ConnectionMessage::Hello { claim, .. }) => {
                self.peer_claim = claim;
                Ok(())
            }

            (
                AwaitingInvitationAcceptance,
                ConnectionMessage::AcceptInvitation { graph, keyring },
            ) => self.handle_acceptance(&graph, keyring, now),

            (
                Authenticating {
                    proving: Proving::AwaitingChallenge,
                    ..
                },
                ConnectionMessage::ChallengeIdentity { challenge },
            ) => self.handle_challenge(challenge),

            (
                Authenticating {
                    verifying: Verifying::AwaitingProof,
                    ..
                },
                ConnectionMessage::ProveIdentity { proof },
            ) => self.handle_proof(proof, now),

            (
                Authenticating {
                    proving: Proving::AwaitingAcceptance,
                    verifying,
                },
                ConnectionMessage::AcceptIdentity,
            ) => {
                self.state = Authenticating {
                    proving: Proving::Done,
                    verifying,
                };
                self.maybe_synchronize()
            }

            (Synchronizing | Negotiating | Connected, ConnectionMessage::Sync { payload }) => {
                self.handle_sync(payload)
            }

            (Synchronizing | Negotiating, ConnectionMessage::Seed { sealed }) => {
                self.handle_seed(&sealed)
            }

            (Connected, ConnectionMessage::Message { ciphertext }) => {
                let key = self.session.as_ref().ok_or(ErrorKind::DecryptionFailed)?;
                let payload = aead::decrypt(&ciphertext, key, &[])
                    .map_err(|_| ErrorKind::DecryptionFailed)?;
                self.emit(ConnectionEvent::Message { payload });
                Ok(())
            }

            (state, message) => {
                // FIFO delivery makes this unreachable with a conforming
                // peer; drop and keep going.
                warn!(?state, "ignoring unexpected message: {message:?}");
                Ok(())
            }
        }
    }

    /// A member peer claimed a device identity: challenge it.
    fn handle_identity_claim(
        &mut self,
        claim: IdentityClaim,
        now: u64,
    ) -> Result<(), ErrorKind> {
        if let Some(expected) = &self.peer_user_id {
            if claim.user_id != *expected {
                self.send_msg(&ConnectionMessage::RejectIdentity {
                    error: ErrorKind::MemberUnknown,
                })?;
                return Err(ErrorKind::MemberUnknown);
            }
        }

        let device_id = claim.device_id.clone();
        self.peer_claim = Some(claim);
        self.state = ConnectionState::Authenticating {
            proving: Proving::AwaitingChallenge,
            verifying: Verifying::AwaitingProof,
        };
        self.issue_challenge(device_id, now)
    }

    /// An invitee presented a proof: validate, admit, hand over the team.
    fn handle_invitee_hello(
        &mut self,
        invitee: InviteeClaim,
        now: u64,
    ) -> Result<(), ErrorKind> {
        if self.team.is_none() {
            return Err(ErrorKind::MemberUnknown);
        }

        let pinned_user: Option<Option<String>> = self
            .team
            .as_ref()
            .and_then(|team| team.invitation(&invitee.proof.id))
            .map(|invitation| invitation.user_id.clone());
        let Some(pinned_user) = pinned_user else {
            self.send_msg(&ConnectionMessage::RejectIdentity {
                error: ErrorKind::InvalidInvitation,
            })?;
            return Err(ErrorKind::InvalidInvitation);
        };

        let admitted = {
            let team = self.team.as_mut().ok_or(ErrorKind::MemberUnknown)?;
            if pinned_user.is_some() {
                team.admit_device(&invitee.proof, invitee.device.clone())
            } else {
                team.admit_member(
                    &invitee.proof,
                    invitee.user_keys.clone(),
                    &invitee.user_name,
                )
            }
        };

        if let Err(err) = admitted {
            let kind = team_error_kind(&err);
            self.send_msg(&ConnectionMessage::RejectIdentity { error: kind })?;
            return Err(kind);
        }

        // Hand over the graph and the keyring, sealed to the invitation
        // keys the invitee derived from the seed.
        let (graph, sealed, head) = {
            let team = self.team.as_ref().ok_or(ErrorKind::MemberUnknown)?;
            let invitation = team
                .invitation(&invitee.proof.id)
                .ok_or(ErrorKind::InvalidInvitation)?;
            let graph = team.save().map_err(|_| ErrorKind::GraphCorrupt)?;
            let keyring_bytes =
                encode_cbor(team.team_keyring().map_err(|_| ErrorKind::GraphCorrupt)?)
                    .map_err(|_| ErrorKind::GraphCorrupt)?;
            let sealed = x25519::seal(&keyring_bytes, &invitation.encryption_key, &self.rng)
                .map_err(|_| ErrorKind::GraphCorrupt)?;

            (graph, sealed, team.state().head.clone())
        };

        self.send_msg(&ConnectionMessage::AcceptInvitation {
            graph,
            keyring: sealed,
        })?;

        self.emit(ConnectionEvent::Updated { head });

        // From here the invitee is a regular member: challenge the device
        // they asserted.
        let device_id = invitee.device.device_id();
        self.peer_claim = Some(IdentityClaim {
            user_id: invitee.user_id.clone(),
            device_id: device_id.clone(),
        });
        self.peer_keys = Some(invitee.device.keys.clone());
        self.state = ConnectionState::Authenticating {
            proving: Proving::AwaitingChallenge,
            verifying: Verifying::AwaitingProof,
        };
        self.issue_challenge(device_id, now)
    }

    /// The member side let us in: join the team and enter the identity
    /// path.
    fn handle_acceptance(
        &mut self,
        graph: &[u8],
        keyring: x25519::SealedBox,
        now: u64,
    ) -> Result<(), ErrorKind> {
        let seed = self
            .invitation_seed
            .as_ref()
            .ok_or(ErrorKind::InvalidInvitation)?;
        let invitation_keys =
            invitation::keys_from_seed(seed).map_err(|_| ErrorKind::InvalidInvitation)?;

        let keyring_bytes = x25519::open(&keyring, &invitation_keys.encryption)
            .map_err(|_| ErrorKind::DecryptionFailed)?;
        let keyring: Keyring =
            decode_cbor(&keyring_bytes).map_err(|_| ErrorKind::DecryptionFailed)?;

        let team_rng = self.team_rng.take().unwrap_or_default();
        let team = Team::join(graph, self.context.clone(), keyring, team_rng)
            .map_err(|err| team_error_kind(&err))?;

        let team_name = team.team_name().to_string();
        let head = team.state().head.clone();
        self.team = Some(team);

        debug!(team = %team_name, "joined team through invitation");
        self.emit(ConnectionEvent::Joined { team_name });
        self.emit(ConnectionEvent::Updated { head });

        // Challenge the member who let us in.
        let claim = self.peer_claim.clone().ok_or(ErrorKind::MemberUnknown)?;
        self.state = ConnectionState::Authenticating {
            proving: Proving::AwaitingChallenge,
            verifying: Verifying::AwaitingProof,
        };
        self.issue_challenge(claim.device_id, now)
    }

    /// Sign the peer's challenge with our device key.
    fn handle_challenge(&mut self, challenge: IdentityChallenge) -> Result<(), ErrorKind> {
        if challenge.device_id != self.context.device_id() {
            return Err(ErrorKind::IdentityProofInvalid);
        }

        let bytes = encode_cbor(&challenge).map_err(|_| ErrorKind::GraphCorrupt)?;
        let signature = self.context.signing_key().sign(&bytes);

        self.send_msg(&ConnectionMessage::ProveIdentity {
            proof: IdentityProof {
                challenge,
                signature,
            },
        })?;

        if let ConnectionState::Authenticating { verifying, .. } = self.state {
            self.state = ConnectionState::Authenticating {
                proving: Proving::AwaitingAcceptance,
                verifying,
            };
        }

        Ok(())
    }

    /// Check the peer's signed challenge against their recorded keys.
    fn handle_proof(&mut self, proof: IdentityProof, now: u64) -> Result<(), ErrorKind> {
        let verified = self.verify_proof(&proof, now);

        if let Err(kind) = verified {
            self.send_msg(&ConnectionMessage::RejectIdentity { error: kind })?;
            return Err(kind);
        }

        self.send_msg(&ConnectionMessage::AcceptIdentity)?;

        if let ConnectionState::Authenticating { proving, .. } = self.state {
            self.state = ConnectionState::Authenticating {
                proving,
                verifying: Verifying::Done,
            };
        }

        self.maybe_synchronize()
    }

    fn verify_proof(&self, proof: &IdentityProof, now: u64) -> Result<(), ErrorKind> {
        let expected = self
            .our_challenge
            .as_ref()
            .ok_or(ErrorKind::IdentityProofInvalid)?;
        if proof.challenge != *expected {
            return Err(ErrorKind::IdentityProofInvalid);
        }

        if now.saturating_sub(proof.challenge.timestamp) > self.timeout_ms {
            return Err(ErrorKind::ChallengeStale);
        }

        let keys = self.peer_device_keys()?;
        let bytes = encode_cbor(&proof.challenge).map_err(|_| ErrorKind::GraphCorrupt)?;

        if !keys.signing.verify(&bytes, &proof.signature) {
            return Err(ErrorKind::IdentityProofInvalid);
        }

        Ok(())
    }

    /// Both identity tracks done: start exchanging graphs.
    fn maybe_synchronize(&mut self) -> Result<(), ErrorKind> {
        let done = matches!(
            self.state,
            ConnectionState::Authenticating {
                proving: Proving::Done,
                verifying: Verifying::Done,
            }
        );
        if !done {
            return Ok(());
        }

        let team = self.team.as_ref().ok_or(ErrorKind::MemberUnknown)?;
        let payload = sync::first_message(team.graph());

        self.state = ConnectionState::Synchronizing;
        self.sync_depth = sync::INITIAL_DEPTH;
        self.send_msg(&ConnectionMessage::Sync { payload })
    }

    /// Merge a sync round and either answer it or move to negotiation.
    fn handle_sync(&mut self, payload: SyncPayload) -> Result<(), ErrorKind> {
        let team = self.team.as_mut().ok_or(ErrorKind::MemberUnknown)?;

        let mut incoming = std::mem::take(&mut self.pending_links);
        incoming.extend(payload.links.iter().cloned());

        let heads_before = team.graph().heads();
        let leftovers = team
            .merge(incoming)
            .map_err(|_| ErrorKind::GraphCorrupt)?;
        self.pending_links = leftovers;

        let head = team.graph().heads();
        if head != heads_before {
            self.emit(ConnectionEvent::Updated { head });
        }

        let team = self.team.as_ref().ok_or(ErrorKind::MemberUnknown)?;
        let need = sync::missing_links(team.graph(), &payload);
        let converged =
            sync::is_converged(team.graph(), &payload) && need.is_empty() && payload.need.is_empty();

        if converged {
            if self.state == ConnectionState::Synchronizing {
                return self.begin_negotiation();
            }
            return Ok(());
        }

        self.sync_depth *= 2;
        let response = sync::next_message(team.graph(), &payload, need, self.sync_depth);
        self.send_msg(&ConnectionMessage::Sync { payload: response })
    }

    /// Send our sealed seed half and wait for theirs.
    fn begin_negotiation(&mut self) -> Result<(), ErrorKind> {
        if self.my_half.is_none() {
            let half = self
                .rng
                .random_key_material()
                .map_err(|_| ErrorKind::GraphCorrupt)?;
            self.my_half = Some(half);

            let recipient = self.peer_device_keys()?.encryption;
            let sealed = x25519::seal(&half, &recipient, &self.rng)
                .map_err(|_| ErrorKind::GraphCorrupt)?;
            self.send_msg(&ConnectionMessage::Seed { sealed })?;
        }

        self.state = ConnectionState::Negotiating;
        self.try_finish();
        Ok(())
    }

    /// Open the peer's seed half; the session key is the XOR of the two.
    fn handle_seed(&mut self, sealed: &x25519::SealedBox) -> Result<(), ErrorKind> {
        let bytes = x25519::open(sealed, self.context.encryption_key())
            .map_err(|_| ErrorKind::DecryptionFailed)?;
        let half: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ErrorKind::DecryptionFailed)?;
        self.their_half = Some(half);

        // The peer converging first is also our signal that sync is over.
        if self.state == ConnectionState::Synchronizing {
            return self.begin_negotiation();
        }

        self.try_finish();
        Ok(())
    }

    fn try_finish(&mut self) {
        let (Some(mine), Some(theirs)) = (self.my_half, self.their_half) else {
            return;
        };

        let mut key = [0u8; 32];
        for (index, byte) in key.iter_mut().enumerate() {
            *byte = mine[index] ^ theirs[index];
        }

        self.session = Some(aead::key_from_bytes(key));
        self.state = ConnectionState::Connected;
        self.emit(ConnectionEvent::Connected);
    }

    // ------------------------------------------------------------------
    // Plumbing.
    // ------------------------------------------------------------------

    fn hello(&mut self) -> Result<ConnectionMessage, ErrorKind> {
        let claim = IdentityClaim {
            user_id: self.context.user_id().to_string(),
            device_id: self.context.device_id(),
        };

        let invitation = match &self.invitation_seed {
            Some(seed) => {
                let proof = invitation::generate_proof(seed)
                    .map_err(|_| ErrorKind::InvalidInvitation)?;
                let LocalContext::Member { user, device } = &self.context else {
                    return Err(ErrorKind::CannotJoinOnServer);
                };

                Some(InviteeClaim {
                    proof,
                    user_id: user.user_id.clone(),
                    user_name: user.user_name.clone(),
                    user_keys: user.keys.public(),
                    device: device.public(),
                })
            }
            None => None,
        };

        Ok(ConnectionMessage::Hello {
            claim: Some(claim),
            invitation,
        })
    }

    fn issue_challenge(&mut self, device_id: String, now: u64) -> Result<(), ErrorKind> {
        let challenge = IdentityChallenge {
            device_id,
            nonce: self
                .rng
                .random_key_material()
                .map_err(|_| ErrorKind::GraphCorrupt)?,
            timestamp: now,
        };

        self.our_challenge = Some(challenge.clone());
        self.send_msg(&ConnectionMessage::ChallengeIdentity { challenge })
    }

    /// The peer's device keys: from the team state, or asserted by an
    /// admitted invitee whose enrollment has not synced back yet.
    fn peer_device_keys(&self) -> Result<Keyset, ErrorKind> {
        if let Some(keys) = &self.peer_keys {
            return Ok(keys.clone());
        }

        let team = self.team.as_ref().ok_or(ErrorKind::MemberUnknown)?;
        let claim = self.peer_claim.as_ref().ok_or(ErrorKind::DeviceUnknown)?;

        selectors::lookup_device(team.state(), &claim.device_id)
            .map(|device| device.keys.clone())
            .map_err(identity_kind)
    }

    fn send_msg(&mut self, message: &ConnectionMessage) -> Result<(), ErrorKind> {
        let bytes = encode_cbor(message).map_err(|_| ErrorKind::GraphCorrupt)?;
        (self.send)(bytes);
        Ok(())
    }

    fn fail(&mut self, kind: ErrorKind) {
        warn!(error = %kind, "connection failed");
        self.emit(ConnectionEvent::LocalError { error: kind });

        let _ = self.send_msg(&ConnectionMessage::Disconnect { error: Some(kind) });
        self.state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::Disconnected { error: Some(kind) });
    }

    fn emit(&mut self, event: ConnectionEvent) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in &mut listeners {
            listener(&event);
        }
        listeners.extend(std::mem::take(&mut self.listeners));
        self.listeners = listeners;
    }
}

fn identity_kind(err: IdentityError) -> ErrorKind {
    match err {
        IdentityError::MemberUnknown => ErrorKind::MemberUnknown,
        IdentityError::MemberRemoved => ErrorKind::MemberRemoved,
        IdentityError::DeviceUnknown => ErrorKind::DeviceUnknown,
        IdentityError::DeviceRemoved => ErrorKind::DeviceRemoved,
    }
}

fn invitation_kind(err: &InvitationError) -> ErrorKind {
    match err {
        InvitationError::Invalid | InvitationError::Unknown => ErrorKind::InvalidInvitation,
        InvitationError::Expired => ErrorKind::ExpiredInvitation,
        InvitationError::Used => ErrorKind::UsedInvitation,
        InvitationError::Revoked => ErrorKind::RevokedInvitation,
    }
}

fn team_error_kind(err: &TeamError) -> ErrorKind {
    match err {
        TeamError::Invitation(inner) => invitation_kind(inner),
        TeamError::Identity(inner) => identity_kind(*inner),
        TeamError::NotAdmin => ErrorKind::NotAdmin,
        TeamError::CannotInviteOnServer => ErrorKind::CannotInviteOnServer,
        TeamError::CannotJoinOnServer | TeamError::NotMember => ErrorKind::CannotJoinOnServer,
        TeamError::MemberUnknown(_) => ErrorKind::MemberUnknown,
        TeamError::DecryptionFailed => ErrorKind::DecryptionFailed,
        TeamError::SignatureInvalid => ErrorKind::SignatureInvalid,
        _ => ErrorKind::GraphCorrupt,
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end team scenarios: founding, removal with key rotation,
//! conflicting concurrent administration and the invitation round-trip.
use huddle_auth::invitation;
use huddle_auth::link::LinkBody;
use huddle_auth::reducer;
use huddle_auth::resolver;
use huddle_auth::state::{Member, ADMIN};
use huddle_auth::{LocalContext, LocalDevice, LocalUser, Team, TeamAction, TeamError};
use huddle_encryption::{KeyScope, KeysetWithSecrets, Rng};

fn rng(seed: u8) -> Rng {
    Rng::from_seed([seed; 32])
}

/// Local user and device secrets for a test member.
fn context(user_id: &str, seed: u8) -> LocalContext {
    let rng = rng(seed);

    let user = LocalUser {
        user_id: user_id.to_string(),
        user_name: user_id.to_string(),
        keys: KeysetWithSecrets::generate(KeyScope::user(user_id), &rng).unwrap(),
    };
    let device = LocalDevice {
        user_id: user_id.to_string(),
        device_name: "laptop".to_string(),
        keys: KeysetWithSecrets::generate(KeyScope::device(format!("{user_id}::laptop")), &rng)
            .unwrap(),
    };

    LocalContext::member(user, device)
}

/// Public membership record for a context, as an admin would learn it
/// through an out-of-band exchange.
fn record(context: &LocalContext, roles: &[&str]) -> Member {
    let LocalContext::Member { user, device } = context else {
        panic!("test contexts are members");
    };

    Member {
        user_id: user.user_id.clone(),
        user_name: user.user_name.clone(),
        keys: user.keys.public(),
        devices: vec![device.public()],
        roles: roles.iter().map(|role| role.to_string()).collect(),
    }
}

/// A replica of the team for another member, as if synced out-of-band.
fn replica(team: &Team, context: LocalContext, seed: u8) -> Team {
    Team::load(
        &team.save().unwrap(),
        context,
        team.team_keyring().unwrap().clone(),
        rng(seed),
    )
    .unwrap()
}

#[test]
fn root_team() {
    let alice = context("alice", 1);
    let team = Team::create("spies", alice, rng(100)).unwrap();

    assert_eq!(team.team_name(), "spies");
    assert_eq!(team.members().len(), 1);
    assert_eq!(team.members()[0].user_id, "alice");
    assert!(team.member_is_admin("alice"));

    assert_eq!(team.team_keys().unwrap().generation, 0);
    assert_eq!(team.admin_keys().unwrap().generation, 0);
}

#[test]
fn remove_rotates_keys() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);

    alice_team.add(record(&bob, &[ADMIN])).unwrap();
    assert!(alice_team.member_is_admin("bob"));

    alice_team.remove("bob").unwrap();

    assert_eq!(alice_team.team_keys().unwrap().generation, 1);
    assert_eq!(alice_team.admin_keys().unwrap().generation, 1);
    assert!(alice_team.member_was_removed("bob"));
    assert!(!alice_team.has_member("bob"));
}

#[test]
fn concurrent_mutual_demote() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[ADMIN])).unwrap();

    let mut bob_team = replica(&alice_team, bob, 101);

    // The peers disconnect; each admin demotes the other.
    alice_team.remove_member_role("bob", ADMIN).unwrap();
    bob_team.remove_member_role("alice", ADMIN).unwrap();

    // Reconnect and exchange everything.
    let leftover = alice_team.merge(bob_team.encrypted_links()).unwrap();
    assert!(leftover.is_empty());
    let leftover = bob_team.merge(alice_team.encrypted_links()).unwrap();
    assert!(leftover.is_empty());

    // The founder is more senior, so her demotion wins on both replicas.
    for team in [&alice_team, &bob_team] {
        assert!(team.member_is_admin("alice"));
        assert!(!team.member_is_admin("bob"));
    }
    assert_eq!(alice_team.state(), bob_team.state());
}

#[test]
fn concurrent_mutual_remove_with_observer() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    let charlie = context("charlie", 3);

    alice_team.add(record(&bob, &[ADMIN])).unwrap();
    alice_team.add(record(&charlie, &[ADMIN])).unwrap();

    let mut bob_team = replica(&alice_team, bob, 101);
    let mut charlie_team = replica(&alice_team, charlie, 102);

    // Alice and Bob remove each other while disconnected.
    alice_team.remove("bob").unwrap();
    bob_team.remove("alice").unwrap();

    // Charlie hears Bob's side first and believes Alice is out.
    charlie_team.merge(bob_team.encrypted_links()).unwrap();
    assert!(!charlie_team.has_member("alice"));
    assert!(charlie_team.has_member("bob"));

    // Then Alice's side arrives: the founder outranks Bob, so Bob's
    // removal of Alice is discarded and Alice reappears.
    charlie_team.merge(alice_team.encrypted_links()).unwrap();
    assert!(charlie_team.has_member("alice"));
    assert!(!charlie_team.has_member("bob"));
    assert!(charlie_team.member_was_removed("bob"));

    // Everyone converges on the same state.
    alice_team.merge(bob_team.encrypted_links()).unwrap();
    alice_team.merge(charlie_team.encrypted_links()).unwrap();
    bob_team.merge(alice_team.encrypted_links()).unwrap();
    bob_team.merge(charlie_team.encrypted_links()).unwrap();
    charlie_team.merge(alice_team.encrypted_links()).unwrap();

    assert_eq!(alice_team.state(), charlie_team.state());
    assert_eq!(alice_team.state(), bob_team.state());
    assert!(alice_team.has_member("charlie"));
}

#[test]
fn demoted_admin_promotion_is_invalidated() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    let charlie = context("charlie", 3);

    alice_team.add(record(&bob, &[ADMIN])).unwrap();
    alice_team.add(record(&charlie, &[])).unwrap();

    let mut bob_team = replica(&alice_team, bob, 101);

    // Offline, Bob promotes Charlie while Alice demotes Bob.
    bob_team.add_member_role("charlie", ADMIN).unwrap();
    alice_team.remove_member_role("bob", ADMIN).unwrap();

    alice_team.merge(bob_team.encrypted_links()).unwrap();
    bob_team.merge(alice_team.encrypted_links()).unwrap();

    // Bob lost the argument and his promotion of Charlie went with it.
    for team in [&alice_team, &bob_team] {
        assert!(!team.member_is_admin("bob"));
        assert!(!team.member_is_admin("charlie"));
        assert!(team.has_member("charlie"));
    }
    assert_eq!(alice_team.state(), bob_team.state());
}

#[test]
fn invitation_round_trip() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();

    let (id, seed) = alice_team.invite_member("abc 123", 0, 1).unwrap();
    assert_eq!(seed, "abc123");
    assert!(alice_team.invitation(&id).is_some());

    // Bob generates his own keys and derives the proof from the seed.
    let bob = context("bob", 2);
    let LocalContext::Member { user, .. } = &bob else {
        unreachable!()
    };
    let bob_user_keys = user.keys.public();

    let proof = invitation::generate_proof("abc123").unwrap();
    assert!(alice_team.validate_invitation(&proof).is_ok());

    alice_team.admit_member(&proof, bob_user_keys, "bob").unwrap();
    assert_eq!(alice_team.member("bob").unwrap().user_id, "bob");
    assert_eq!(alice_team.invitation(&id).unwrap().uses, 1);

    // A second use of the single-use invitation is rejected.
    assert!(matches!(
        alice_team.validate_invitation(&proof),
        Err(TeamError::Invitation(_))
    ));

    // Bob joins from the serialized graph and enrolls his device.
    let mut bob_team = Team::join(
        &alice_team.save().unwrap(),
        bob,
        alice_team.team_keyring().unwrap().clone(),
        rng(101),
    )
    .unwrap();

    assert!(bob_team.has_member("bob"));
    assert_eq!(bob_team.team_name(), "spies");

    // Alice learns about Bob's device on the next sync.
    alice_team.merge(bob_team.encrypted_links()).unwrap();
    assert_eq!(alice_team.member("bob").unwrap().devices.len(), 1);

    bob_team.merge(alice_team.encrypted_links()).unwrap();
    assert_eq!(alice_team.state(), bob_team.state());
}

#[test]
fn revoked_invitation_is_rejected() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();

    let (id, seed) = alice_team.invite_member("purple monkey", 0, 1).unwrap();
    alice_team.revoke_invitation(&id).unwrap();

    let proof = invitation::generate_proof(&seed).unwrap();
    assert!(matches!(
        alice_team.validate_invitation(&proof),
        Err(TeamError::Invitation(invitation::InvitationError::Revoked))
    ));
}

#[test]
fn reduce_is_deterministic() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();

    let resolution = resolver::resolve(alice_team.graph());
    let state_1 = reducer::reduce(alice_team.graph(), &resolution);
    let state_2 = reducer::reduce(alice_team.graph(), &resolution);

    assert_eq!(state_1, state_2);
    assert_eq!(&state_1, alice_team.state());
}

#[test]
fn merge_is_commutative_and_idempotent() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[ADMIN])).unwrap();

    let mut bob_team = replica(&alice_team, bob, 101);

    let charlie = context("charlie", 3);
    let daphne = context("daphne", 4);
    alice_team.add(record(&charlie, &[])).unwrap();
    bob_team.add(record(&daphne, &[])).unwrap();

    // Exchange in both directions.
    alice_team.merge(bob_team.encrypted_links()).unwrap();
    bob_team.merge(alice_team.encrypted_links()).unwrap();

    assert_eq!(alice_team.state(), bob_team.state());
    assert!(alice_team.has_member("charlie"));
    assert!(alice_team.has_member("daphne"));

    // Merging the same links again changes nothing.
    let before = alice_team.state().clone();
    alice_team.merge(bob_team.encrypted_links()).unwrap();
    assert_eq!(&before, alice_team.state());
}

#[test]
fn save_load_round_trip() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();

    let bytes = alice_team.save().unwrap();
    let restored = Team::load(
        &bytes,
        context("alice", 1),
        alice_team.team_keyring().unwrap().clone(),
        rng(102),
    )
    .unwrap();

    assert_eq!(alice_team.graph(), restored.graph());
    assert_eq!(alice_team.state(), restored.state());
}

#[test]
fn application_payload_encryption() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[ADMIN])).unwrap();

    let sealed = alice_team.encrypt(b"meet at the usual place").unwrap();
    assert_eq!(sealed.generation, 0);

    let bob_team = replica(&alice_team, bob, 101);
    assert_eq!(
        bob_team.decrypt(&sealed).unwrap(),
        b"meet at the usual place"
    );

    // Rotation does not break old ciphertexts.
    alice_team.remove("bob").unwrap();
    assert_eq!(
        alice_team.decrypt(&sealed).unwrap(),
        b"meet at the usual place"
    );
    assert_eq!(alice_team.encrypt(b"again").unwrap().generation, 1);
}

#[test]
fn signed_payloads_verify_against_team_state() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();

    let bob_team = replica(&alice_team, bob, 101);

    let envelope = bob_team.sign(b"status report");
    assert!(alice_team.verify(&envelope).is_ok());

    let mut forged = envelope.clone();
    forged.payload = b"forged report".to_vec();
    assert!(alice_team.verify(&forged).is_err());
}

#[test]
fn malicious_link_is_ignored_at_reduce() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    let mallory = context("mallory", 9);

    // Bob is a member without the admin role.
    alice_team.add(record(&bob, &[])).unwrap();

    // A malicious peer crafts an AddMember link authored by Bob.
    let mut graph = alice_team.graph().clone();
    let LocalContext::Member { device, .. } = &bob else {
        unreachable!()
    };
    let body = LinkBody {
        action: TeamAction::AddMember {
            member: record(&mallory, &[ADMIN]),
        },
        user_id: "bob".to_string(),
        device_id: device.device_id(),
        timestamp: 0,
        prev: Vec::new(),
        lockboxes: Vec::new(),
    };
    graph
        .append(
            body,
            alice_team.team_keys().unwrap(),
            &device.keys.signing,
            &rng(50),
        )
        .unwrap();

    // The reducer never applies it; Mallory does not exist.
    let resolution = resolver::resolve(&graph);
    let state = reducer::reduce(&graph, &resolution);

    assert!(state.member("mallory").is_none());
    assert!(state.member("bob").is_some());
}

#[test]
fn non_admin_dispatch_is_rejected() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    let charlie = context("charlie", 3);
    alice_team.add(record(&bob, &[])).unwrap();

    let mut bob_team = replica(&alice_team, bob, 101);

    assert!(matches!(
        bob_team.add(record(&charlie, &[])),
        Err(TeamError::NotAdmin)
    ));
    assert!(matches!(
        bob_team.remove("alice"),
        Err(TeamError::NotAdmin)
    ));
}

#[test]
fn last_admin_cannot_be_removed() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();

    assert!(matches!(
        alice_team.remove("alice"),
        Err(TeamError::CannotRemoveLastAdmin)
    ));
    assert!(matches!(
        alice_team.remove_member_role("alice", ADMIN),
        Err(TeamError::CannotRemoveLastAdmin)
    ));
}

#[test]
fn updated_events_fire_on_dispatch() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();

    let count = Rc::new(RefCell::new(0));
    let seen = count.clone();
    alice_team.subscribe(move |_event| {
        *seen.borrow_mut() += 1;
    });

    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();
    alice_team.remove("bob").unwrap();

    assert_eq!(*count.borrow(), 2);
}

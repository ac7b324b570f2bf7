// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two connections wired back-to-back over in-memory queues: mutual
//! authentication, graph sync, session traffic and the invitee path.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use huddle_auth::{LocalContext, LocalDevice, LocalUser, Member, Team};
use huddle_encryption::{KeyScope, KeysetWithSecrets, Rng};
use huddle_sync::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState, ErrorKind};

type Wire = Rc<RefCell<VecDeque<Vec<u8>>>>;
type Events = Rc<RefCell<Vec<ConnectionEvent>>>;

fn rng(seed: u8) -> Rng {
    Rng::from_seed([seed; 32])
}

fn context(user_id: &str, seed: u8) -> LocalContext {
    let rng = rng(seed);

    LocalContext::member(
        LocalUser {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            keys: KeysetWithSecrets::generate(KeyScope::user(user_id), &rng).unwrap(),
        },
        LocalDevice {
            user_id: user_id.to_string(),
            device_name: "laptop".to_string(),
            keys: KeysetWithSecrets::generate(KeyScope::device(format!("{user_id}::laptop")), &rng)
                .unwrap(),
        },
    )
}

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

/// Build a connection writing into `wire` and recording its events.
fn connect(config: ConnectionConfig, wire: &Wire) -> (Connection, Events) {
    let out = wire.clone();
    let mut connection = Connection::new(config, move |bytes| {
        out.borrow_mut().push_back(bytes);
    });

    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    connection.subscribe(move |event| {
        sink.borrow_mut().push(event.clone());
    });

    (connection, events)
}

/// Shuttle messages between the two ends until both queues drain.
fn pump(a: &mut Connection, b: &mut Connection, a_out: &Wire, b_out: &Wire, now: u64) {
    loop {
        let from_a = a_out.borrow_mut().pop_front();
        if let Some(bytes) = &from_a {
            b.deliver(bytes, now);
        }

        let from_b = b_out.borrow_mut().pop_front();
        if let Some(bytes) = &from_b {
            a.deliver(bytes, now);
        }

        if from_a.is_none() && from_b.is_none() {
            break;
        }
    }
}

fn saw(events: &Events, wanted: impl Fn(&ConnectionEvent) -> bool) -> bool {
    events.borrow().iter().any(|event| wanted(event))
}

#[test]
fn members_authenticate_sync_and_chat() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();

    // Bob's replica diverges from Alice's by one member each.
    let bob_team = Team::load(
        &alice_team.save().unwrap(),
        bob,
        alice_team.team_keyring().unwrap().clone(),
        rng(101),
    )
    .unwrap();
    let charlie = context("charlie", 3);
    alice_team.add(record(&charlie, &[])).unwrap();

    let a_out: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let b_out: Wire = Rc::new(RefCell::new(VecDeque::new()));

    let (mut conn_a, events_a) = connect(ConnectionConfig::for_member(alice_team, rng(110)), &a_out);
    let (mut conn_b, events_b) = connect(ConnectionConfig::for_member(bob_team, rng(111)), &b_out);

    conn_a.start(0);
    conn_b.start(0);
    pump(&mut conn_a, &mut conn_b, &a_out, &b_out, 1);

    assert_eq!(conn_a.state(), ConnectionState::Connected);
    assert_eq!(conn_b.state(), ConnectionState::Connected);
    assert!(saw(&events_a, |e| matches!(e, ConnectionEvent::Connected)));
    assert!(saw(&events_b, |e| matches!(e, ConnectionEvent::Connected)));

    // Both replicas converged during the session.
    assert!(conn_b.team().unwrap().has_member("charlie"));
    assert_eq!(
        conn_a.team().unwrap().state(),
        conn_b.team().unwrap().state()
    );

    // Application traffic flows under the session key.
    conn_a.send_message(b"meet at dawn").unwrap();
    pump(&mut conn_a, &mut conn_b, &a_out, &b_out, 2);

    assert!(saw(&events_b, |e| matches!(
        e,
        ConnectionEvent::Message { payload } if payload == b"meet at dawn"
    )));
}

#[test]
fn invitee_joins_over_the_wire() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    let (_, seed) = alice_team.invite_member("abc 123", 0, 1).unwrap();

    let a_out: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let b_out: Wire = Rc::new(RefCell::new(VecDeque::new()));

    let (mut conn_a, _events_a) =
        connect(ConnectionConfig::for_member(alice_team, rng(110)), &a_out);
    let (mut conn_b, events_b) = connect(
        ConnectionConfig::for_invitee(context("bob", 2), &seed, rng(111), rng(112)),
        &b_out,
    );

    conn_a.start(0);
    conn_b.start(0);
    pump(&mut conn_a, &mut conn_b, &a_out, &b_out, 1);

    assert_eq!(conn_a.state(), ConnectionState::Connected);
    assert_eq!(conn_b.state(), ConnectionState::Connected);
    assert!(saw(&events_b, |e| matches!(
        e,
        ConnectionEvent::Joined { team_name } if team_name == "spies"
    )));

    // Both sides know Bob and his freshly enrolled device.
    for conn in [&conn_a, &conn_b] {
        let team = conn.team().unwrap();
        assert!(team.has_member("bob"));
        assert_eq!(team.member("bob").unwrap().devices.len(), 1);
    }
    assert_eq!(
        conn_a.team().unwrap().state(),
        conn_b.team().unwrap().state()
    );
}

#[test]
fn connection_times_out() {
    let alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();

    let a_out: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let (mut conn_a, events_a) =
        connect(ConnectionConfig::for_member(alice_team, rng(110)), &a_out);

    conn_a.start(0);

    // Nobody answers.
    conn_a.tick(10_000);
    assert_ne!(conn_a.state(), ConnectionState::Disconnected);

    conn_a.tick(30_000);
    assert_eq!(conn_a.state(), ConnectionState::Disconnected);
    assert!(saw(&events_a, |e| matches!(
        e,
        ConnectionEvent::LocalError {
            error: ErrorKind::Timeout
        }
    )));
}

#[test]
fn forged_device_identity_is_rejected() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();

    // The team records Bob with one set of device keys...
    let bob = context("bob", 2);
    alice_team.add(record(&bob, &[])).unwrap();
    let keyring = alice_team.team_keyring().unwrap().clone();

    // ...but the connecting peer holds different ones.
    let imposter = context("bob", 22);
    let imposter_team =
        Team::load(&alice_team.save().unwrap(), imposter, keyring, rng(101)).unwrap();

    let a_out: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let b_out: Wire = Rc::new(RefCell::new(VecDeque::new()));

    let (mut conn_a, events_a) =
        connect(ConnectionConfig::for_member(alice_team, rng(110)), &a_out);
    let (mut conn_b, events_b) = connect(
        ConnectionConfig::for_member(imposter_team, rng(111)),
        &b_out,
    );

    conn_a.start(0);
    conn_b.start(0);
    pump(&mut conn_a, &mut conn_b, &a_out, &b_out, 1);

    assert_eq!(conn_a.state(), ConnectionState::Disconnected);
    assert_eq!(conn_b.state(), ConnectionState::Disconnected);

    assert!(saw(&events_a, |e| matches!(
        e,
        ConnectionEvent::LocalError {
            error: ErrorKind::IdentityProofInvalid
        }
    )));
    assert!(saw(&events_b, |e| matches!(
        e,
        ConnectionEvent::RemoteError {
            error: ErrorKind::IdentityProofInvalid
        }
    )));
}

#[test]
fn wrong_seed_is_rejected() {
    let mut alice_team = Team::create("spies", context("alice", 1), rng(100)).unwrap();
    alice_team.invite_member("abc 123", 0, 1).unwrap();

    let a_out: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let b_out: Wire = Rc::new(RefCell::new(VecDeque::new()));

    let (mut conn_a, events_a) =
        connect(ConnectionConfig::for_member(alice_team, rng(110)), &a_out);
    let (mut conn_b, events_b) = connect(
        ConnectionConfig::for_invitee(context("bob", 2), "wrong seed", rng(111), rng(112)),
        &b_out,
    );

    conn_a.start(0);
    conn_b.start(0);
    pump(&mut conn_a, &mut conn_b, &a_out, &b_out, 1);

    assert_eq!(conn_a.state(), ConnectionState::Disconnected);
    assert_eq!(conn_b.state(), ConnectionState::Disconnected);
    assert!(saw(&events_a, |e| matches!(
        e,
        ConnectionEvent::LocalError {
            error: ErrorKind::InvalidInvitation
        }
    )));
    assert!(saw(&events_b, |e| matches!(
        e,
        ConnectionEvent::RemoteError {
            error: ErrorKind::InvalidInvitation
        }
    )));
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delta computation for graph sync.
//!
//! Peers exchange head sets, then parent maps expanding outward until they
//! agree on a common frontier, then the missing links by hash. The round
//! count is bounded by the graph diameter and the shipped volume by the
//! symmetric difference of the two replicas.
use std::collections::HashSet;

use huddle_auth::graph::{ParentMapOptions, TeamGraph};
use huddle_core::Hash;

use crate::message::SyncPayload;

/// Parent-map radius of the first round.
pub const INITIAL_DEPTH: usize = 2;

/// The opening sync message: our frontier and a shallow parent map.
pub fn first_message(graph: &TeamGraph) -> SyncPayload {
    SyncPayload {
        heads: graph.heads(),
        parent_map: graph.parent_map(&ParentMapOptions {
            depth: Some(INITIAL_DEPTH),
            ..Default::default()
        }),
        need: Vec::new(),
        links: Vec::new(),
    }
}

/// Hashes mentioned by the remote payload which are absent locally.
///
/// Structure travels in parent maps, so missing links can be requested
/// even while their bodies are still undecryptable.
pub fn missing_links(graph: &TeamGraph, remote: &SyncPayload) -> Vec<Hash> {
    let mut missing: Vec<Hash> = Vec::new();
    let mut seen: HashSet<Hash> = HashSet::new();

    let mentioned = remote
        .heads
        .iter()
        .chain(remote.parent_map.keys())
        .chain(remote.parent_map.values().flatten());

    for hash in mentioned {
        if !graph.contains(hash) && seen.insert(*hash) {
            missing.push(*hash);
        }
    }

    missing.sort();
    missing
}

/// Return `true` when the remote frontier equals ours.
pub fn is_converged(graph: &TeamGraph, remote: &SyncPayload) -> bool {
    remote.heads == graph.heads()
}

/// Build the next round: answer the remote's requests, ship the delta
/// beyond any of their heads we recognize, and ask for what we lack.
pub fn next_message(
    graph: &TeamGraph,
    remote: &SyncPayload,
    need: Vec<Hash>,
    depth: usize,
) -> SyncPayload {
    let mut shipped: HashSet<Hash> = HashSet::new();
    let mut links = Vec::new();

    // Links the remote explicitly asked for.
    for hash in &remote.need {
        if let Some(link) = graph.encrypted_link(hash) {
            if shipped.insert(*hash) {
                links.push(link.clone());
            }
        }
    }

    // Everything on our side beyond the part of their frontier we know.
    let known_their_heads: Vec<Hash> = remote
        .heads
        .iter()
        .copied()
        .filter(|hash| graph.contains(hash))
        .collect();
    if !known_their_heads.is_empty() {
        let delta = graph.parent_map(&ParentMapOptions {
            end: Some(known_their_heads),
            ..Default::default()
        });
        for hash in delta.keys() {
            if let Some(link) = graph.encrypted_link(hash) {
                if shipped.insert(*hash) {
                    links.push(link.clone());
                }
            }
        }
    }

    SyncPayload {
        heads: graph.heads(),
        parent_map: graph.parent_map(&ParentMapOptions {
            depth: Some(depth),
            ..Default::default()
        }),
        need,
        links,
    }
}

#[cfg(test)]
mod tests {
    use huddle_auth::state::ADMIN;
    use huddle_auth::{LocalContext, LocalDevice, LocalUser, Member, Team};
    use huddle_encryption::{KeyScope, KeysetWithSecrets, Rng};

    use super::{first_message, is_converged, missing_links, next_message, INITIAL_DEPTH};

    fn context(user_id: &str, seed: u8) -> LocalContext {
        let rng = Rng::from_seed([seed; 32]);

        LocalContext::member(
            LocalUser {
                user_id: user_id.to_string(),
                user_name: user_id.to_string(),
                keys: KeysetWithSecrets::generate(KeyScope::user(user_id), &rng).unwrap(),
            },
            LocalDevice {
                user_id: user_id.to_string(),
                device_name: "laptop".to_string(),
                keys: KeysetWithSecrets::generate(
                    KeyScope::device(format!("{user_id}::laptop")),
                    &rng,
                )
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

    #[test]
    fn two_replicas_converge() {
        let mut alice_team =
            Team::create("spies", context("alice", 1), Rng::from_seed([100; 32])).unwrap();
        let bob = context("bob", 2);
        alice_team.add(record(&bob, &[ADMIN])).unwrap();

        let mut bob_team = Team::load(
            &alice_team.save().unwrap(),
            bob,
            alice_team.team_keyring().unwrap().clone(),
            Rng::from_seed([101; 32]),
        )
        .unwrap();

        // Both sides advance independently.
        let charlie = context("charlie", 3);
        let daphne = context("daphne", 4);
        alice_team.add(record(&charlie, &[])).unwrap();
        bob_team.add(record(&daphne, &[])).unwrap();

        // Alice opens; rounds alternate until both frontiers match.
        let mut depth = INITIAL_DEPTH;
        let mut from_alice = first_message(alice_team.graph());

        for _ in 0..10 {
            // Bob's turn.
            bob_team.merge(from_alice.links.clone()).unwrap();
            if is_converged(bob_team.graph(), &from_alice) && from_alice.need.is_empty() {
                break;
            }
            let need = missing_links(bob_team.graph(), &from_alice);
            depth *= 2;
            let from_bob = next_message(bob_team.graph(), &from_alice, need, depth);

            // Alice's turn.
            alice_team.merge(from_bob.links.clone()).unwrap();
            let need = missing_links(alice_team.graph(), &from_bob);
            depth *= 2;
            from_alice = next_message(alice_team.graph(), &from_bob, need, depth);
        }

        assert_eq!(alice_team.graph().heads(), bob_team.graph().heads());
        assert_eq!(alice_team.state(), bob_team.state());
        assert!(alice_team.has_member("daphne"));
        assert!(bob_team.has_member("charlie"));
    }

    #[test]
    fn identical_replicas_are_converged_immediately() {
        let alice_team =
            Team::create("spies", context("alice", 1), Rng::from_seed([100; 32])).unwrap();

        let opening = first_message(alice_team.graph());
        assert!(is_converged(alice_team.graph(), &opening));
        assert!(missing_links(alice_team.graph(), &opening).is_empty());
    }
}

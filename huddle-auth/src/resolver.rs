// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conflict resolution for concurrent team-management actions.
//!
//! The resolver is a pure function of the graph: it decides which links the
//! reducer must never see, so that any two peers holding the same link set
//! compute the same team state. Three policies are enforced, in order:
//!
//! 1. **Mutual removal**: admins who concurrently remove or demote each
//!    other. The more senior admin wins; the junior's link is dropped.
//! 2. **Invalidated authority**: actions by an author who lost admin (or
//!    membership) in the winning concurrent branch are dropped, and the
//!    drop cascades to anyone whose own authority came from a dropped link.
//! 3. **Duplicate admission**: concurrent uses of one invitation beyond its
//!    allowance; the earliest by author seniority, then hash, win.
use std::collections::{HashMap, HashSet};

use huddle_core::Hash;
use petgraph::graphmap::{DiGraphMap, NodeTrait};
use petgraph::visit::{Dfs, Reversed};
use tracing::debug;

use crate::action::TeamAction;
use crate::graph::TeamGraph;
use crate::state::ADMIN;

/// Outcome of resolving a graph.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    /// Links whose actions must be ignored by the reducer.
    pub ignored: HashSet<Hash>,

    /// Links which took part in a mutual remove or demote cycle.
    pub mutual_removes: HashSet<Hash>,

    /// Total order over members: the founder has rank zero, everyone else
    /// follows the order their membership entered the graph.
    pub seniority_rank: HashMap<String, usize>,
}

/// A remove or demote action found in the graph.
#[derive(Clone, Debug)]
struct Strip {
    hash: Hash,
    author: String,
    target: String,
    /// `true` for a full removal, `false` for an admin demotion.
    removes_membership: bool,
}

/// Resolve all concurrency conflicts in the graph.
pub fn resolve(graph: &TeamGraph) -> Resolution {
    let map = graph.to_graph_map();
    let seniority_rank = seniority(graph);

    let mut resolution = Resolution {
        ignored: HashSet::new(),
        mutual_removes: HashSet::new(),
        seniority_rank,
    };

    // Rule 1, scoped to each set of concurrent links.
    for bubble in concurrent_bubbles(&map) {
        filter_mutual_strips(graph, &map, &bubble, &mut resolution);
    }

    // Rules 2 and 3 feed each other (an admission by a removed admin stops
    // counting, an admitted member's authority can evaporate), so they loop
    // to a fixpoint. Each pass only grows the ignore set, so the loop is
    // bounded by the number of links.
    loop {
        let mut changed = filter_invalidated_authority(graph, &map, &mut resolution);
        changed |= filter_duplicate_admissions(graph, &mut resolution);

        if !changed {
            break;
        }
    }

    resolution
}

/// Total seniority order over members.
///
/// The founder is most senior. Otherwise a member whose joining link is a
/// predecessor of another's is the more senior of the two; concurrent
/// joins are tie-broken by the hash of the joining link.
fn seniority(graph: &TeamGraph) -> HashMap<String, usize> {
    let mut rank = HashMap::new();

    // A plain hash-tie-broken topological pass realizes exactly this
    // order: predecessors come first, concurrent links sort by hash.
    for link in graph.sorted(&HashSet::new(), &HashMap::new()) {
        let joined = match &link.body.action {
            TeamAction::Root { founder, .. } => Some(&founder.user_id),
            TeamAction::AddMember { member } => Some(&member.user_id),
            TeamAction::AdmitMember { user_id, .. } => Some(user_id),
            _ => None,
        };

        if let Some(user_id) = joined {
            let next = rank.len();
            rank.entry(user_id.clone()).or_insert(next);
        }
    }

    rank
}

/// Rule 1: mutually concurrent removes/demotes between two admins.
fn filter_mutual_strips(
    graph: &TeamGraph,
    map: &DiGraphMap<Hash, ()>,
    bubble: &HashSet<Hash>,
    resolution: &mut Resolution,
) {
    // Only strips whose author ever held an admin grant preceding the
    // strip can take part; a forged removal by a non-admin must not be
    // allowed to win a conflict the reducer would reject anyway.
    let admin_grants = grant_links(graph, true);
    let strips: Vec<Strip> = bubble
        .iter()
        .filter_map(|hash| graph.link(hash).and_then(as_strip))
        .filter(|strip| {
            has_surviving_grant(
                map,
                &resolution.ignored,
                admin_grants.get(&strip.author),
                strip.hash,
            )
        })
        .collect();

    for strip in &strips {
        for other in &strips {
            let is_mutual = strip.author == other.target
                && other.author == strip.target
                && strip.hash != other.hash
                && is_concurrent(map, strip.hash, other.hash);
            if !is_mutual {
                continue;
            }

            resolution.mutual_removes.insert(strip.hash);
            resolution.mutual_removes.insert(other.hash);

            let strip_rank = author_rank(&resolution.seniority_rank, &strip.author);
            let other_rank = author_rank(&resolution.seniority_rank, &other.author);

            // The junior's action loses. Equal ranks cannot happen for two
            // distinct members, but fall back to the hash to stay total.
            let loser = if strip_rank > other_rank
                || (strip_rank == other_rank && strip.hash > other.hash)
            {
                strip
            } else {
                other
            };

            if resolution.ignored.insert(loser.hash) {
                debug!(
                    link = %loser.hash,
                    author = %loser.author,
                    "dropping junior side of mutual removal"
                );
            }
        }
    }
}

/// Rule 2: drop actions whose author lost their authority.
///
/// Returns `true` if the ignore set grew.
fn filter_invalidated_authority(
    graph: &TeamGraph,
    map: &DiGraphMap<Hash, ()>,
    resolution: &mut Resolution,
) -> bool {
    let mut changed = false;

    let membership_grants = grant_links(graph, false);
    let admin_grants = grant_links(graph, true);

    // Surviving, authorized strips void the target's concurrent actions:
    // everything for a removal, management actions for a demotion.
    let strips: Vec<Strip> = graph
        .links()
        .filter(|link| !resolution.ignored.contains(&link.hash))
        .filter_map(as_strip)
        .filter(|strip| {
            has_surviving_grant(
                map,
                &resolution.ignored,
                admin_grants.get(&strip.author),
                strip.hash,
            )
        })
        .collect();

    for strip in &strips {
        for link in graph.links() {
            if resolution.ignored.contains(&link.hash)
                || link.body.user_id != strip.target
                || link.hash == strip.hash
                || !is_concurrent(map, strip.hash, link.hash)
            {
                continue;
            }

            let voided = strip.removes_membership || link.body.action.requires_admin();
            if voided && resolution.ignored.insert(link.hash) {
                debug!(
                    link = %link.hash,
                    author = %link.body.user_id,
                    "dropping action concurrent with author's removal"
                );
                changed = true;
            }
        }
    }

    // Cascade: a link only counts if its author's membership (and, for
    // management actions, admin role) was granted by a surviving link
    // earlier in the graph.
    for link in graph.links() {
        if resolution.ignored.contains(&link.hash) || link.body.action.is_root() {
            continue;
        }

        let author = &link.body.user_id;

        let has_membership = has_surviving_grant(
            map,
            &resolution.ignored,
            membership_grants.get(author),
            link.hash,
        );
        let has_authority = !link.body.action.requires_admin()
            || has_surviving_grant(map, &resolution.ignored, admin_grants.get(author), link.hash);

        if !has_membership || !has_authority {
            if resolution.ignored.insert(link.hash) {
                debug!(
                    link = %link.hash,
                    author = %author,
                    "dropping action without surviving authority"
                );
                changed = true;
            }
        }
    }

    changed
}

/// Rule 3: concurrent admissions beyond an invitation's allowance.
///
/// Returns `true` if the ignore set grew.
fn filter_duplicate_admissions(graph: &TeamGraph, resolution: &mut Resolution) -> bool {
    let mut changed = false;

    // Emission order with the seniority comparator realizes "earliest by
    // seniority of author, then hash" among concurrent admissions.
    let order: HashMap<Hash, usize> = graph
        .sorted(&HashSet::new(), &resolution.seniority_rank)
        .iter()
        .enumerate()
        .map(|(position, link)| (link.hash, position))
        .collect();

    let mut allowances: HashMap<&str, u32> = HashMap::new();
    for link in graph.links() {
        if resolution.ignored.contains(&link.hash) {
            continue;
        }
        match &link.body.action {
            TeamAction::InviteMember { invitation } | TeamAction::InviteDevice { invitation } => {
                allowances.insert(invitation.id.as_str(), invitation.max_uses);
            }
            _ => {}
        }
    }

    let mut admissions: HashMap<&str, Vec<Hash>> = HashMap::new();
    for link in graph.links() {
        if resolution.ignored.contains(&link.hash) {
            continue;
        }
        match &link.body.action {
            TeamAction::AdmitMember { id, .. } | TeamAction::AdmitDevice { id, .. } => {
                admissions.entry(id.as_str()).or_default().push(link.hash);
            }
            _ => {}
        }
    }

    for (id, mut admits) in admissions {
        // Zero means unlimited.
        let Some(&max_uses) = allowances.get(id).filter(|max| **max > 0) else {
            continue;
        };

        admits.sort_by_key(|hash| order[hash]);

        for hash in admits.into_iter().skip(max_uses as usize) {
            if resolution.ignored.insert(hash) {
                debug!(link = %hash, invitation = id, "dropping admission beyond allowance");
                changed = true;
            }
        }
    }

    changed
}

fn as_strip(link: &crate::link::Link) -> Option<Strip> {
    match &link.body.action {
        TeamAction::RemoveMember { user_id } => Some(Strip {
            hash: link.hash,
            author: link.body.user_id.clone(),
            target: user_id.clone(),
            removes_membership: true,
        }),
        TeamAction::RemoveMemberRole { user_id, role_name } if role_name == ADMIN => Some(Strip {
            hash: link.hash,
            author: link.body.user_id.clone(),
            target: user_id.clone(),
            removes_membership: false,
        }),
        _ => None,
    }
}

fn author_rank(rank: &HashMap<String, usize>, user_id: &str) -> usize {
    rank.get(user_id).copied().unwrap_or(usize::MAX)
}

/// Return `true` if one of the author's grant links survives and precedes
/// the given link.
fn has_surviving_grant(
    map: &DiGraphMap<Hash, ()>,
    ignored: &HashSet<Hash>,
    grants: Option<&Vec<Hash>>,
    link: Hash,
) -> bool {
    let Some(grants) = grants else {
        return false;
    };

    grants
        .iter()
        .any(|grant| !ignored.contains(grant) && has_path(map, *grant, link))
}

/// Links granting each user their membership, or (with `admin`) the admin
/// role.
fn grant_links(graph: &TeamGraph, admin: bool) -> HashMap<String, Vec<Hash>> {
    let mut grants: HashMap<String, Vec<Hash>> = HashMap::new();

    for link in graph.links() {
        let granted: Option<&str> = match &link.body.action {
            TeamAction::Root { founder, .. } => Some(&founder.user_id),
            TeamAction::AddMember { member } => {
                (!admin || member.is_admin()).then_some(member.user_id.as_str())
            }
            TeamAction::AdmitMember { user_id, .. } if !admin => Some(user_id),
            TeamAction::AddMemberRole { user_id, role_name }
                if admin && role_name == ADMIN =>
            {
                Some(user_id)
            }
            _ => None,
        };

        if let Some(user_id) = granted {
            grants
                .entry(user_id.to_string())
                .or_default()
                .push(link.hash);
        }
    }

    grants
}

/// Recursively identify all links concurrent with the given target link.
fn concurrent_bubble<N>(
    graph: &DiGraphMap<N, ()>,
    target: N,
    processed: &mut HashSet<N>,
) -> HashSet<N>
where
    N: NodeTrait,
{
    let mut bubble = HashSet::new();
    bubble.insert(target);

    concurrent_nodes(graph, target).into_iter().for_each(|node| {
        if processed.insert(node) {
            bubble.extend(concurrent_bubble(graph, node, processed).iter())
        }
    });

    bubble
}

/// Walk the graph and identify all sets of concurrent links.
pub(crate) fn concurrent_bubbles<N>(graph: &DiGraphMap<N, ()>) -> Vec<HashSet<N>>
where
    N: NodeTrait,
{
    let mut processed: HashSet<N> = HashSet::new();
    let mut bubbles = Vec::new();

    graph.nodes().for_each(|target| {
        if processed.insert(target) {
            let bubble = concurrent_bubble(graph, target, &mut processed);
            if bubble.len() > 1 {
                bubbles.push(bubble)
            }
        }
    });

    bubbles
}

/// Return any links concurrent with the given target link.
///
/// Links are concurrent if they are neither predecessors nor successors of
/// the target.
fn concurrent_nodes<N>(graph: &DiGraphMap<N, ()>, target: N) -> HashSet<N>
where
    N: NodeTrait,
{
    let mut successors = HashSet::new();
    let mut dfs = Dfs::new(&graph, target);
    while let Some(nx) = dfs.next(&graph) {
        successors.insert(nx);
    }

    let mut predecessors = HashSet::new();
    let reversed = Reversed(graph);
    let mut dfs_rev = Dfs::new(&reversed, target);
    while let Some(nx) = dfs_rev.next(&reversed) {
        predecessors.insert(nx);
    }

    let relatives: HashSet<_> = successors.union(&predecessors).cloned().collect();

    graph.nodes().filter(|n| !relatives.contains(n)).collect()
}

/// Return `true` if a path exists in the graph between `from` and `to`.
fn has_path<N>(graph: &DiGraphMap<N, ()>, from: N, to: N) -> bool
where
    N: NodeTrait,
{
    if from == to {
        return false;
    }

    let mut dfs = Dfs::new(graph, from);
    while let Some(node) = dfs.next(graph) {
        if node == to {
            return true;
        }
    }
    false
}

fn is_concurrent<N>(graph: &DiGraphMap<N, ()>, a: N, b: N) -> bool
where
    N: NodeTrait,
{
    a != b && !has_path(graph, a, b) && !has_path(graph, b, a)
}

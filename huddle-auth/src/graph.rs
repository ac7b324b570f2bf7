// SPDX-License-Identifier: MIT OR Apache-2.0

//! The append-only, content-addressed DAG of team links.
//!
//! Links are identified by the hash of their encrypted body, so the graph
//! is acyclic by construction and merging is a plain union: two peers with
//! the same link set hold the same graph.
use std::collections::{BTreeMap, HashMap, HashSet};

use huddle_core::cbor::{decode_cbor, encode_cbor};
use huddle_core::identity::PrivateKey;
use huddle_core::Hash;
use huddle_encryption::{Keyring, KeysetWithSecrets, Rng};
use petgraph::prelude::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::{EncryptedLink, Link, LinkBody, LinkError};

/// Version byte at the head of every serialized graph.
const GRAPH_FORMAT_VERSION: u8 = 1;

/// Map from a link hash to the hashes of its immediate predecessors.
pub type ParentMap = BTreeMap<Hash, Vec<Hash>>;

/// Selection options for [`TeamGraph::parent_map`].
#[derive(Clone, Debug, Default)]
pub struct ParentMapOptions {
    /// Include only links within this many hops of the heads.
    pub depth: Option<usize>,

    /// Include only links reachable from the heads without passing through
    /// (or into) this set.
    pub end: Option<Vec<Hash>>,

    /// Return the complement: every link *not* listed in the given map.
    pub complement: Option<ParentMap>,
}

/// The hash-linked DAG of links forming a team's replicated history.
#[derive(Clone, Debug, PartialEq)]
pub struct TeamGraph {
    root: Hash,
    links: HashMap<Hash, Link>,
    encrypted: HashMap<Hash, EncryptedLink>,
    children: HashMap<Hash, Vec<Hash>>,
}

impl TeamGraph {
    /// Start a graph from its sealed root link.
    pub fn create(
        mut body: LinkBody,
        team_keys: &KeysetWithSecrets,
        signing_key: &PrivateKey,
        rng: &Rng,
    ) -> Result<Self, GraphError> {
        body.prev = Vec::new();
        let (encrypted, link) = EncryptedLink::seal(body, team_keys, signing_key, rng)?;

        Ok(Self::from_root(encrypted, link))
    }

    /// Build a graph around an existing root link.
    pub fn from_root(encrypted: EncryptedLink, link: Link) -> Self {
        let root = link.hash;

        let mut graph = Self {
            root,
            links: HashMap::new(),
            encrypted: HashMap::new(),
            children: HashMap::new(),
        };

        graph.children.insert(root, Vec::new());
        graph.links.insert(root, link);
        graph.encrypted.insert(root, encrypted);

        graph
    }

    /// Hash of the root link.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// The current frontier: hashes with no successor, ordered by hash.
    pub fn heads(&self) -> Vec<Hash> {
        let mut heads: Vec<Hash> = self
            .children
            .iter()
            .filter_map(|(hash, children)| children.is_empty().then_some(*hash))
            .collect();
        heads.sort();
        heads
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.links.contains_key(hash)
    }

    pub fn link(&self, hash: &Hash) -> Option<&Link> {
        self.links.get(hash)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn encrypted_link(&self, hash: &Hash) -> Option<&EncryptedLink> {
        self.encrypted.get(hash)
    }

    /// All sealed links, in no particular order.
    pub fn encrypted_links(&self) -> Vec<EncryptedLink> {
        self.encrypted.values().cloned().collect()
    }

    /// Seal a new link whose predecessors are the current heads and insert
    /// it, moving the frontier to the new link.
    pub fn append(
        &mut self,
        mut body: LinkBody,
        team_keys: &KeysetWithSecrets,
        signing_key: &PrivateKey,
        rng: &Rng,
    ) -> Result<Hash, GraphError> {
        body.prev = self.heads();
        let (encrypted, link) = EncryptedLink::seal(body, team_keys, signing_key, rng)?;
        let hash = link.hash;

        self.insert(encrypted, link)?;

        Ok(hash)
    }

    /// Insert a link whose predecessors are all present.
    ///
    /// Returns `false` if the link was already known; duplicate hashes mean
    /// identical content.
    pub fn insert(&mut self, encrypted: EncryptedLink, link: Link) -> Result<bool, GraphError> {
        let hash = encrypted.hash();

        if hash != link.hash {
            return Err(GraphError::HashMismatch(hash, link.hash));
        }

        if self.links.contains_key(&hash) {
            return Ok(false);
        }

        if link.is_root() {
            // There is exactly one root per team; a second one belongs to a
            // different team graph.
            return Err(GraphError::ForeignRoot(hash, self.root));
        }

        for prev in &link.body.prev {
            if !self.links.contains_key(prev) {
                return Err(GraphError::MissingDependency(hash, *prev));
            }
        }

        for prev in &link.body.prev {
            let children = self.children.entry(*prev).or_default();
            children.push(hash);
            children.sort();
        }
        self.children.insert(hash, Vec::new());
        self.links.insert(hash, link);
        self.encrypted.insert(hash, encrypted);

        Ok(true)
    }

    /// Union of two graphs over the same root.
    ///
    /// Idempotent, commutative and associative; returns `true` if any new
    /// link was added.
    pub fn merge(&mut self, other: &TeamGraph) -> Result<bool, GraphError> {
        if other.root != self.root {
            return Err(GraphError::ForeignRoot(other.root, self.root));
        }

        let mut changed = false;
        for link in other.sorted(&HashSet::new(), &HashMap::new()) {
            if self.links.contains_key(&link.hash) {
                continue;
            }

            let encrypted = other
                .encrypted
                .get(&link.hash)
                .ok_or_else(|| GraphError::Corrupt("link without sealed form".to_string()))?;

            changed |= self.insert(encrypted.clone(), link.clone())?;
        }

        Ok(changed)
    }

    /// Edge view of the graph: `prev → link` for every link.
    pub fn to_graph_map(&self) -> DiGraphMap<Hash, ()> {
        let mut map = DiGraphMap::new();

        for link in self.links.values() {
            map.add_node(link.hash);
            for prev in &link.body.prev {
                map.add_edge(*prev, link.hash, ());
            }
        }

        map
    }

    /// All links from which `hash` is reachable.
    pub fn predecessors(&self, hash: Hash) -> HashSet<Hash> {
        let map = self.to_graph_map();
        let reversed = Reversed(&map);

        let mut found = HashSet::new();
        let mut dfs = Dfs::new(&reversed, hash);
        while let Some(node) = dfs.next(&reversed) {
            found.insert(node);
        }
        found.remove(&hash);

        found
    }

    /// All links reachable from `hash`.
    pub fn successors(&self, hash: Hash) -> HashSet<Hash> {
        let map = self.to_graph_map();

        let mut found = HashSet::new();
        let mut dfs = Dfs::new(&map, hash);
        while let Some(node) = dfs.next(&map) {
            found.insert(node);
        }
        found.remove(&hash);

        found
    }

    /// Return `true` if a path leads from `a` to `b`.
    pub fn is_predecessor(&self, a: Hash, b: Hash) -> bool {
        let map = self.to_graph_map();

        let mut dfs = Dfs::new(&map, a);
        while let Some(node) = dfs.next(&map) {
            if node == b && node != a {
                return true;
            }
        }

        false
    }

    /// Deterministic topological order of all links not in `ignored`.
    ///
    /// Among concurrent candidates the author's seniority rank decides,
    /// with the link hash as the final tie-break, so any two peers with the
    /// same link set produce the same sequence.
    pub fn sorted(
        &self,
        ignored: &HashSet<Hash>,
        seniority_rank: &HashMap<String, usize>,
    ) -> Vec<&Link> {
        let mut indegree: HashMap<Hash, usize> = self
            .links
            .values()
            .map(|link| (link.hash, link.body.prev.len()))
            .collect();

        let mut ready: Vec<Hash> = indegree
            .iter()
            .filter_map(|(hash, degree)| (*degree == 0).then_some(*hash))
            .collect();

        let mut sorted = Vec::with_capacity(self.links.len());

        while !ready.is_empty() {
            // Select the candidate with the most senior author; ties go to
            // the smaller hash.
            let (index, _) = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, hash)| {
                    let link = &self.links[*hash];
                    let rank = seniority_rank
                        .get(&link.body.user_id)
                        .copied()
                        .unwrap_or(usize::MAX);
                    (rank, **hash)
                })
                // The loop condition guarantees a candidate.
                .expect("ready set is non-empty");

            let hash = ready.swap_remove(index);
            let link = &self.links[&hash];

            if !ignored.contains(&hash) {
                sorted.push(link);
            }

            if let Some(children) = self.children.get(&hash) {
                for child in children {
                    let degree = indegree
                        .get_mut(child)
                        .expect("every child is a known link");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*child);
                    }
                }
            }
        }

        sorted
    }

    /// Map each selected link to its immediate predecessors.
    ///
    /// Drives incremental sync: peers exchange expanding parent maps until
    /// they agree on a common frontier.
    pub fn parent_map(&self, options: &ParentMapOptions) -> ParentMap {
        if let Some(known) = &options.complement {
            return self
                .links
                .values()
                .filter(|link| !known.contains_key(&link.hash))
                .map(|link| (link.hash, link.body.prev.clone()))
                .collect();
        }

        // The end set excludes itself and everything at or beyond it, so
        // grow it backwards over its own ancestry first.
        let mut end: HashSet<Hash> = options
            .end
            .as_ref()
            .map(|hashes| hashes.iter().copied().collect())
            .unwrap_or_default();
        let mut stack: Vec<Hash> = end
            .iter()
            .copied()
            .filter(|hash| self.links.contains_key(hash))
            .collect();
        while let Some(hash) = stack.pop() {
            for prev in &self.links[&hash].body.prev {
                if end.insert(*prev) {
                    stack.push(*prev);
                }
            }
        }

        // Breadth-first walk backwards from the heads.
        let mut map = ParentMap::new();
        let mut frontier: Vec<Hash> = self
            .heads()
            .into_iter()
            .filter(|hash| !end.contains(hash))
            .collect();
        let mut hops = 0;

        while !frontier.is_empty() {
            if let Some(depth) = options.depth {
                if hops >= depth {
                    break;
                }
            }
            hops += 1;

            let mut next = Vec::new();
            for hash in frontier {
                if map.contains_key(&hash) {
                    continue;
                }

                let link = &self.links[&hash];
                map.insert(hash, link.body.prev.clone());

                for prev in &link.body.prev {
                    if !end.contains(prev) && !map.contains_key(prev) {
                        next.push(*prev);
                    }
                }
            }
            frontier = next;
        }

        map
    }

    /// Serialize the graph as a self-describing payload.
    pub fn save(&self) -> Result<Vec<u8>, GraphError> {
        let serialized = SerializedGraph {
            version: GRAPH_FORMAT_VERSION,
            root: self.root,
            heads: self.heads(),
            links: self
                .encrypted
                .iter()
                .map(|(hash, link)| (*hash, link.clone()))
                .collect(),
            child_map: self
                .children
                .iter()
                .map(|(hash, children)| (*hash, children.clone()))
                .collect(),
        };

        Ok(encode_cbor(&serialized)?)
    }

    /// Rebuild a graph from its serialized form, decrypting every link with
    /// the provided team keyring.
    ///
    /// A link which fails to decrypt or verify is a fatal graph-integrity
    /// error.
    pub fn load(bytes: &[u8], keyring: &Keyring) -> Result<Self, GraphError> {
        let serialized: SerializedGraph = decode_cbor(bytes)?;

        if serialized.version != GRAPH_FORMAT_VERSION {
            return Err(GraphError::UnsupportedVersion(serialized.version));
        }

        let root_encrypted = serialized
            .links
            .get(&serialized.root)
            .ok_or_else(|| GraphError::Corrupt("root link missing".to_string()))?;
        let root_link = root_encrypted.open(keyring)?;
        if !root_link.is_root() {
            return Err(GraphError::Corrupt(
                "root link has predecessors".to_string(),
            ));
        }

        let mut graph = Self::from_root(root_encrypted.clone(), root_link);

        // Insert in dependency order: a link is ready once all its
        // predecessors are in.
        let mut pending: Vec<(Hash, EncryptedLink)> = serialized
            .links
            .iter()
            .filter(|(hash, _)| **hash != serialized.root)
            .map(|(hash, link)| (*hash, link.clone()))
            .collect();

        while !pending.is_empty() {
            let mut progressed = false;
            let mut remaining = Vec::new();

            for (hash, encrypted) in pending {
                let link = encrypted.open(keyring)?;
                if link
                    .body
                    .prev
                    .iter()
                    .all(|prev| graph.contains(prev))
                {
                    graph.insert(encrypted, link)?;
                    progressed = true;
                } else {
                    remaining.push((hash, encrypted));
                }
            }

            if !progressed {
                return Err(GraphError::Corrupt(
                    "unresolvable link dependencies".to_string(),
                ));
            }
            pending = remaining;
        }

        if graph.heads() != serialized.heads {
            return Err(GraphError::Corrupt(
                "serialized heads do not match graph".to_string(),
            ));
        }

        Ok(graph)
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedGraph {
    version: u8,
    root: Hash,
    heads: Vec<Hash>,
    links: BTreeMap<Hash, EncryptedLink>,
    child_map: BTreeMap<Hash, Vec<Hash>>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph format version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("link {0} references unknown predecessor {1}")]
    MissingDependency(Hash, Hash),

    #[error("sealed link hash {0} does not match link {1}")]
    HashMismatch(Hash, Hash),

    #[error("root link {0} belongs to a different team than {1}")]
    ForeignRoot(Hash, Hash),

    #[error("team graph is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Encode(#[from] huddle_core::cbor::EncodeError),

    #[error(transparent)]
    Decode(#[from] huddle_core::cbor::DecodeError),
}

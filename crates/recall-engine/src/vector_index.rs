//! # Hierarchical proximity-graph index
//!
//! Approximate nearest-neighbor search over fixed-dimension vectors using a
//! multi-layer navigable small-world graph (HNSW), scored by cosine
//! similarity.
//!
//! ```text
//!  layer 2   E ─────────────── F               sparse, long hops
//!            │                 │
//!  layer 1   E ──── B ──────── F ──── H
//!            │      │          │      │
//!  layer 0   E ─ A ─ B ─ C ─ D ─ F ─ G ─ H     dense, every node
//! ```
//!
//! Nodes live in an arena and refer to each other by slot number, never by
//! reference. Each node's level is derived from a hash of its id, so the same
//! inserts in the same order always produce the same graph.
//!
//! ## Concurrency
//!
//! Searches and the expensive half of an insert (finding neighbors) share
//! the graph read lock. The write lock is only taken to append a node, which
//! arrives with its own neighbor lists already built. Back-links to existing
//! nodes are then published one node at a time: the replacement list is
//! computed under that node's lock and swapped in whole, so a traversal sees
//! either the old list or the new one.
//!
//! ## Deletion
//!
//! `remove` tombstones a node. Tombstones keep routing traffic but never
//! appear in results; `compact` rebuilds the graph from live nodes.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use recall_core::{EngineConfig, RecallError, RecallResult, Scope};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

const MAX_LEVEL: usize = 16;

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn normalized(vector: &[f32]) -> Box<[f32]> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|x| x / norm).collect()
    } else {
        vector.into()
    }
}

/// splitmix64 finalizer.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Graph parameters for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndexConfig {
    /// Vector dimension.
    pub dimension: usize,
    /// Max links per node on upper layers (M); layer 0 allows `2 * M`.
    pub max_connections: usize,
    /// Frontier width while inserting.
    pub ef_construction: usize,
    /// Frontier width when a search does not specify one.
    pub ef_search: usize,
    /// Scopes at or below this size are scanned exhaustively.
    pub brute_force_threshold: usize,
}

impl VectorIndexConfig {
    /// Derives the graph parameters from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            dimension: config.dimension,
            max_connections: config.index.max_connections,
            ef_construction: config.index.ef_construction,
            ef_search: config.index.ef_search,
            brute_force_threshold: config.index.brute_force_threshold,
        }
    }

    /// Same parameters with a different default search width.
    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search.max(1);
        self
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections * 2
        } else {
            self.max_connections
        }
    }

    fn level_multiplier(&self) -> f64 {
        1.0 / (self.max_connections.max(2) as f64).ln()
    }
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// One search hit: external id and cosine similarity (higher is closer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// External id of the indexed item.
    pub id: Uuid,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Restricts the candidate set of a search.
///
/// The filter decides which nodes may enter the result set during
/// traversal; it is not applied to a finished top-k list. Scope filters
/// additionally let the index scan small scopes exhaustively.
#[derive(Clone)]
pub enum CandidateFilter {
    /// Only nodes tagged with this scope.
    Scope(Scope),
    /// Arbitrary predicate over `(id, scope)`.
    Predicate(Arc<dyn Fn(Uuid, Scope) -> bool + Send + Sync>),
}

impl CandidateFilter {
    /// Builds a predicate filter.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(Uuid, Scope) -> bool + Send + Sync + 'static,
    {
        CandidateFilter::Predicate(Arc::new(f))
    }

    fn admits(&self, node: &Node) -> bool {
        match self {
            CandidateFilter::Scope(scope) => node.scope == *scope,
            CandidateFilter::Predicate(f) => f(node.id, node.scope),
        }
    }
}

impl fmt::Debug for CandidateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateFilter::Scope(scope) => f.debug_tuple("Scope").field(scope).finish(),
            CandidateFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Counters describing the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Nodes that can appear in results.
    pub live: usize,
    /// Nodes removed but not yet compacted away.
    pub tombstones: usize,
    /// Highest occupied layer.
    pub max_level: usize,
}

impl IndexStats {
    /// Share of tombstoned nodes in the arena.
    pub fn tombstone_ratio(&self) -> f32 {
        let total = self.live + self.tombstones;
        if total == 0 {
            0.0
        } else {
            self.tombstones as f32 / total as f32
        }
    }
}

struct Node {
    id: Uuid,
    scope: Scope,
    vector: Box<[f32]>,
    level: usize,
    /// One published edge list per layer `0..=level`.
    links: Vec<RwLock<Arc<[u32]>>>,
    deleted: AtomicBool,
}

impl Node {
    fn links_at(&self, layer: usize) -> Option<Arc<[u32]>> {
        self.links.get(layer).map(|l| Arc::clone(&l.read()))
    }

    fn is_live(&self) -> bool {
        !self.deleted.load(AtomicOrdering::Acquire)
    }
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Arc<Node>>,
    entry: Option<u32>,
    max_level: usize,
    /// Live id -> slot.
    slots: HashMap<Uuid, u32>,
    /// Live slots per scope.
    scopes: HashMap<Scope, BTreeSet<u32>>,
    tombstones: usize,
    /// Bumped whenever slot numbers are invalidated (compaction, clear).
    generation: u64,
}

impl Graph {
    fn tombstone(&mut self, id: Uuid) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };
        let Some(node) = self.nodes.get(slot as usize).cloned() else {
            return false;
        };
        node.deleted.store(true, AtomicOrdering::Release);
        if let Some(set) = self.scopes.get_mut(&node.scope) {
            set.remove(&slot);
            if set.is_empty() {
                self.scopes.remove(&node.scope);
            }
        }
        self.tombstones += 1;
        true
    }

    fn node(&self, slot: u32) -> RecallResult<&Arc<Node>> {
        self.nodes.get(slot as usize).ok_or_else(|| {
            RecallError::IndexCorrupted(format!(
                "dangling edge to slot {slot} (arena holds {})",
                self.nodes.len()
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    score: f32,
    slot: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Higher score is "greater"; on equal scores the lower slot wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

/// Neighbor lists chosen for a node before it is published.
struct Placement {
    /// Selected neighbors per layer `0..=min(level, max_level)`.
    layers: Vec<Vec<Scored>>,
    generation: u64,
}

/// Approximate nearest-neighbor index over one collection.
pub struct VectorIndex {
    config: VectorIndexConfig,
    graph: RwLock<Graph>,
}

impl VectorIndex {
    /// Creates an empty index.
    pub fn new(config: VectorIndexConfig) -> Self {
        Self {
            config,
            graph: RwLock::new(Graph::default()),
        }
    }

    /// The graph parameters.
    pub fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    /// Inserts a new vector. Fails if `id` is already live or the vector has
    /// the wrong dimension.
    pub fn insert(&self, id: Uuid, scope: Scope, vector: &[f32]) -> RecallResult<()> {
        RecallError::check_dimension(self.config.dimension, vector.len())?;
        if self.graph.read().slots.contains_key(&id) {
            return Err(RecallError::InvalidInput(format!("{id} is already indexed")));
        }
        self.link_new_node(id, scope, normalized(vector), false)
    }

    /// Inserts `id`, tombstoning any previous node for it.
    pub fn upsert(&self, id: Uuid, scope: Scope, vector: &[f32]) -> RecallResult<()> {
        RecallError::check_dimension(self.config.dimension, vector.len())?;
        self.link_new_node(id, scope, normalized(vector), true)
    }

    /// Tombstones `id`. Returns `false` if it was not live.
    pub fn remove(&self, id: Uuid) -> bool {
        self.graph.write().tombstone(id)
    }

    /// Returns up to `k` nearest live vectors, best first.
    ///
    /// `ef_search` bounds the candidate frontier (clamped to at least `k`);
    /// larger values trade latency for recall. Equal scores are ordered by id.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        filter: Option<&CandidateFilter>,
    ) -> RecallResult<Vec<Neighbor>> {
        RecallError::check_dimension(self.config.dimension, query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = normalized(query);
        let graph = self.graph.read();
        let Some(entry) = graph.entry else {
            return Ok(Vec::new());
        };
        let ef = ef_search.max(k);

        let hits = match filter {
            Some(CandidateFilter::Scope(scope)) => {
                let Some(slots) = graph.scopes.get(scope) else {
                    return Ok(Vec::new());
                };
                if slots.len() <= self.config.brute_force_threshold.max(ef) {
                    debug!(scope = %scope, candidates = slots.len(), "exhaustive scoped search");
                    self.scan(&graph, &query, slots.iter().copied())?
                } else {
                    self.traverse(&graph, &query, entry, ef, filter)?
                }
            }
            _ => self.traverse(&graph, &query, entry, ef, filter)?,
        };

        let mut out: Vec<Neighbor> = hits
            .into_iter()
            .map(|s| graph.node(s.slot).map(|n| Neighbor { id: n.id, score: s.score }))
            .collect::<RecallResult<_>>()?;
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        out.truncate(k);
        Ok(out)
    }

    /// Searches with the configured default frontier width.
    pub fn search_default(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&CandidateFilter>,
    ) -> RecallResult<Vec<Neighbor>> {
        self.search(query, k, self.config.ef_search, filter)
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: Uuid) -> bool {
        self.graph.read().slots.contains_key(&id)
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.graph.read().slots.len()
    }

    /// Whether the index has no live vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live and tombstoned node counts.
    pub fn stats(&self) -> IndexStats {
        let graph = self.graph.read();
        IndexStats {
            live: graph.slots.len(),
            tombstones: graph.tombstones,
            max_level: graph.max_level,
        }
    }

    /// Drops every node.
    pub fn clear(&self) {
        let mut graph = self.graph.write();
        let generation = graph.generation + 1;
        *graph = Graph {
            generation,
            ..Graph::default()
        };
    }

    /// Rebuilds the graph from live nodes, dropping tombstones.
    ///
    /// Searches keep running against the old graph while the new one is
    /// built; inserts wait until the swap.
    pub fn compact(&self) -> RecallResult<usize> {
        let graph = self.graph.upgradable_read();
        let dropped = graph.tombstones;
        if dropped == 0 {
            return Ok(0);
        }

        let fresh = VectorIndex::new(self.config.clone());
        for node in graph.nodes.iter().filter(|n| n.is_live()) {
            fresh.link_new_node(node.id, node.scope, node.vector.clone(), false)?;
        }
        let mut rebuilt = fresh.graph.into_inner();

        let mut graph = RwLockUpgradableReadGuard::upgrade(graph);
        rebuilt.generation = graph.generation + 1;
        *graph = rebuilt;
        info!(dropped, live = graph.slots.len(), "vector index compacted");
        Ok(dropped)
    }

    /// Checks structural invariants: every edge points inside the arena at a
    /// node tall enough for its layer, and the id map agrees with the arena.
    pub fn verify(&self) -> RecallResult<()> {
        let graph = self.graph.read();
        let len = graph.nodes.len();
        match graph.entry {
            None if len > 0 => {
                return Err(RecallError::IndexCorrupted("missing entry point".into()));
            }
            Some(entry) if entry as usize >= len => {
                return Err(RecallError::IndexCorrupted(format!("entry point {entry} out of range")));
            }
            _ => {}
        }
        for (slot, node) in graph.nodes.iter().enumerate() {
            if node.links.len() != node.level + 1 {
                return Err(RecallError::IndexCorrupted(format!(
                    "slot {slot} has {} layers for level {}",
                    node.links.len(),
                    node.level
                )));
            }
            for layer in 0..=node.level {
                for &target in node.links_at(layer).unwrap_or_else(|| Arc::from([])).iter() {
                    let target_node = graph.node(target)?;
                    if target_node.level < layer {
                        return Err(RecallError::IndexCorrupted(format!(
                            "edge {slot} -> {target} on layer {layer} exceeds target level {}",
                            target_node.level
                        )));
                    }
                }
            }
        }
        for (id, &slot) in &graph.slots {
            let node = graph.node(slot)?;
            if node.id != *id || !node.is_live() {
                return Err(RecallError::IndexCorrupted(format!(
                    "id map entry {id} -> {slot} points at a stale node"
                )));
            }
        }
        Ok(())
    }

    /// Serializable copy of the arena.
    pub fn snapshot(&self) -> IndexSnapshot {
        let graph = self.graph.read();
        IndexSnapshot {
            dimension: self.config.dimension,
            entry: graph.entry,
            max_level: graph.max_level,
            nodes: graph
                .nodes
                .iter()
                .map(|n| NodeSnapshot {
                    id: n.id,
                    scope: n.scope,
                    vector: n.vector.to_vec(),
                    level: n.level,
                    links: (0..=n.level)
                        .map(|l| n.links_at(l).map(|a| a.to_vec()).unwrap_or_default())
                        .collect(),
                    deleted: !n.is_live(),
                })
                .collect(),
        }
    }

    /// Restores an index from a snapshot and verifies it.
    pub fn from_snapshot(config: VectorIndexConfig, snapshot: IndexSnapshot) -> RecallResult<Self> {
        RecallError::check_dimension(config.dimension, snapshot.dimension)?;
        let mut graph = Graph {
            entry: snapshot.entry,
            max_level: snapshot.max_level,
            ..Graph::default()
        };
        for (slot, node) in snapshot.nodes.into_iter().enumerate() {
            RecallError::check_dimension(config.dimension, node.vector.len())?;
            let slot = slot as u32;
            if !node.deleted {
                graph.slots.insert(node.id, slot);
                graph.scopes.entry(node.scope).or_default().insert(slot);
            } else {
                graph.tombstones += 1;
            }
            graph.nodes.push(Arc::new(Node {
                id: node.id,
                scope: node.scope,
                vector: node.vector.into_boxed_slice(),
                level: node.level,
                links: node
                    .links
                    .into_iter()
                    .map(|l| RwLock::new(Arc::from(l)))
                    .collect(),
                deleted: AtomicBool::new(node.deleted),
            }));
        }
        let index = Self {
            config,
            graph: RwLock::new(graph),
        };
        index.verify()?;
        Ok(index)
    }

    fn level_for(&self, id: Uuid) -> usize {
        // v4 ids carry fixed version and variant bits; mix all 128 bits so the
        // 53 bits drawn here are uniform.
        let (hi, lo) = id.as_u64_pair();
        let bits = mix64(hi ^ mix64(lo)) >> 11;
        let u = (bits as f64 + 1.0) / ((1u64 << 53) as f64 + 2.0);
        let level = (-u.ln() * self.config.level_multiplier()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Places and publishes a node. The live-id check is repeated under the
    /// write lock, so two racing writers for one id leave exactly one node.
    fn link_new_node(&self, id: Uuid, scope: Scope, vector: Box<[f32]>, replace: bool) -> RecallResult<()> {
        let level = self.level_for(id);
        loop {
            let placement = {
                let graph = self.graph.read();
                self.place(&graph, &vector, level)?
            };

            let mut graph = self.graph.write();
            if graph.generation != placement.generation {
                // Slots were renumbered underneath us; place again.
                continue;
            }
            if graph.slots.contains_key(&id) {
                if !replace {
                    return Err(RecallError::InvalidInput(format!("{id} is already indexed")));
                }
                graph.tombstone(id);
            }
            let slot = graph.nodes.len() as u32;
            let links = (0..=level)
                .map(|layer| {
                    let list: Vec<u32> = placement
                        .layers
                        .get(layer)
                        .map(|sel| sel.iter().map(|s| s.slot).collect())
                        .unwrap_or_default();
                    RwLock::new(Arc::from(list))
                })
                .collect();
            graph.nodes.push(Arc::new(Node {
                id,
                scope,
                vector,
                level,
                links,
                deleted: AtomicBool::new(false),
            }));
            graph.slots.insert(id, slot);
            graph.scopes.entry(scope).or_default().insert(slot);
            if graph.entry.is_none() || level > graph.max_level {
                graph.entry = Some(slot);
                graph.max_level = level;
            }

            let graph = RwLockWriteGuard::downgrade(graph);
            for (layer, selected) in placement.layers.iter().enumerate() {
                for neighbor in selected {
                    self.add_back_link(&graph, neighbor.slot, slot, neighbor.score, layer)?;
                }
            }
            return Ok(());
        }
    }

    /// Finds neighbor lists for a vector about to be inserted at `level`.
    fn place(&self, graph: &Graph, vector: &[f32], level: usize) -> RecallResult<Placement> {
        let mut layers = Vec::new();
        if let Some(entry) = graph.entry {
            let mut ep = Scored {
                score: dot(vector, &graph.node(entry)?.vector),
                slot: entry,
            };
            for layer in ((level + 1)..=graph.max_level).rev() {
                ep = self.greedy_step(graph, vector, ep, layer)?;
            }
            let mut entry_points = vec![ep];
            layers = vec![Vec::new(); level.min(graph.max_level) + 1];
            for layer in (0..=level.min(graph.max_level)).rev() {
                let found = self.search_layer(
                    graph,
                    vector,
                    &entry_points,
                    self.config.ef_construction,
                    layer,
                    &|n: &Node| n.is_live(),
                )?;
                layers[layer] = self.select_neighbors(graph, &found, self.config.max_links(layer))?;
                if !found.is_empty() {
                    entry_points = found;
                }
            }
        }
        Ok(Placement {
            layers,
            generation: graph.generation,
        })
    }

    /// Adds `new_slot` to `target`'s list on `layer`, pruning if over capacity,
    /// and publishes the result as a fresh list.
    fn add_back_link(
        &self,
        graph: &Graph,
        target: u32,
        new_slot: u32,
        score: f32,
        layer: usize,
    ) -> RecallResult<()> {
        let node = graph.node(target)?;
        let Some(lock) = node.links.get(layer) else {
            return Err(RecallError::IndexCorrupted(format!(
                "slot {target} selected on layer {layer} above its level {}",
                node.level
            )));
        };
        let cap = self.config.max_links(layer);

        let mut list = lock.write();
        if list.contains(&new_slot) {
            return Ok(());
        }
        let next: Vec<u32> = if list.len() < cap {
            list.iter().copied().chain(std::iter::once(new_slot)).collect()
        } else {
            let mut candidates = Vec::with_capacity(list.len() + 1);
            for &slot in list.iter() {
                candidates.push(Scored {
                    score: dot(&node.vector, &graph.node(slot)?.vector),
                    slot,
                });
            }
            candidates.push(Scored { score, slot: new_slot });
            candidates.sort_by(|a, b| b.cmp(a));
            self.select_neighbors(graph, &candidates, cap)?
                .into_iter()
                .map(|s| s.slot)
                .collect()
        };
        *list = Arc::from(next);
        Ok(())
    }

    /// Single-best greedy walk on one layer.
    fn greedy_step(&self, graph: &Graph, query: &[f32], start: Scored, layer: usize) -> RecallResult<Scored> {
        let mut best = start;
        loop {
            let mut improved = false;
            let links = graph.node(best.slot)?.links_at(layer).unwrap_or_else(|| Arc::from([]));
            for &slot in links.iter() {
                let score = dot(query, &graph.node(slot)?.vector);
                if score > best.score {
                    best = Scored { score, slot };
                    improved = true;
                }
            }
            if !improved {
                return Ok(best);
            }
        }
    }

    /// Beam search on one layer. Every reachable node routes traffic; only
    /// nodes accepted by `admit` enter the result set.
    fn search_layer(
        &self,
        graph: &Graph,
        query: &[f32],
        entry_points: &[Scored],
        ef: usize,
        layer: usize,
        admit: &dyn Fn(&Node) -> bool,
    ) -> RecallResult<Vec<Scored>> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for ep in entry_points {
            if visited.insert(ep.slot) {
                candidates.push(*ep);
                if admit(graph.node(ep.slot)?) {
                    results.push(Reverse(*ep));
                }
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(current) = candidates.pop() {
            if results.len() >= ef {
                if let Some(Reverse(worst)) = results.peek() {
                    if current.score < worst.score {
                        break;
                    }
                }
            }

            let links = graph.node(current.slot)?.links_at(layer).unwrap_or_else(|| Arc::from([]));
            for &slot in links.iter() {
                if !visited.insert(slot) {
                    continue;
                }
                let node = graph.node(slot)?;
                let scored = Scored {
                    score: dot(query, &node.vector),
                    slot,
                };
                let worst = results.peek().map(|Reverse(w)| w.score);
                if results.len() < ef || worst.is_some_and(|w| scored.score > w) {
                    candidates.push(scored);
                    if admit(node) {
                        results.push(Reverse(scored));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        out.sort_by(|a, b| b.cmp(a));
        Ok(out)
    }

    /// Full search: greedy descent through the upper layers, then a filtered
    /// beam search on layer 0.
    fn traverse(
        &self,
        graph: &Graph,
        query: &[f32],
        entry: u32,
        ef: usize,
        filter: Option<&CandidateFilter>,
    ) -> RecallResult<Vec<Scored>> {
        let mut ep = Scored {
            score: dot(query, &graph.node(entry)?.vector),
            slot: entry,
        };
        for layer in (1..=graph.max_level).rev() {
            ep = self.greedy_step(graph, query, ep, layer)?;
        }
        let admit = |n: &Node| n.is_live() && filter.map_or(true, |f| f.admits(n));
        self.search_layer(graph, query, &[ep], ef, 0, &admit)
    }

    /// Exact scoring of an explicit candidate set.
    fn scan(&self, graph: &Graph, query: &[f32], slots: impl Iterator<Item = u32>) -> RecallResult<Vec<Scored>> {
        let mut out = Vec::new();
        for slot in slots {
            let node = graph.node(slot)?;
            if node.is_live() {
                out.push(Scored {
                    score: dot(query, &node.vector),
                    slot,
                });
            }
        }
        Ok(out)
    }

    /// Neighbor-selection heuristic: walk candidates best-first and keep one
    /// only if it is closer to the base than to every neighbor already kept,
    /// then top up with the best of the rest.
    fn select_neighbors(&self, graph: &Graph, candidates: &[Scored], m: usize) -> RecallResult<Vec<Scored>> {
        let mut selected: Vec<Scored> = Vec::with_capacity(m);
        let mut skipped: Vec<Scored> = Vec::new();
        for candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let vector = &graph.node(candidate.slot)?.vector;
            let mut diverse = true;
            for kept in &selected {
                if dot(vector, &graph.node(kept.slot)?.vector) > candidate.score {
                    diverse = false;
                    break;
                }
            }
            if diverse {
                selected.push(*candidate);
            } else {
                skipped.push(*candidate);
            }
        }
        for candidate in skipped {
            if selected.len() >= m {
                break;
            }
            selected.push(candidate);
        }
        Ok(selected)
    }

    /// Points every layer-0 edge list past the end of the arena.
    #[cfg(test)]
    pub(crate) fn inject_dangling_edge(&self) {
        let graph = self.graph.read();
        let bogus = graph.nodes.len() as u32 + 7;
        for node in &graph.nodes {
            *node.links[0].write() = Arc::from(vec![bogus]);
        }
    }
}

/// Serializable form of a [`VectorIndex`] arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Vector dimension.
    pub dimension: usize,
    /// Entry-point slot.
    pub entry: Option<u32>,
    /// Highest occupied layer.
    pub max_level: usize,
    /// Arena contents in slot order.
    pub nodes: Vec<NodeSnapshot>,
}

/// One arena slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// External id.
    pub id: Uuid,
    /// Isolation scope.
    pub scope: Scope,
    /// Normalized vector.
    pub vector: Vec<f32>,
    /// Top layer of the node.
    pub level: usize,
    /// Edge lists for layers `0..=level`.
    pub links: Vec<Vec<u32>>,
    /// Tombstone flag.
    pub deleted: bool,
}

//! Identity resolution: partition [`ArticleRecord`]s into [`MatchGroup`]s.
//!
//! Two records match when, in priority order:
//!
//! 1. they carry the same canonical value under the same identifier scheme, or
//! 2. their title keys are equal and they share at least
//!    [`ResolverConfig::min_shared_authors`] normalized author names.
//!
//! Matching is closed transitively with a union-find over an index arena.
//! Records are sorted by record key before any work is done, so the
//! partition does not depend on the order records were fetched in.
//!
//! Candidate pairs come from blocking: only records that share an
//! identifier value or a title key are ever compared.
//!
//! # Chain depth
//!
//! Transitive closure can chain weakly related records into one group
//! (`A ~ B ~ C ~ D` where `A` and `D` have nothing in common). With
//! [`ResolverConfig::max_chain_depth`] set, an edge joining two clusters is
//! rejected when the match graph induced on the joined members would contain
//! two records more than that many hops apart. Identifier edges are
//! considered before title edges, each in record-key order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{ArticleRecord, MatchGroup};

/// Resolver tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Authors two equal-title records must share to match.
    pub min_shared_authors: usize,
    /// Maximum hop distance between any two members of a group.
    /// `None` keeps the full transitive closure.
    pub max_chain_depth: Option<usize>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_shared_authors: 1,
            max_chain_depth: None,
        }
    }
}

/// Why two records matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Identifier,
    TitleAndAuthors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Edge {
    kind: MatchKind,
    a: usize,
    b: usize,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Partition `records` into match groups.
    ///
    /// Every input record appears in exactly one group. Groups are returned
    /// ordered by their smallest record key.
    pub fn resolve(&self, records: &[ArticleRecord]) -> Vec<MatchGroup> {
        let mut sorted: Vec<&ArticleRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.record_key());

        let author_keys: Vec<BTreeSet<String>> =
            sorted.iter().map(|r| r.author_keys()).collect();
        let edges = self.candidate_edges(&sorted, &author_keys);

        let mut sets = DisjointSets::new(sorted.len());
        match self.config.max_chain_depth {
            None => {
                for edge in &edges {
                    sets.union(edge.a, edge.b);
                }
            }
            Some(max_depth) => {
                let mut graph = DepthLimitedGraph::new(sorted.len(), &edges, max_depth);
                for edge in &edges {
                    graph.try_connect(&mut sets, edge.a, edge.b);
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<ArticleRecord>> = BTreeMap::new();
        for (idx, record) in sorted.iter().enumerate() {
            clusters
                .entry(sets.find(idx))
                .or_default()
                .push((*record).clone());
        }

        let mut groups: Vec<MatchGroup> = clusters
            .into_values()
            .filter_map(MatchGroup::new)
            .collect();
        groups.sort_by_key(|g| g.anchor_key());
        groups
    }

    /// Matching pairs, identifier matches first, each kind in index order.
    fn candidate_edges(
        &self,
        records: &[&ArticleRecord],
        author_keys: &[BTreeSet<String>],
    ) -> Vec<Edge> {
        let mut by_identifier: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        let mut by_title: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            for (scheme, value) in &record.identifiers {
                by_identifier
                    .entry((scheme.as_str(), value.as_str()))
                    .or_default()
                    .push(idx);
            }
            by_title.entry(record.title_key.as_str()).or_default().push(idx);
        }

        let mut edges = BTreeSet::new();
        for block in by_identifier.values() {
            for_each_pair(block, |a, b| {
                edges.insert(Edge {
                    kind: MatchKind::Identifier,
                    a,
                    b,
                });
            });
        }

        let mut seen_pairs: BTreeSet<(usize, usize)> =
            edges.iter().map(|e| (e.a, e.b)).collect();
        for block in by_title.values() {
            for_each_pair(block, |a, b| {
                if seen_pairs.contains(&(a, b)) {
                    return;
                }
                let shared = author_keys[a].intersection(&author_keys[b]).count();
                if shared >= self.config.min_shared_authors {
                    seen_pairs.insert((a, b));
                    edges.insert(Edge {
                        kind: MatchKind::TitleAndAuthors,
                        a,
                        b,
                    });
                }
            });
        }

        edges.into_iter().collect()
    }
}

/// Calls `f(a, b)` with `a < b` for every pair in an ascending index block.
fn for_each_pair(block: &[usize], mut f: impl FnMut(usize, usize)) {
    for (i, &a) in block.iter().enumerate() {
        for &b in &block[i + 1..] {
            f(a, b);
        }
    }
}

/// Union-find over `0..n` with union by rank and path compression.
#[derive(Debug)]
struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns the new root, or `None` if already joined.
    fn union(&mut self, a: usize, b: usize) -> Option<usize> {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return None;
        }
        let root = match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => {
                self.parent[ra] = rb;
                rb
            }
            std::cmp::Ordering::Greater => {
                self.parent[rb] = ra;
                ra
            }
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
                ra
            }
        };
        Some(root)
    }
}

/// Clusters whose induced match graph must stay within `max_depth` hops.
struct DepthLimitedGraph {
    adjacency: Vec<Vec<usize>>,
    members: HashMap<usize, Vec<usize>>,
    max_depth: usize,
}

impl DepthLimitedGraph {
    fn new(n: usize, edges: &[Edge], max_depth: usize) -> Self {
        let mut adjacency = vec![Vec::new(); n];
        for edge in edges {
            adjacency[edge.a].push(edge.b);
            adjacency[edge.b].push(edge.a);
        }
        Self {
            adjacency,
            members: (0..n).map(|i| (i, vec![i])).collect(),
            max_depth,
        }
    }

    /// Join the clusters of `a` and `b` unless the result would be too wide.
    fn try_connect(&mut self, sets: &mut DisjointSets, a: usize, b: usize) -> bool {
        let (ra, rb) = (sets.find(a), sets.find(b));
        if ra == rb {
            return true;
        }

        let mut joined = self.members.get(&ra).cloned().unwrap_or_default();
        joined.extend(self.members.get(&rb).into_iter().flatten().copied());
        if self.diameter(&joined) > self.max_depth {
            return false;
        }

        self.members.remove(&ra);
        self.members.remove(&rb);
        if let Some(root) = sets.union(a, b) {
            self.members.insert(root, joined);
        }
        true
    }

    /// Longest shortest path within the subgraph induced by `nodes`.
    fn diameter(&self, nodes: &[usize]) -> usize {
        let inside: HashSet<usize> = nodes.iter().copied().collect();
        nodes
            .iter()
            .map(|&start| self.eccentricity(start, &inside))
            .max()
            .unwrap_or(0)
    }

    fn eccentricity(&self, start: usize, inside: &HashSet<usize>) -> usize {
        let mut dist = HashMap::from([(start, 0usize)]);
        let mut queue = VecDeque::from([start]);
        let mut farthest = 0;
        while let Some(node) = queue.pop_front() {
            let d = dist[&node];
            farthest = farthest.max(d);
            for &next in &self.adjacency[node] {
                if inside.contains(&next) && !dist.contains_key(&next) {
                    dist.insert(next, d + 1);
                    queue.push_back(next);
                }
            }
        }
        farthest
    }
}

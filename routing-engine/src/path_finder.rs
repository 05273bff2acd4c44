//! K-shortest path search (Yen) over the live mesh
//!
//! Edge weights are the Heuristic Settlement Score. Only active nodes and
//! edges are traversable, and a node whose circuit is open is skipped even
//! when the topology marks it active. Every returned path is simple and
//! within the hop bound.

use crate::mesh::{Edge, EdgeId, MeshSnapshot, MeshStore};
use crate::scoring::ScoringWeights;
use crate::{Error, Result, MAX_CANDIDATE_PATHS};
use protocol_core::NodeId;
use risk_engine::CircuitBreakerRegistry;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Search parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    /// Start node
    pub source: NodeId,
    /// End node
    pub destination: NodeId,
    /// Maximum edges in a path
    pub max_hops: usize,
    /// Nodes that may not appear in a path (the source is exempt)
    pub excluded: HashSet<NodeId>,
    /// Edges with less liquidity are not traversable
    pub min_liquidity: u64,
    /// Maximum paths returned (capped at [`MAX_CANDIDATE_PATHS`])
    pub limit: usize,
    /// Skip open circuits and weigh integrity; off ranks by topology alone
    pub consult_health: bool,
}

impl PathQuery {
    /// Query with no exclusions and the default path limit
    pub fn new(source: NodeId, destination: NodeId, max_hops: usize) -> Self {
        Self {
            source,
            destination,
            max_hops,
            excluded: HashSet::new(),
            min_liquidity: 0,
            limit: MAX_CANDIDATE_PATHS,
            consult_health: true,
        }
    }

    /// Exclude nodes
    pub fn excluding(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.excluded.extend(nodes);
        self
    }

    /// Require edges able to carry `amount`
    pub fn with_min_liquidity(mut self, amount: u64) -> Self {
        self.min_liquidity = amount;
        self
    }

    /// Limit the number of paths
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Rank as if every node were healthy
    pub fn ignoring_health(mut self) -> Self {
        self.consult_health = false;
        self
    }
}

/// One edge of a candidate path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathHop {
    /// Edge taken
    pub edge_id: EdgeId,
    /// Sending node
    pub source: NodeId,
    /// Receiving node
    pub target: NodeId,
    /// Base fee
    pub fee_bps: u32,
    /// Latency estimate
    pub latency_ms: u64,
    /// Volatility penalty of the sending node
    pub volatility: f64,
    /// Composite weight
    pub weight: f64,
}

/// Ranked path from source to destination; immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePath {
    /// Nodes, source first
    pub nodes: Vec<NodeId>,
    /// Edges with per-hop detail
    pub hops: Vec<PathHop>,
    /// Sum of base fees
    pub total_fee_bps: u32,
    /// Sum of latency estimates
    pub total_latency_ms: u64,
    /// Sum of volatility penalties
    pub total_volatility: f64,
    /// Sum of edge weights
    pub score: f64,
}

impl CandidatePath {
    fn from_edges(graph: &Graph, indices: &[usize]) -> Self {
        let mut nodes = Vec::with_capacity(indices.len() + 1);
        let mut hops = Vec::with_capacity(indices.len());
        for (i, &idx) in indices.iter().enumerate() {
            let scored = &graph.edges[idx];
            if i == 0 {
                nodes.push(scored.edge.source.clone());
            }
            nodes.push(scored.edge.target.clone());
            hops.push(PathHop {
                edge_id: scored.edge.id.clone(),
                source: scored.edge.source.clone(),
                target: scored.edge.target.clone(),
                fee_bps: scored.edge.base_fee_bps,
                latency_ms: scored.edge.latency_ms,
                volatility: scored.volatility,
                weight: scored.weight,
            });
        }
        Self {
            nodes,
            total_fee_bps: hops.iter().map(|h| h.fee_bps).sum(),
            total_latency_ms: hops.iter().map(|h| h.latency_ms).sum(),
            total_volatility: hops.iter().map(|h| h.volatility).sum(),
            score: hops.iter().map(|h| h.weight).sum(),
            hops,
        }
    }

    /// Lexical identifier, e.g. `A->B->D`
    pub fn id(&self) -> String {
        self.nodes
            .iter()
            .map(NodeId::as_str)
            .collect::<Vec<_>>()
            .join("->")
    }

    /// Number of edges
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Whether `node` is on the path
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    fn edge_ids(&self) -> Vec<&EdgeId> {
        self.hops.iter().map(|h| &h.edge_id).collect()
    }

    /// Ranking: score, then fee, then latency, then lexical id
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.total_fee_bps.cmp(&other.total_fee_bps))
            .then_with(|| self.total_latency_ms.cmp(&other.total_latency_ms))
            .then_with(|| self.id().cmp(&other.id()))
            .then_with(|| self.edge_ids().cmp(&other.edge_ids()))
    }
}

#[derive(Debug)]
struct ScoredEdge {
    edge: Edge,
    volatility: f64,
    weight: f64,
}

/// Traversable subgraph; edge indices follow edge id order
#[derive(Debug, Default)]
struct Graph {
    edges: Vec<ScoredEdge>,
    adjacency: HashMap<NodeId, Vec<usize>>,
}

impl Graph {
    fn cost(&self, path: &[usize]) -> f64 {
        path.iter().map(|&i| self.edges[i].weight).sum()
    }

    fn target(&self, idx: usize) -> &NodeId {
        &self.edges[idx].edge.target
    }
}

/// Search frontier entry, ordered for a min-heap
struct Label {
    cost: f64,
    edges: Vec<usize>,
    nodes: Vec<NodeId>,
}

impl Label {
    fn node(&self) -> &NodeId {
        // nodes always holds at least the start node
        &self.nodes[self.nodes.len() - 1]
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.edges.cmp(&self.edges))
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Label {}

/// Hop-bounded simple-path Dijkstra from `from` to `to`
fn shortest(
    graph: &Graph,
    from: &NodeId,
    to: &NodeId,
    max_hops: usize,
    banned_edges: &HashSet<usize>,
    banned_nodes: &HashSet<NodeId>,
) -> Option<Vec<usize>> {
    let mut heap = BinaryHeap::new();
    let mut settled: HashSet<(NodeId, usize)> = HashSet::new();
    heap.push(Label {
        cost: 0.0,
        edges: Vec::new(),
        nodes: vec![from.clone()],
    });

    while let Some(label) = heap.pop() {
        if label.node() == to {
            return Some(label.edges);
        }
        let hops = label.edges.len();
        if !settled.insert((label.node().clone(), hops)) || hops >= max_hops {
            continue;
        }
        let Some(outgoing) = graph.adjacency.get(label.node()) else {
            continue;
        };
        for &idx in outgoing {
            let next = graph.target(idx);
            if banned_edges.contains(&idx)
                || banned_nodes.contains(next)
                || label.nodes.contains(next)
            {
                continue;
            }
            let mut edges = label.edges.clone();
            edges.push(idx);
            let mut nodes = label.nodes.clone();
            nodes.push(next.clone());
            heap.push(Label {
                cost: label.cost + graph.edges[idx].weight,
                edges,
                nodes,
            });
        }
    }
    None
}

/// Path finder over a mesh store and the circuit registry
pub struct PathFinder {
    mesh: Arc<dyn MeshStore>,
    circuits: Arc<CircuitBreakerRegistry>,
    weights: ScoringWeights,
}

impl PathFinder {
    /// Create a path finder
    pub fn new(
        mesh: Arc<dyn MeshStore>,
        circuits: Arc<CircuitBreakerRegistry>,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            mesh,
            circuits,
            weights,
        }
    }

    /// Mesh store being searched
    pub fn mesh(&self) -> &Arc<dyn MeshStore> {
        &self.mesh
    }

    /// Up to 10 ranked paths from `source` to `destination`
    pub fn find_paths(
        &self,
        source: &NodeId,
        destination: &NodeId,
        max_hops: usize,
    ) -> Result<Vec<CandidatePath>> {
        self.search(&PathQuery::new(
            source.clone(),
            destination.clone(),
            max_hops,
        ))
    }

    /// Ranked paths for `query`; `PathNotFound` when none qualify
    pub fn search(&self, query: &PathQuery) -> Result<Vec<CandidatePath>> {
        if query.max_hops == 0 {
            return Err(Error::InvalidQuery("max_hops must be > 0".to_string()));
        }
        if query.source == query.destination {
            return Err(Error::InvalidQuery(format!(
                "source and destination are both {}",
                query.source
            )));
        }

        let snapshot = self.mesh.snapshot();
        for end in [&query.source, &query.destination] {
            if !snapshot.nodes.contains_key(end) {
                return Err(Error::NodeNotFound(end.clone()));
            }
        }

        let graph = self.build_graph(&snapshot, query);
        let limit = query.limit.clamp(1, MAX_CANDIDATE_PATHS);
        let mut paths: Vec<CandidatePath> = self
            .yen(&graph, query, limit)
            .iter()
            .map(|edges| CandidatePath::from_edges(&graph, edges))
            .collect();
        paths.sort_by(|a, b| a.rank_cmp(b));
        paths.truncate(limit);

        if paths.is_empty() {
            debug!(
                source = %query.source,
                destination = %query.destination,
                max_hops = query.max_hops,
                excluded = query.excluded.len(),
                reachable_in_topology = crate::mesh::reachable(&snapshot, &query.source)
                    .contains(&query.destination),
                "no path"
            );
            return Err(Error::PathNotFound {
                source_node: query.source.clone(),
                destination: query.destination.clone(),
                max_hops: query.max_hops,
            });
        }

        debug!(
            source = %query.source,
            destination = %query.destination,
            found = paths.len(),
            best = %paths[0].id(),
            "paths found"
        );
        Ok(paths)
    }

    fn build_graph(&self, snapshot: &MeshSnapshot, query: &PathQuery) -> Graph {
        let eligible: HashSet<&NodeId> = snapshot
            .nodes
            .values()
            .filter(|n| n.active && !(query.consult_health && self.circuits.is_open(&n.id)))
            .filter(|n| n.id == query.source || !query.excluded.contains(&n.id))
            .map(|n| &n.id)
            .collect();
        let volatilities = snapshot.volatilities();

        let mut graph = Graph::default();
        for edge in &snapshot.edges {
            if !edge.active
                || edge.liquidity < query.min_liquidity
                || !eligible.contains(&edge.source)
                || !eligible.contains(&edge.target)
            {
                continue;
            }
            let volatility = volatilities.get(&edge.source).copied().unwrap_or(0.0);
            let sovereignty = snapshot
                .nodes
                .get(&edge.target)
                .map(|n| n.sovereignty)
                .unwrap_or(0.0);
            let integrity = if query.consult_health {
                self.circuits.integrity(&edge.target)
            } else {
                1.0
            };

            let idx = graph.edges.len();
            graph.edges.push(ScoredEdge {
                weight: self
                    .weights
                    .edge_weight(edge, volatility, sovereignty, integrity),
                volatility,
                edge: edge.clone(),
            });
            graph
                .adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(idx);
        }
        graph
    }

    fn yen(&self, graph: &Graph, query: &PathQuery, limit: usize) -> Vec<Vec<usize>> {
        let no_edges = HashSet::new();
        let no_nodes = HashSet::new();
        let Some(first) = shortest(
            graph,
            &query.source,
            &query.destination,
            query.max_hops,
            &no_edges,
            &no_nodes,
        ) else {
            return Vec::new();
        };

        let mut accepted = vec![first];
        let mut candidates: Vec<Vec<usize>> = Vec::new();

        while accepted.len() < limit {
            let previous = accepted[accepted.len() - 1].clone();

            for i in 0..previous.len() {
                let root = &previous[..i];
                let spur_node = if i == 0 {
                    query.source.clone()
                } else {
                    graph.target(previous[i - 1]).clone()
                };

                let mut root_nodes: HashSet<NodeId> = HashSet::from([query.source.clone()]);
                root_nodes.extend(root.iter().map(|&e| graph.target(e).clone()));
                root_nodes.remove(&spur_node);

                let banned_edges: HashSet<usize> = accepted
                    .iter()
                    .filter(|p| p.len() > i && &p[..i] == root)
                    .map(|p| p[i])
                    .collect();

                if let Some(spur) = shortest(
                    graph,
                    &spur_node,
                    &query.destination,
                    query.max_hops - i,
                    &banned_edges,
                    &root_nodes,
                ) {
                    let mut total = root.to_vec();
                    total.extend(spur);
                    if !accepted.contains(&total) && !candidates.contains(&total) {
                        candidates.push(total);
                    }
                }
            }

            let best = candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    graph
                        .cost(a)
                        .total_cmp(&graph.cost(b))
                        .then_with(|| a.cmp(b))
                })
                .map(|(i, _)| i);
            match best {
                Some(i) => accepted.push(candidates.swap_remove(i)),
                None => break,
            }
        }

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{InMemoryMesh, Node};
    use risk_engine::CircuitBreakerConfig;

    fn diamond() -> InMemoryMesh {
        InMemoryMesh::from_parts(
            ["A", "B", "C", "D"].iter().map(|n| Node::new(*n, "EU")).collect(),
            vec![
                Edge::new("a-b", "A", "B", 5, 10, 10_000),
                Edge::new("b-d", "B", "D", 5, 10, 10_000),
                Edge::new("a-c", "A", "C", 10, 20, 10_000),
                Edge::new("c-d", "C", "D", 10, 20, 10_000),
            ],
        )
        .unwrap()
    }

    fn finder(mesh: InMemoryMesh) -> (PathFinder, Arc<CircuitBreakerRegistry>, Arc<InMemoryMesh>) {
        let mesh = Arc::new(mesh);
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let finder = PathFinder::new(
            mesh.clone(),
            Arc::clone(&circuits),
            ScoringWeights::default(),
        );
        (finder, circuits, mesh)
    }

    #[test]
    fn test_ranks_cheapest_first() {
        let (finder, _, _) = finder(diamond());
        let paths = finder.find_paths(&"A".into(), &"D".into(), 4).unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].id(), "A->B->D");
        assert_eq!(paths[0].total_fee_bps, 10);
        assert_eq!(paths[0].total_latency_ms, 20);
        assert_eq!(paths[1].id(), "A->C->D");
        assert!(paths[0].score < paths[1].score);
    }

    #[test]
    fn test_open_circuit_overrides_topology() {
        let (finder, circuits, _) = finder(diamond());
        circuits.force_open(&"B".into());

        let paths = finder.find_paths(&"A".into(), &"D".into(), 4).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].id(), "A->C->D");
    }

    #[test]
    fn test_topology_view_ignores_circuits() {
        let (finder, circuits, _) = finder(diamond());
        circuits.force_open(&"B".into());
        circuits.record_failure(&"C".into());

        let query = PathQuery::new("A".into(), "D".into(), 4).ignoring_health();
        let paths = finder.search(&query).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].id(), "A->B->D");
    }

    #[test]
    fn test_inactive_node_and_edge_skipped() {
        let (finder, _, mesh) = finder(diamond());
        mesh.set_node_active(&"C".into(), false).unwrap();
        mesh.update_edge(
            &"A".into(),
            &"B".into(),
            &crate::mesh::EdgeUpdate::default().active(false),
        )
        .unwrap();

        let err = finder.find_paths(&"A".into(), &"D".into(), 4).unwrap_err();
        assert!(matches!(err, Error::PathNotFound { .. }));
        assert_eq!(err.kind(), protocol_core::ErrorKind::PathNotFound);
    }

    #[test]
    fn test_hop_bound() {
        let mesh = InMemoryMesh::from_parts(
            ["A", "X", "Y", "D"].iter().map(|n| Node::new(*n, "EU")).collect(),
            vec![
                Edge::new("a-x", "A", "X", 1, 1, 100),
                Edge::new("x-y", "X", "Y", 1, 1, 100),
                Edge::new("y-d", "Y", "D", 1, 1, 100),
            ],
        )
        .unwrap();
        let (finder, _, _) = finder(mesh);

        assert!(finder.find_paths(&"A".into(), &"D".into(), 2).is_err());
        let paths = finder.find_paths(&"A".into(), &"D".into(), 3).unwrap();
        assert_eq!(paths[0].hop_count(), 3);
    }

    #[test]
    fn test_parallel_edges_are_distinct_paths() {
        let mesh = InMemoryMesh::from_parts(
            vec![Node::new("A", "EU"), Node::new("D", "EU")],
            vec![
                Edge::new("cheap", "A", "D", 5, 10, 100),
                Edge::new("dear", "A", "D", 9, 10, 100),
            ],
        )
        .unwrap();
        let (finder, _, _) = finder(mesh);

        let paths = finder.find_paths(&"A".into(), &"D".into(), 1).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].hops[0].edge_id, EdgeId::from("cheap"));
        assert_eq!(paths[1].hops[0].edge_id, EdgeId::from("dear"));
    }

    #[test]
    fn test_ties_break_lexically() {
        let mesh = InMemoryMesh::from_parts(
            ["A", "M", "N", "D"].iter().map(|n| Node::new(*n, "EU")).collect(),
            vec![
                Edge::new("a-n", "A", "N", 5, 10, 100),
                Edge::new("n-d", "N", "D", 5, 10, 100),
                Edge::new("a-m", "A", "M", 5, 10, 100),
                Edge::new("m-d", "M", "D", 5, 10, 100),
            ],
        )
        .unwrap();
        let (finder, _, _) = finder(mesh);

        let ids: Vec<String> = finder
            .find_paths(&"A".into(), &"D".into(), 2)
            .unwrap()
            .iter()
            .map(CandidatePath::id)
            .collect();
        assert_eq!(ids, vec!["A->M->D", "A->N->D"]);
    }

    #[test]
    fn test_excluded_and_min_liquidity() {
        let (finder, _, mesh) = finder(diamond());

        let query = PathQuery::new("A".into(), "D".into(), 4).excluding(["B".into()]);
        let paths = finder.search(&query).unwrap();
        assert!(paths.iter().all(|p| !p.contains(&"B".into())));

        mesh.update_edge(
            &"C".into(),
            &"D".into(),
            &crate::mesh::EdgeUpdate::default().liquidity(50),
        )
        .unwrap();
        let query = PathQuery::new("A".into(), "D".into(), 4).with_min_liquidity(100);
        let paths = finder.search(&query).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].id(), "A->B->D");
    }

    #[test]
    fn test_at_most_ten_paths() {
        let names: Vec<String> = (0..8).map(|i| format!("N{}", i)).collect();
        let mut nodes: Vec<Node> = names.iter().map(|n| Node::new(n.as_str(), "EU")).collect();
        nodes.push(Node::new("A", "EU"));
        nodes.push(Node::new("D", "EU"));

        let mut edges = Vec::new();
        for (i, n) in names.iter().enumerate() {
            edges.push(Edge::new(format!("a-{}", n).as_str(), "A", n.as_str(), i as u32, 5, 100));
            edges.push(Edge::new(format!("{}-d", n).as_str(), n.as_str(), "D", 1, 5, 100));
            for m in &names {
                if m != n {
                    edges.push(Edge::new(format!("{}-{}", n, m).as_str(), n.as_str(), m.as_str(), 3, 5, 100));
                }
            }
        }
        let (finder, _, _) = finder(InMemoryMesh::from_parts(nodes, edges).unwrap());

        let paths = finder.find_paths(&"A".into(), &"D".into(), 4).unwrap();
        assert_eq!(paths.len(), MAX_CANDIDATE_PATHS);
        for pair in paths.windows(2) {
            assert_ne!(pair[0].rank_cmp(&pair[1]), Ordering::Greater);
        }
        for path in &paths {
            let unique: HashSet<&NodeId> = path.nodes.iter().collect();
            assert_eq!(unique.len(), path.nodes.len());
            assert!(path.hop_count() <= 4);
        }
    }

    #[test]
    fn test_invalid_queries() {
        let (finder, _, _) = finder(diamond());
        assert!(matches!(
            finder.find_paths(&"A".into(), &"A".into(), 3),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            finder.find_paths(&"A".into(), &"D".into(), 0),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            finder.find_paths(&"A".into(), &"Q".into(), 3),
            Err(Error::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_volatility_penalizes_spread_liquidity() {
        // B splits its liquidity over two edges, C keeps it on one
        let mesh = InMemoryMesh::from_parts(
            ["A", "B", "C", "D", "E"].iter().map(|n| Node::new(*n, "EU")).collect(),
            vec![
                Edge::new("a-b", "A", "B", 5, 10, 1_000),
                Edge::new("a-c", "A", "C", 5, 10, 1_000),
                Edge::new("b-d", "B", "D", 5, 10, 500),
                Edge::new("b-e", "B", "E", 5, 10, 500),
                Edge::new("c-d", "C", "D", 5, 10, 1_000),
            ],
        )
        .unwrap();
        let (finder, _, _) = finder(mesh);

        let paths = finder.find_paths(&"A".into(), &"D".into(), 2).unwrap();
        assert_eq!(paths[0].id(), "A->C->D");
        assert!((paths[1].total_volatility - paths[0].total_volatility - 1.0).abs() < 1e-9);
    }
}

//! Property-based tests for entropy scoring and path finding

use proptest::prelude::*;
use protocol_core::NodeId;
use risk_engine::{CircuitBreakerConfig, CircuitBreakerRegistry};
use routing_engine::{
    normalized_entropy, shannon_entropy, volatility, Edge, Error, InMemoryMesh, Node, PathFinder,
    ScoringWeights, MAX_CANDIDATE_PATHS,
};
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Entropy
// ============================================================================

proptest! {
    /// Property: 0 <= H <= log2(n) over the positive entries
    #[test]
    fn entropy_bounds(volumes in prop::collection::vec(0.0f64..1e9, 0..40)) {
        let h = shannon_entropy(volumes.iter().copied());
        let positive = volumes.iter().filter(|v| **v > 0.0).count();
        prop_assert!(h >= 0.0);
        if positive > 0 {
            prop_assert!(h <= (positive as f64).log2() + 1e-9);
        } else {
            prop_assert_eq!(h, 0.0);
        }
        let n = normalized_entropy(volumes.iter().copied());
        prop_assert!((0.0..=1.0).contains(&n));
        prop_assert!(volatility(volumes.iter().copied()) <= 3.0);
    }

    /// Property: entropy ignores the order of entries
    #[test]
    fn entropy_permutation_invariant(mut volumes in prop::collection::vec(0.0f64..1e6, 1..20)) {
        let before = shannon_entropy(volumes.iter().copied());
        volumes.reverse();
        let after = shannon_entropy(volumes.iter().copied());
        prop_assert!((before - after).abs() < 1e-9);
    }

    /// Property: scaling every volume leaves entropy unchanged
    #[test]
    fn entropy_scale_invariant(
        volumes in prop::collection::vec(1.0f64..1e6, 1..20),
        factor in 0.001f64..1000.0,
    ) {
        let base = shannon_entropy(volumes.iter().copied());
        let scaled = shannon_entropy(volumes.iter().map(|v| v * factor));
        prop_assert!((base - scaled).abs() < 1e-6);
    }

    /// Property: a single non-zero entry has zero entropy
    #[test]
    fn single_entry_zero_entropy(value in 0.001f64..1e9, zeros in 0usize..10) {
        let mut volumes = vec![0.0; zeros];
        volumes.push(value);
        prop_assert_eq!(shannon_entropy(volumes), 0.0);
    }
}

// ============================================================================
// Path finder
// ============================================================================

const NODES: usize = 7;

fn name(i: usize) -> String {
    format!("N{}", i)
}

#[derive(Debug, Clone)]
struct MeshCase {
    edges: Vec<(usize, usize, u32, u64)>,
    inactive: Vec<bool>,
    open: Vec<bool>,
    max_hops: usize,
}

fn mesh_case() -> impl Strategy<Value = MeshCase> {
    (
        prop::collection::vec((0..NODES, 0..NODES, 0u32..50, 1u64..100), 0..30),
        prop::collection::vec(prop::bool::weighted(0.2), NODES),
        prop::collection::vec(prop::bool::weighted(0.2), NODES),
        1usize..6,
    )
        .prop_map(|(edges, inactive, open, max_hops)| MeshCase {
            edges: edges.into_iter().filter(|(s, t, _, _)| s != t).collect(),
            inactive,
            open,
            max_hops,
        })
}

proptest! {
    /// Property: returned paths never contain an inactive or open-circuit node,
    /// are simple, respect the hop bound, and come back ranked
    #[test]
    fn paths_avoid_unhealthy_nodes(case in mesh_case()) {
        let nodes: Vec<Node> = (0..NODES)
            .map(|i| {
                let mut node = Node::new(name(i).as_str(), "EU");
                // Endpoints stay active so the search itself is well-formed
                node.active = i == 0 || i == NODES - 1 || !case.inactive[i];
                node
            })
            .collect();
        let edges: Vec<Edge> = case
            .edges
            .iter()
            .enumerate()
            .map(|(k, (s, t, fee, latency))| {
                Edge::new(format!("e{:02}", k).as_str(), name(*s).as_str(), name(*t).as_str(), *fee, *latency, 1_000)
            })
            .collect();
        let mesh = Arc::new(InMemoryMesh::from_parts(nodes.clone(), edges).unwrap());
        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let mut open_nodes = HashSet::new();
        for i in 1..NODES - 1 {
            if case.open[i] {
                let id = NodeId::from(name(i));
                circuits.force_open(&id);
                open_nodes.insert(id);
            }
        }
        let finder = PathFinder::new(mesh, circuits, ScoringWeights::default());

        let source = NodeId::from(name(0));
        let destination = NodeId::from(name(NODES - 1));
        match finder.find_paths(&source, &destination, case.max_hops) {
            Ok(paths) => {
                prop_assert!(!paths.is_empty() && paths.len() <= MAX_CANDIDATE_PATHS);
                for path in &paths {
                    prop_assert!(path.hop_count() <= case.max_hops);
                    prop_assert_eq!(path.nodes.first(), Some(&source));
                    prop_assert_eq!(path.nodes.last(), Some(&destination));
                    let unique: HashSet<&NodeId> = path.nodes.iter().collect();
                    prop_assert_eq!(unique.len(), path.nodes.len());
                    for node in &path.nodes {
                        prop_assert!(!open_nodes.contains(node));
                        let record = nodes.iter().find(|n| &n.id == node).unwrap();
                        prop_assert!(record.active);
                    }
                }
                for pair in paths.windows(2) {
                    prop_assert!(pair[0].rank_cmp(&pair[1]) != std::cmp::Ordering::Greater);
                }
            }
            Err(Error::PathNotFound { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error {}", other),
        }
    }
}

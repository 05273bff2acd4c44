//! Mesh topology: node and edge records plus the query adapter
//!
//! The topology store is external; [`MeshStore`] is the seam the routing and
//! settlement code talks to. [`InMemoryMesh`] is the bundled implementation,
//! loadable from a JSON topology document.

use crate::entropy::Distribution;
use crate::{Error, Result};
use parking_lot::RwLock;
use protocol_core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Edge identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    /// Create new edge ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Role of a node in the mesh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Regulated bank
    #[default]
    Bank,
    /// Market maker / liquidity provider
    LiquidityProvider,
    /// Exchange
    Exchange,
    /// Cash-in/cash-out gateway
    Gateway,
}

fn default_true() -> bool {
    true
}

fn default_sovereignty() -> f64 {
    1.0
}

/// Mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier
    pub id: NodeId,
    /// Role
    #[serde(default)]
    pub node_type: NodeType,
    /// Region / jurisdiction code
    #[serde(default)]
    pub region: String,
    /// Topology active flag
    #[serde(default = "default_true")]
    pub active: bool,
    /// Static credibility signal in 0.0 - 1.0
    #[serde(default = "default_sovereignty")]
    pub sovereignty: f64,
}

impl Node {
    /// Active bank node with full sovereignty
    pub fn new(id: impl Into<NodeId>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::Bank,
            region: region.into(),
            active: true,
            sovereignty: 1.0,
        }
    }
}

/// Directed liquidity edge; parallel edges are distinct records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Identifier
    pub id: EdgeId,
    /// Sending node
    pub source: NodeId,
    /// Receiving node
    pub target: NodeId,
    /// Base fee in basis points
    pub base_fee_bps: u32,
    /// Latency estimate
    pub latency_ms: u64,
    /// Liquidity volume (minor units)
    pub liquidity: u64,
    /// Topology active flag
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Edge {
    /// Active edge
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        base_fee_bps: u32,
        latency_ms: u64,
        liquidity: u64,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            base_fee_bps,
            latency_ms,
            liquidity,
            active: true,
        }
    }
}

/// Field-level edge update; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeUpdate {
    /// Restrict the update to one of the parallel edges
    pub edge_id: Option<EdgeId>,
    /// New base fee
    pub base_fee_bps: Option<u32>,
    /// New latency estimate
    pub latency_ms: Option<u64>,
    /// New liquidity volume
    pub liquidity: Option<u64>,
    /// New active flag
    pub active: Option<bool>,
}

impl EdgeUpdate {
    /// Update for one specific edge
    pub fn for_edge(edge_id: EdgeId) -> Self {
        Self {
            edge_id: Some(edge_id),
            ..Default::default()
        }
    }

    /// Set liquidity
    pub fn liquidity(mut self, liquidity: u64) -> Self {
        self.liquidity = Some(liquidity);
        self
    }

    /// Set active flag
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    fn apply(&self, edge: &mut Edge) {
        if let Some(fee) = self.base_fee_bps {
            edge.base_fee_bps = fee;
        }
        if let Some(latency) = self.latency_ms {
            edge.latency_ms = latency;
        }
        if let Some(liquidity) = self.liquidity {
            edge.liquidity = liquidity;
        }
        if let Some(active) = self.active {
            edge.active = active;
        }
    }
}

/// Consistent copy of the topology at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshSnapshot {
    /// Nodes by id
    pub nodes: HashMap<NodeId, Node>,
    /// All edges, ordered by id
    pub edges: Vec<Edge>,
}

impl MeshSnapshot {
    /// Outgoing liquidity distribution of `node` over its active edges
    pub fn distribution(&self, node: &NodeId) -> Distribution {
        self.edges
            .iter()
            .filter(|e| e.active && &e.source == node)
            .map(|e| (e.id.as_str().to_string(), e.liquidity as f64))
            .collect()
    }

    /// Volatility penalty of every node with outgoing edges
    pub fn volatilities(&self) -> HashMap<NodeId, f64> {
        let mut distributions: HashMap<NodeId, Distribution> = HashMap::new();
        for edge in self.edges.iter().filter(|e| e.active) {
            distributions
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.id.as_str(), edge.liquidity as f64);
        }
        distributions
            .into_iter()
            .map(|(node, d)| (node, d.volatility()))
            .collect()
    }
}

/// Read/write access to the mesh topology
///
/// Writes are last-writer-wins per field; no cross-field transaction is
/// implied.
pub trait MeshStore: Send + Sync {
    /// Copy of the whole topology
    fn snapshot(&self) -> MeshSnapshot;

    /// Node record
    fn get_node(&self, id: &NodeId) -> Result<Node>;

    /// Edge record
    fn get_edge(&self, id: &EdgeId) -> Result<Edge>;

    /// Apply `update` to edges `source → target`; returns how many matched
    fn update_edge(&self, source: &NodeId, target: &NodeId, update: &EdgeUpdate) -> Result<usize>;

    /// Mark a node active or inactive
    fn set_node_active(&self, id: &NodeId, active: bool) -> Result<()>;

    /// Atomically debit an edge; fails without effect if it cannot carry `amount`
    fn try_debit(&self, id: &EdgeId, amount: u64) -> Result<u64>;

    /// Credit an edge (reversal of a debit)
    fn credit(&self, id: &EdgeId, amount: u64) -> Result<u64>;

    /// Active edges `source → target`, ordered by id
    fn edges_between(&self, source: &NodeId, target: &NodeId) -> Vec<Edge>;

    /// Sum of active outgoing liquidity of `node`
    fn outgoing_liquidity(&self, node: &NodeId) -> u64;
}

/// Topology document loaded from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDocument {
    /// Nodes
    pub nodes: Vec<Node>,
    /// Edges
    pub edges: Vec<Edge>,
}

#[derive(Debug, Default)]
struct Topology {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<EdgeId, Edge>,
}

/// In-memory [`MeshStore`]
#[derive(Debug, Default)]
pub struct InMemoryMesh {
    inner: RwLock<Topology>,
}

impl InMemoryMesh {
    /// Empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from node and edge records, validating references
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let mut topology = Topology::default();
        for node in nodes {
            if topology.nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(Error::InvalidTopology(format!("duplicate node {}", node.id)));
            }
        }
        for edge in edges {
            for end in [&edge.source, &edge.target] {
                if !topology.nodes.contains_key(end) {
                    return Err(Error::InvalidTopology(format!(
                        "edge {} references unknown node {}",
                        edge.id, end
                    )));
                }
            }
            if edge.source == edge.target {
                return Err(Error::InvalidTopology(format!("edge {} is a self-loop", edge.id)));
            }
            if topology.edges.insert(edge.id.clone(), edge.clone()).is_some() {
                return Err(Error::InvalidTopology(format!("duplicate edge {}", edge.id)));
            }
        }
        Ok(Self {
            inner: RwLock::new(topology),
        })
    }

    /// Parse a JSON topology document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: TopologyDocument = serde_json::from_str(json)?;
        Self::from_parts(document.nodes, document.edges)
    }

    /// Load a JSON topology document from disk
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mesh = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        let topology = mesh.inner.read();
        info!(
            path = %path.display(),
            nodes = topology.nodes.len(),
            edges = topology.edges.len(),
            "loaded mesh topology"
        );
        drop(topology);
        Ok(mesh)
    }

    /// Serialize the current topology
    pub fn to_document(&self) -> TopologyDocument {
        let snapshot = self.snapshot();
        let mut nodes: Vec<Node> = snapshot.nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        TopologyDocument {
            nodes,
            edges: snapshot.edges,
        }
    }

    /// Insert or replace a node
    pub fn upsert_node(&self, node: Node) {
        self.inner.write().nodes.insert(node.id.clone(), node);
    }

    /// Insert or replace an edge; both endpoints must exist
    pub fn upsert_edge(&self, edge: Edge) -> Result<()> {
        let mut topology = self.inner.write();
        for end in [&edge.source, &edge.target] {
            if !topology.nodes.contains_key(end) {
                return Err(Error::NodeNotFound(end.clone()));
            }
        }
        topology.edges.insert(edge.id.clone(), edge);
        Ok(())
    }
}

impl MeshStore for InMemoryMesh {
    fn snapshot(&self) -> MeshSnapshot {
        let topology = self.inner.read();
        let mut edges: Vec<Edge> = topology.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        MeshSnapshot {
            nodes: topology.nodes.clone(),
            edges,
        }
    }

    fn get_node(&self, id: &NodeId) -> Result<Node> {
        self.inner
            .read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Edge> {
        self.inner
            .read()
            .edges
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EdgeNotFound(id.to_string()))
    }

    fn update_edge(&self, source: &NodeId, target: &NodeId, update: &EdgeUpdate) -> Result<usize> {
        let mut topology = self.inner.write();
        let mut matched = 0;
        for edge in topology.edges.values_mut() {
            if &edge.source != source || &edge.target != target {
                continue;
            }
            if let Some(only) = &update.edge_id {
                if &edge.id != only {
                    continue;
                }
            }
            update.apply(edge);
            matched += 1;
        }
        if matched == 0 {
            return Err(Error::EdgeNotFound(format!("{} -> {}", source, target)));
        }
        debug!(%source, %target, matched, "edges updated");
        Ok(matched)
    }

    fn set_node_active(&self, id: &NodeId, active: bool) -> Result<()> {
        let mut topology = self.inner.write();
        let node = topology
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::NodeNotFound(id.clone()))?;
        if node.active != active {
            info!(node = %id, active, "node active flag changed");
        }
        node.active = active;
        Ok(())
    }

    fn try_debit(&self, id: &EdgeId, amount: u64) -> Result<u64> {
        let mut topology = self.inner.write();
        let edge = topology
            .edges
            .get_mut(id)
            .ok_or_else(|| Error::EdgeNotFound(id.to_string()))?;
        if !edge.active || edge.liquidity < amount {
            return Err(Error::InsufficientLiquidity {
                edge: id.to_string(),
                available: if edge.active { edge.liquidity } else { 0 },
                requested: amount,
            });
        }
        edge.liquidity -= amount;
        Ok(edge.liquidity)
    }

    fn outgoing_liquidity(&self, node: &NodeId) -> u64 {
        self.inner
            .read()
            .edges
            .values()
            .filter(|e| e.active && &e.source == node)
            .map(|e| e.liquidity)
            .sum()
    }

    fn edges_between(&self, source: &NodeId, target: &NodeId) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .inner
            .read()
            .edges
            .values()
            .filter(|e| e.active && &e.source == source && &e.target == target)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    fn credit(&self, id: &EdgeId, amount: u64) -> Result<u64> {
        let mut topology = self.inner.write();
        let edge = topology
            .edges
            .get_mut(id)
            .ok_or_else(|| Error::EdgeNotFound(id.to_string()))?;
        edge.liquidity = edge.liquidity.saturating_add(amount);
        Ok(edge.liquidity)
    }
}

/// Nodes reachable from `source` over active edges (diagnostics)
pub fn reachable(snapshot: &MeshSnapshot, source: &NodeId) -> HashSet<NodeId> {
    let mut seen = HashSet::from([source.clone()]);
    let mut frontier = vec![source.clone()];
    while let Some(node) = frontier.pop() {
        for edge in snapshot.edges.iter().filter(|e| e.active && e.source == node) {
            if seen.insert(edge.target.clone()) {
                frontier.push(edge.target.clone());
            }
        }
    }
    seen
}

//! Receiving side of the hop protocol for one mesh node
//!
//! A hop addressed to this node is confirmed once the node is active, has
//! capacity, and holds enough liquidity toward the next node on the path.
//! A request whose source is this node and that carries no path is an
//! origination and is handed to the local [`Orchestrator`].
//!
//! Confirmed hops are remembered for a replay window so a retried hop gets
//! its first answer back. The window is bounded in time and in entries.

use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use protocol_core::{
    ErrorKind, HeartbeatReply, HopHandler, NodeId, NodeStatus, RequestId, SettlementOutcome,
    SettlementRequest, SignerRegistry, PROTOCOL_VERSION,
};
use risk_engine::CircuitBreakerRegistry;
use routing_engine::MeshStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// How long a confirmed hop is answered from memory
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(600);

/// Confirmed hops remembered at most
pub const DEFAULT_REPLAY_CAPACITY: usize = 100_000;

type HopKey = (RequestId, u32);

/// Confirmed hops, evicted oldest first by age and by count
struct ReplayCache {
    window: Duration,
    capacity: usize,
    entries: DashMap<HopKey, (SettlementOutcome, Instant)>,
    order: Mutex<VecDeque<(HopKey, Instant)>>,
}

impl ReplayCache {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    fn get(&self, key: &HopKey) -> Option<SettlementOutcome> {
        self.entries
            .get(key)
            .filter(|entry| entry.1.elapsed() < self.window)
            .map(|entry| entry.0.clone())
    }

    fn insert(&self, key: HopKey, outcome: SettlementOutcome) {
        let now = Instant::now();
        self.entries.insert(key, (outcome, now));

        let mut order = self.order.lock();
        order.push_back((key, now));
        let mut evicted = 0usize;
        while let Some(&(oldest, at)) = order.front() {
            if order.len() <= self.capacity && at.elapsed() < self.window {
                break;
            }
            order.pop_front();
            // A newer answer for the same hop stays
            self.entries.remove_if(&oldest, |_, (_, stored)| *stored == at);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remembered = order.len(), "replay entries evicted");
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Mesh node hop handler
pub struct MeshNode {
    id: NodeId,
    mesh: Arc<dyn MeshStore>,
    circuits: Arc<CircuitBreakerRegistry>,
    signers: Option<Arc<SignerRegistry>>,
    orchestrator: Option<Arc<Orchestrator>>,
    accepted: ReplayCache,
    pending: AtomicU32,
    max_pending: u32,
}

impl MeshNode {
    /// Create handler for node `id`
    pub fn new(
        id: impl Into<NodeId>,
        mesh: Arc<dyn MeshStore>,
        circuits: Arc<CircuitBreakerRegistry>,
        signers: Option<Arc<SignerRegistry>>,
        max_pending: u32,
    ) -> Self {
        Self {
            id: id.into(),
            mesh,
            circuits,
            signers,
            orchestrator: None,
            accepted: ReplayCache::new(DEFAULT_REPLAY_WINDOW, DEFAULT_REPLAY_CAPACITY),
            pending: AtomicU32::new(0),
            max_pending: max_pending.max(1),
        }
    }

    /// Accept originations through `orchestrator`
    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Remember confirmed hops for `window`, keeping at most `capacity`
    pub fn with_replay_window(mut self, window: Duration, capacity: usize) -> Self {
        self.accepted = ReplayCache::new(window, capacity);
        self
    }

    /// Node id
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Hops currently being processed
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Confirmed hops still answerable from memory
    pub fn remembered_hops(&self) -> usize {
        self.accepted.len()
    }

    fn is_origination(&self, request: &SettlementRequest) -> bool {
        request.source == self.id && request.path.is_empty()
    }

    async fn originate(&self, request: SettlementRequest) -> SettlementOutcome {
        let request_id = request.request_id;
        let Some(orchestrator) = &self.orchestrator else {
            return SettlementOutcome::failed(
                request_id,
                ErrorKind::Internal,
                format!("{} does not accept originations", self.id),
                Vec::new(),
            );
        };
        match orchestrator.settle(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%request_id, error = %e, "origination failed");
                SettlementOutcome::failed(request_id, e.kind(), e.to_string(), Vec::new())
            }
        }
    }

    fn confirm_hop(&self, request: &SettlementRequest) -> SettlementOutcome {
        let reject = |kind: ErrorKind, message: String| {
            SettlementOutcome::failed(request.request_id, kind, message, request.path.clone())
        };

        if request.target != self.id {
            return reject(
                ErrorKind::Internal,
                format!("hop for {} misrouted to {}", request.target, self.id),
            );
        }

        match self.mesh.get_node(&self.id) {
            Ok(node) if node.active => {}
            _ => {
                return reject(
                    ErrorKind::NodeUnavailable,
                    format!("{} is not active", self.id),
                )
            }
        }

        if let Some(next) = request.next_after_target() {
            let available = self
                .mesh
                .edges_between(&self.id, next)
                .iter()
                .map(|e| e.liquidity)
                .max()
                .unwrap_or(0);
            if available < request.amount {
                return reject(
                    ErrorKind::InsufficientLiquidity,
                    format!(
                        "{} -> {} can carry {}, requested {}",
                        self.id, next, available, request.amount
                    ),
                );
            }
        }

        SettlementOutcome::completed(request.request_id, request.path.clone(), 0, 0)
    }
}

#[async_trait]
impl HopHandler for MeshNode {
    #[instrument(
        skip_all,
        fields(node = %self.id, request_id = %request.request_id, hop = request.hop_index)
    )]
    async fn handle_hop(&self, request: SettlementRequest) -> SettlementOutcome {
        if self.is_origination(&request) {
            return self.originate(request).await;
        }

        if let Some(signers) = &self.signers {
            if let Err(e) = signers.verify(&request) {
                warn!(error = %e, "hop signature rejected");
                return SettlementOutcome::failed(
                    request.request_id,
                    ErrorKind::SignatureInvalid,
                    e.to_string(),
                    request.path.clone(),
                );
            }
        }

        let key = (request.request_id, request.hop_index);
        if let Some(previous) = self.accepted.get(&key) {
            debug!("replayed hop");
            return previous;
        }

        let pending = self.pending.fetch_add(1, Ordering::SeqCst);
        if pending >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return SettlementOutcome::failed(
                request.request_id,
                ErrorKind::NodeUnavailable,
                format!("{} is at capacity ({} pending)", self.id, pending),
                request.path.clone(),
            );
        }

        let started = Instant::now();
        let mut outcome = self.confirm_hop(&request);
        self.pending.fetch_sub(1, Ordering::SeqCst);

        if outcome.is_success() {
            outcome.total_latency_ms = started.elapsed().as_millis() as u64;
            self.accepted.insert(key, outcome.clone());
            debug!(source = %request.source, "hop accepted");
        } else {
            debug!(error = outcome.error.as_str(), "hop refused");
        }
        outcome
    }

    async fn status(&self) -> NodeStatus {
        let pending = self.pending();
        NodeStatus {
            node_id: self.id.clone(),
            active: self
                .mesh
                .get_node(&self.id)
                .map(|n| n.active)
                .unwrap_or(false),
            circuit_state: self.circuits.state(&self.id),
            current_load: (pending as f64 / self.max_pending as f64).min(1.0),
            available_liquidity: self.mesh.outgoing_liquidity(&self.id),
            pending_settlements: pending,
            timestamp: Utc::now(),
        }
    }

    async fn heartbeat(&self, from: &NodeId) -> HeartbeatReply {
        debug!(%from, "heartbeat");
        HeartbeatReply {
            node_id: self.id.clone(),
            healthy: self
                .mesh
                .get_node(&self.id)
                .map(|n| n.active)
                .unwrap_or(false),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

//! Settlement orchestrator
//!
//! ```text
//! settle(request)
//!   ├─ verify signature
//!   ├─ claim request id in the outbox ─── terminal? → stored outcome
//!   ├─ admission (final destination + global window)
//!   └─ attempt loop: first attempt + at most `max_reroutes`
//!        ├─ route: intended path, else best candidate excluding failed nodes
//!        ├─ hop i: circuit gate → transport call → circuit update
//!        └─ reroutable failure → exclude the node and search again
//!   commit: debit the route's edges, append ledger entry + terminal outcome
//! ```
//!
//! Every terminal outcome is recorded before it is returned. Rate-limited
//! requests release their claim, and deadline expiry leaves the record
//! `Unknown` until [`Orchestrator::recover`] or a resubmission resolves it.

use crate::config::{Config, OrchestratorConfig, RoutingConfig};
use crate::metrics::Metrics;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledger_core::{Claim, OutboxStore, SettledTransfer};
use protocol_core::{
    CircuitState, ErrorKind, HopMode, HopStream, NodeId, RequestId, SettlementOutcome,
    SettlementRequest, SettlementStatus, SettlementTransport, SignerRegistry, SnowflakeGenerator,
};
use risk_engine::{AdmissionController, CircuitBreakerRegistry};
use routing_engine::{CandidatePath, EdgeId, MeshStore, PathFinder, PathQuery};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Route being attempted
#[derive(Debug, Clone)]
struct Route {
    nodes: Vec<NodeId>,
    edges: Vec<EdgeId>,
    fee_bps: u32,
}

impl From<&CandidatePath> for Route {
    fn from(path: &CandidatePath) -> Self {
        Self {
            nodes: path.nodes.clone(),
            edges: path.hops.iter().map(|h| h.edge_id.clone()).collect(),
            fee_bps: path.total_fee_bps,
        }
    }
}

/// Result of walking one route
enum Attempt {
    Settled {
        latency_ms: u64,
    },
    Failed {
        node: NodeId,
        kind: ErrorKind,
        message: String,
        path: Vec<NodeId>,
    },
    Expired {
        path: Vec<NodeId>,
    },
}

type Sessions = HashMap<NodeId, Box<dyn HopStream>>;

/// Drives settlements from their origin node to the final destination
pub struct Orchestrator {
    settings: OrchestratorConfig,
    routing: RoutingConfig,
    call_timeout: Duration,
    finder: PathFinder,
    mesh: Arc<dyn MeshStore>,
    circuits: Arc<CircuitBreakerRegistry>,
    admission: Arc<AdmissionController>,
    transport: Arc<dyn SettlementTransport>,
    store: Arc<dyn OutboxStore>,
    signers: Option<Arc<SignerRegistry>>,
    ids: SnowflakeGenerator,
    metrics: Metrics,
    inflight: DashMap<RequestId, watch::Receiver<Option<SettlementOutcome>>>,
    executing: AtomicUsize,
}

impl Orchestrator {
    /// Build an orchestrator over the given collaborators
    pub fn new(
        config: &Config,
        mesh: Arc<dyn MeshStore>,
        transport: Arc<dyn SettlementTransport>,
        store: Arc<dyn OutboxStore>,
    ) -> Result<Self> {
        config.validate_engine()?;
        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
        let signers = if config.signers.is_empty() {
            None
        } else {
            Some(Arc::new(SignerRegistry::from_hex_map(&config.signers)?))
        };

        Ok(Self {
            settings: config.orchestrator.clone(),
            routing: config.routing.clone(),
            call_timeout: config.network.call_timeout(),
            finder: PathFinder::new(
                Arc::clone(&mesh),
                Arc::clone(&circuits),
                config.routing.weights.clone(),
            ),
            mesh,
            circuits,
            admission: Arc::new(AdmissionController::new(config.admission.clone())),
            transport,
            store,
            signers,
            ids: SnowflakeGenerator::new(config.worker_id)?,
            metrics: Metrics::new()?,
            inflight: DashMap::new(),
            executing: AtomicUsize::new(0),
        })
    }

    /// Verify request signatures against `signers`
    pub fn with_signers(mut self, signers: SignerRegistry) -> Self {
        self.signers = Some(Arc::new(signers));
        self
    }

    /// Shared circuit breaker registry
    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    /// Admission controller
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Signature registry, if verification is enabled
    pub fn signers(&self) -> Option<&Arc<SignerRegistry>> {
        self.signers.as_ref()
    }

    /// Mesh store
    pub fn mesh(&self) -> &Arc<dyn MeshStore> {
        &self.mesh
    }

    /// Outbox store
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Fresh request id from this node's Snowflake worker
    pub fn next_request_id(&self) -> Result<RequestId> {
        Ok(self.ids.next_id()?)
    }

    /// Settle `request` under the default deadline
    pub async fn settle(&self, request: SettlementRequest) -> Result<SettlementOutcome> {
        self.settle_with_deadline(request, self.settings.default_deadline())
            .await
    }

    /// Settle `request`, giving up after `timeout`
    ///
    /// A concurrent submission of the same request id waits for the first
    /// execution's outcome instead of running again.
    #[instrument(skip_all, fields(request_id = %request.request_id))]
    pub async fn settle_with_deadline(
        &self,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome> {
        let deadline = Instant::now() + timeout;
        let request_id = request.request_id;

        if let Some(signers) = &self.signers {
            if let Err(e) = signers.verify(&request) {
                warn!(error = %e, "signature rejected");
                let outcome = SettlementOutcome::failed(
                    request_id,
                    ErrorKind::SignatureInvalid,
                    e.to_string(),
                    Vec::new(),
                );
                self.metrics.record_settlement(outcome.status);
                return Ok(outcome);
            }
        }

        let joined = match self.inflight.entry(request_id) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Ok(tx)
            }
        };
        let tx = match joined {
            Ok(tx) => tx,
            Err(rx) => {
                debug!("joining in-flight execution");
                return self.wait_for(request_id, rx, deadline).await;
            }
        };

        let mut flight = Flight {
            orchestrator: self,
            request_id,
            tx,
            owns_record: false,
        };
        let outcome = self.run(&request, deadline, &mut flight).await?;
        flight.publish(&outcome);
        Ok(outcome)
    }

    /// Re-drive every request whose outcome is unknown
    pub async fn recover(&self) -> Result<Vec<SettlementOutcome>> {
        let mut outcomes = Vec::new();
        for record in self.store.unknown_requests()? {
            let request_id = record.request.request_id;
            info!(%request_id, attempts = record.attempts, "recovering unknown outcome");
            match self.settle(record.request).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(Error::AlreadyProcessing(_)) => {
                    debug!(%request_id, "already being recovered elsewhere");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Mark executions interrupted by a restart as unknown
    pub fn mark_interrupted(&self) -> Result<usize> {
        let marked = self.store.mark_all_unknown()?;
        if marked > 0 {
            warn!(marked, "requests left processing by a previous run are now unknown");
        }
        Ok(marked)
    }

    async fn wait_for(
        &self,
        request_id: RequestId,
        mut rx: watch::Receiver<Option<SettlementOutcome>>,
        deadline: Instant,
    ) -> Result<SettlementOutcome> {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Ok(outcome);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return rx
                        .borrow()
                        .clone()
                        .ok_or(Error::Aborted(request_id));
                }
                Err(_) => {
                    return Ok(SettlementOutcome::failed(
                        request_id,
                        ErrorKind::Timeout,
                        "deadline expired waiting for the in-flight execution",
                        Vec::new(),
                    ));
                }
            }
        }
    }

    async fn run(
        &self,
        request: &SettlementRequest,
        deadline: Instant,
        flight: &mut Flight<'_>,
    ) -> Result<SettlementOutcome> {
        let request_id = request.request_id;
        let mut reclaimed = false;
        match self.store.claim(request)? {
            Claim::Acquired => {}
            Claim::Terminal(outcome) => {
                debug!(
                    status = outcome.status.as_str(),
                    "duplicate submission, returning recorded outcome"
                );
                return Ok(outcome);
            }
            Claim::InFlight => return Err(Error::AlreadyProcessing(request_id)),
            Claim::Unknown => {
                if let Some(outcome) = self.resolve_from_ledger(request_id)? {
                    return Ok(outcome);
                }
                match self.store.reclaim(request_id)? {
                    Claim::Acquired => reclaimed = true,
                    Claim::Terminal(outcome) => return Ok(outcome),
                    Claim::InFlight | Claim::Unknown => {
                        return Err(Error::AlreadyProcessing(request_id))
                    }
                }
                info!("re-executing request with unknown outcome");
            }
        }
        flight.owns_record = true;

        let executing = Executing::enter(&self.executing);
        self.admission
            .set_load(executing.count() as f64 / self.settings.max_in_flight as f64);
        if let Err(e) = self
            .admission
            .admit(&request.final_destination, request.priority)
        {
            self.metrics.admission_rejections.inc();
            warn!(error = %e, "admission rejected");
            if reclaimed {
                self.store.mark_unknown(request_id)?;
            } else {
                self.store.release(request_id)?;
            }
            flight.owns_record = false;
            let outcome =
                SettlementOutcome::failed(request_id, e.kind(), e.to_string(), Vec::new());
            self.metrics.record_settlement(outcome.status);
            return Ok(outcome);
        }

        let outcome = self.execute(request, deadline).await?;
        flight.owns_record = false;
        Ok(outcome)
    }

    /// Bounded reroute loop
    async fn execute(
        &self,
        request: &SettlementRequest,
        deadline: Instant,
    ) -> Result<SettlementOutcome> {
        let request_id = request.request_id;
        let mut sessions = Sessions::new();
        let mut excluded: BTreeSet<NodeId> = BTreeSet::new();
        let mut reroutes = 0u32;
        let mut max_hops = self.routing.max_hops;
        let mut widened = false;
        let mut intended = self.intended_route(request);
        let mut displaced = false;
        let mut last_path = Vec::new();

        loop {
            if Instant::now() >= deadline {
                return self.expire(request_id, last_path);
            }

            let route = match intended.take() {
                Some(route) => route,
                None => match self.best_route(request, max_hops, &excluded) {
                    Ok(route) => {
                        if reroutes == 0 && request.path.is_empty() {
                            displaced = self.displaced_by_health(request, max_hops, &route);
                        }
                        route
                    }
                    Err(routing_engine::Error::PathNotFound { .. }) if !widened => {
                        widened = true;
                        max_hops += self.routing.widen_step;
                        info!(max_hops, "no path within hop bound, widening once");
                        continue;
                    }
                    Err(e) => {
                        let message = if excluded.is_empty() {
                            e.to_string()
                        } else {
                            format!("{} (excluding {:?})", e, excluded)
                        };
                        let outcome =
                            SettlementOutcome::failed(request_id, e.kind(), message, last_path);
                        return self.finish(request, outcome, None);
                    }
                },
            };

            debug!(route = ?route.nodes, reroutes, "attempting route");
            match self.attempt(request, &route, deadline, &mut sessions).await {
                Attempt::Settled { latency_ms } => {
                    let substituted = reroutes > 0
                        || displaced
                        || (!request.path.is_empty() && request.path != route.nodes);
                    return self.complete(request, route, latency_ms, substituted);
                }
                Attempt::Expired { path } => return self.expire(request_id, path),
                Attempt::Failed {
                    node,
                    kind,
                    message,
                    path,
                } => {
                    if !kind.is_reroutable() {
                        let outcome = SettlementOutcome::failed(request_id, kind, message, path);
                        return self.finish(request, outcome, None);
                    }
                    if reroutes >= self.settings.max_reroutes {
                        warn!(%node, reroutes, "reroute budget exhausted");
                        let outcome = SettlementOutcome::failed(
                            request_id,
                            kind,
                            format!("{} (after {} reroutes)", message, reroutes),
                            path,
                        );
                        return self.finish(request, outcome, None);
                    }

                    reroutes += 1;
                    self.metrics.reroutes_total.inc();
                    // The destination cannot be routed around; it is retried instead
                    if node != request.final_destination {
                        excluded.insert(node.clone());
                    }
                    info!(
                        %node,
                        error = kind.as_str(),
                        reroutes,
                        "hop failed, rerouting"
                    );
                    last_path = path;
                }
            }
        }
    }

    /// Walk `route` hop by hop
    async fn attempt(
        &self,
        request: &SettlementRequest,
        route: &Route,
        deadline: Instant,
        sessions: &mut Sessions,
    ) -> Attempt {
        let mut latency_ms = 0u64;
        for hop in 0..route.edges.len() {
            let peer = &route.nodes[hop + 1];
            let path = route.nodes[..=hop + 1].to_vec();

            // Held across the call; a cancelled settlement drops it unreported
            let permit = match self.circuits.try_acquire(peer) {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(%peer, "circuit open, call skipped");
                    return Attempt::Failed {
                        node: peer.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                        path,
                    };
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                permit.abandon();
                return Attempt::Expired { path };
            }
            let bounded_by_deadline = remaining < self.call_timeout;
            let timeout = self.call_timeout.min(remaining);

            let started = Instant::now();
            let result = self
                .call(peer, request.for_hop(&route.nodes, hop), timeout, sessions)
                .await;
            let elapsed = started.elapsed();
            self.metrics.observe_hop(elapsed);

            match result {
                Ok(outcome) if outcome.is_success() => {
                    self.observe(peer, || permit.succeeded(elapsed));
                    latency_ms += elapsed.as_millis() as u64;
                    debug!(hop, %peer, elapsed_ms = elapsed.as_millis() as u64, "hop confirmed");
                }
                Ok(outcome) => {
                    let kind = match outcome.error {
                        ErrorKind::None => ErrorKind::Internal,
                        kind => kind,
                    };
                    if kind.is_reroutable() {
                        self.observe(peer, || permit.failed());
                    } else {
                        // The peer answered; the failure is about the request
                        self.observe(peer, || permit.succeeded(elapsed));
                    }
                    return Attempt::Failed {
                        node: peer.clone(),
                        kind,
                        message: outcome.error_message,
                        path,
                    };
                }
                Err(e) => {
                    sessions.remove(peer);
                    let kind = e.kind();
                    if kind == ErrorKind::Timeout && bounded_by_deadline {
                        permit.abandon();
                        return Attempt::Expired { path };
                    }
                    if kind == ErrorKind::Timeout {
                        self.observe(peer, || permit.timed_out());
                    } else {
                        self.observe(peer, || permit.failed());
                    }
                    return Attempt::Failed {
                        node: peer.clone(),
                        kind,
                        message: e.to_string(),
                        path,
                    };
                }
            }
        }
        Attempt::Settled { latency_ms }
    }

    async fn call(
        &self,
        peer: &NodeId,
        request: SettlementRequest,
        timeout: Duration,
        sessions: &mut Sessions,
    ) -> protocol_core::Result<SettlementOutcome> {
        match self.settings.hop_mode {
            HopMode::Unary => self.transport.settle_hop(peer, request, timeout).await,
            HopMode::Streaming => {
                let stream = match sessions.entry(peer.clone()) {
                    std::collections::hash_map::Entry::Occupied(open) => open.into_mut(),
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        let opened =
                            tokio::time::timeout(timeout, self.transport.open_stream(peer))
                                .await
                                .map_err(|_| protocol_core::Error::Timeout {
                                    peer: peer.to_string(),
                                    timeout_ms: timeout.as_millis() as u64,
                                })??;
                        slot.insert(opened)
                    }
                };
                stream.send_hop(request, timeout).await
            }
        }
    }

    /// Apply a circuit observation, counting any trip it causes
    fn observe(&self, peer: &NodeId, record: impl FnOnce()) {
        let was_open = self.circuits.state(peer) == CircuitState::Open;
        record();
        if !was_open && self.circuits.state(peer) == CircuitState::Open {
            self.metrics.circuit_trips.inc();
        }
    }

    /// Caller-supplied path, if it is usable as the first attempt
    fn intended_route(&self, request: &SettlementRequest) -> Option<Route> {
        let path = &request.path;
        if path.len() < 2
            || path.first() != Some(&request.source)
            || path.last() != Some(&request.final_destination)
        {
            return None;
        }
        if path
            .iter()
            .any(|node| !self.mesh.get_node(node).map(|n| n.active).unwrap_or(false))
        {
            debug!(?path, "intended path has an inactive node, searching instead");
            return None;
        }

        let mut edges = Vec::with_capacity(path.len() - 1);
        let mut fee_bps = 0u32;
        for pair in path.windows(2) {
            let edge = self
                .mesh
                .edges_between(&pair[0], &pair[1])
                .into_iter()
                .filter(|e| e.liquidity >= request.amount)
                .min_by(|a, b| {
                    a.base_fee_bps
                        .cmp(&b.base_fee_bps)
                        .then(a.latency_ms.cmp(&b.latency_ms))
                        .then_with(|| a.id.cmp(&b.id))
                })?;
            fee_bps += edge.base_fee_bps;
            edges.push(edge.id);
        }
        Some(Route {
            nodes: path.clone(),
            edges,
            fee_bps,
        })
    }

    fn best_route(
        &self,
        request: &SettlementRequest,
        max_hops: usize,
        excluded: &BTreeSet<NodeId>,
    ) -> routing_engine::Result<Route> {
        let query = PathQuery::new(
            request.source.clone(),
            request.final_destination.clone(),
            max_hops,
        )
        .excluding(excluded.iter().cloned())
        .with_min_liquidity(request.amount)
        .with_limit(self.routing.k);

        self.finder
            .search(&query)?
            .first()
            .map(Route::from)
            .ok_or_else(|| routing_engine::Error::PathNotFound {
                source_node: request.source.clone(),
                destination: request.final_destination.clone(),
                max_hops,
            })
    }

    /// Whether the topology's best path runs through an open circuit
    /// and `route` is the substitute the health filter chose instead
    fn displaced_by_health(
        &self,
        request: &SettlementRequest,
        max_hops: usize,
        route: &Route,
    ) -> bool {
        let query = PathQuery::new(
            request.source.clone(),
            request.final_destination.clone(),
            max_hops,
        )
        .with_min_liquidity(request.amount)
        .with_limit(1)
        .ignoring_health();

        match self.finder.search(&query) {
            Ok(paths) => paths.first().is_some_and(|best| {
                best.nodes != route.nodes && best.nodes.iter().any(|n| self.circuits.is_open(n))
            }),
            Err(_) => false,
        }
    }

    /// Debit the route and record the settled outcome with its ledger entry
    fn complete(
        &self,
        request: &SettlementRequest,
        route: Route,
        latency_ms: u64,
        substituted: bool,
    ) -> Result<SettlementOutcome> {
        let mut debited = Vec::with_capacity(route.edges.len());
        for edge in &route.edges {
            match self.mesh.try_debit(edge, request.amount) {
                Ok(remaining) => {
                    debug!(edge = %edge, remaining, "edge debited");
                    debited.push(edge.clone());
                }
                Err(e) => {
                    warn!(edge = %edge, error = %e, "debit failed after hops confirmed");
                    self.credit_back(&debited, request.amount);
                    let outcome = SettlementOutcome::failed(
                        request.request_id,
                        e.kind(),
                        e.to_string(),
                        route.nodes,
                    );
                    return self.finish(request, outcome, None);
                }
            }
        }

        let mut outcome = SettlementOutcome::completed(
            request.request_id,
            route.nodes.clone(),
            route.fee_bps,
            latency_ms,
        );
        if substituted {
            outcome.status = SettlementStatus::Rerouted;
        }
        let transfer = SettledTransfer {
            request_id: request.request_id,
            origin: request.source.clone(),
            destination: request.final_destination.clone(),
            amount: request.amount,
            path: route.nodes,
            total_fee_bps: route.fee_bps,
            total_latency_ms: latency_ms,
            rerouted: substituted,
        };

        self.finish(request, outcome, Some(transfer))
            .map_err(|e| {
                self.credit_back(&debited, request.amount);
                e
            })
    }

    fn credit_back(&self, edges: &[EdgeId], amount: u64) {
        for edge in edges {
            if let Err(e) = self.mesh.credit(edge, amount) {
                warn!(edge = %edge, error = %e, "credit reversal failed");
            }
        }
    }

    /// Record a terminal outcome
    fn finish(
        &self,
        request: &SettlementRequest,
        outcome: SettlementOutcome,
        transfer: Option<SettledTransfer>,
    ) -> Result<SettlementOutcome> {
        let stored = self
            .store
            .commit(request.request_id, outcome, transfer)?;
        self.metrics.record_settlement(stored.status);

        if stored.is_success() {
            info!(
                status = stored.status.as_str(),
                path = ?stored.actual_path,
                fee_bps = stored.total_fee_bps,
                latency_ms = stored.total_latency_ms,
                ledger_entry = ?stored.ledger_entry_id,
                "settlement committed"
            );
        } else {
            warn!(
                error = stored.error.as_str(),
                path = ?stored.actual_path,
                message = %stored.error_message,
                "settlement failed"
            );
        }
        Ok(stored)
    }

    fn expire(&self, request_id: RequestId, path: Vec<NodeId>) -> Result<SettlementOutcome> {
        self.store.mark_unknown(request_id)?;
        warn!(path = ?path, "deadline expired, outcome unknown until recovered");
        let outcome =
            SettlementOutcome::failed(request_id, ErrorKind::Timeout, "deadline expired", path);
        self.metrics.record_settlement(outcome.status);
        Ok(outcome)
    }

    /// Promote an unknown record whose ledger entry exists
    fn resolve_from_ledger(&self, request_id: RequestId) -> Result<Option<SettlementOutcome>> {
        let Some(entry) = self.store.ledger_entry_for(request_id)? else {
            return Ok(None);
        };
        info!(entry_id = %entry.entry_id, "ledger entry found for unknown request");
        let outcome = entry.settled_outcome();
        let stored = self.store.commit(request_id, outcome, None)?;
        self.metrics.record_settlement(stored.status);
        Ok(Some(stored))
    }
}

/// In-process single-flight slot for one request id
struct Flight<'a> {
    orchestrator: &'a Orchestrator,
    request_id: RequestId,
    tx: watch::Sender<Option<SettlementOutcome>>,
    owns_record: bool,
}

impl Flight<'_> {
    fn publish(&mut self, outcome: &SettlementOutcome) {
        self.tx.send_replace(Some(outcome.clone()));
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.orchestrator.inflight.remove(&self.request_id);
        if self.owns_record {
            // Cancelled or failed mid-execution; the effect may have happened
            if let Err(e) = self.orchestrator.store.mark_unknown(self.request_id) {
                warn!(request_id = %self.request_id, error = %e, "could not mark request unknown");
            }
        }
    }
}

struct Executing<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> Executing<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, count }
    }

    fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

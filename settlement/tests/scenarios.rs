//! End-to-end settlement scenarios over an in-process mesh

use ledger_core::{IdempotencyState, MemoryStore, OutboxStore};
use protocol_core::{
    CircuitState, ErrorKind, HopMode, LocalFault, LocalTransport, NodeId, RequestSigner,
    SettlementRequest, SettlementStatus, SettlementTransport,
};
use risk_engine::{AdmissionConfig, CircuitBreakerConfig, CircuitBreakerRegistry};
use routing_engine::{Edge, InMemoryMesh, MeshStore, Node};
use settlement::{Config, MeshNode, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    mesh: Arc<dyn MeshStore>,
    transport: LocalTransport,
    store: Arc<dyn OutboxStore>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    fn new(nodes: Vec<Node>, edges: Vec<Edge>, config: Config) -> Self {
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let mesh: Arc<dyn MeshStore> = Arc::new(InMemoryMesh::from_parts(nodes, edges).unwrap());
        let transport = LocalTransport::new();
        let store: Arc<dyn OutboxStore> = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(
            Orchestrator::new(
                &config,
                Arc::clone(&mesh),
                Arc::new(transport.clone()),
                Arc::clone(&store),
            )
            .unwrap(),
        );

        for id in ids {
            let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
            let mut node = MeshNode::new(
                id.clone(),
                Arc::clone(&mesh),
                circuits,
                orchestrator.signers().cloned(),
                64,
            );
            if id.as_str() == "A" {
                node = node.with_orchestrator(Arc::clone(&orchestrator));
            }
            transport.register(id, Arc::new(node));
        }

        Self {
            mesh,
            transport,
            store,
            orchestrator,
        }
    }

    /// A -> B -> D is cheap, A -> C -> D is the expensive alternative
    fn diamond(config: Config) -> Self {
        Self::new(
            nodes(&["A", "B", "C", "D"]),
            vec![
                Edge::new("ab", "A", "B", 10, 20, 1_000),
                Edge::new("bd", "B", "D", 10, 20, 1_000),
                Edge::new("ac", "A", "C", 50, 40, 1_000),
                Edge::new("cd", "C", "D", 50, 40, 1_000),
            ],
            config,
        )
    }

    fn request(&self, amount: u64) -> SettlementRequest {
        let id = self.orchestrator.next_request_id().unwrap();
        SettlementRequest::new(id, "A".into(), "D".into(), amount)
    }

    fn calls(&self, node: &str) -> u64 {
        self.transport.hop_calls_to(&node.into())
    }

    fn liquidity(&self, edge: &str) -> u64 {
        self.mesh.get_edge(&edge.into()).unwrap().liquidity
    }
}

fn nodes(ids: &[&str]) -> Vec<Node> {
    ids.iter().map(|id| Node::new(*id, "EU")).collect()
}

fn path(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
}

#[tokio::test]
async fn test_settles_over_cheapest_path() {
    let h = Harness::diamond(Config::default());
    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(outcome.actual_path, path(&["A", "B", "D"]));
    assert_eq!(outcome.total_fee_bps, 20);
    assert!(outcome.ledger_entry_id.is_some());

    assert_eq!(h.liquidity("ab"), 900);
    assert_eq!(h.liquidity("bd"), 900);
    assert_eq!(h.liquidity("ac"), 1_000);
    assert_eq!(h.calls("C"), 0);

    let entries = h.store.ledger_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].transfer.amount, 100);
    assert_eq!(Some(entries[0].entry_id), outcome.ledger_entry_id);
}

#[tokio::test]
async fn test_open_circuit_on_intended_path_reroutes() {
    let h = Harness::diamond(Config::default());
    h.orchestrator.circuits().force_open(&"B".into());

    let request = h.request(100).with_path(path(&["A", "B", "D"]));
    let outcome = h.orchestrator.settle(request).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Rerouted);
    assert_eq!(outcome.actual_path, path(&["A", "C", "D"]));
    // Rejected locally, never called
    assert_eq!(h.calls("B"), 0);
    assert_eq!(h.orchestrator.metrics().reroutes_total.get(), 1);
    assert_eq!(h.liquidity("ab"), 1_000);
    assert_eq!(h.liquidity("ac"), 900);
}

#[tokio::test]
async fn test_open_circuit_without_intended_path_reports_rerouted() {
    let h = Harness::diamond(Config::default());
    h.orchestrator.circuits().force_open(&"B".into());

    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Rerouted);
    assert_eq!(outcome.actual_path, path(&["A", "C", "D"]));
    assert_eq!(h.calls("B"), 0);
    // Chosen up front, not after a failed attempt
    assert_eq!(h.orchestrator.metrics().reroutes_total.get(), 0);

    let entries = h.store.ledger_entries().unwrap();
    assert!(entries[0].transfer.rerouted);
    assert_eq!(entries[0].settled_outcome().status, SettlementStatus::Rerouted);

    // Healthy mesh: the cheapest path is not a substitution
    h.orchestrator.circuits().reset(&"B".into());
    let direct = h.orchestrator.settle(h.request(100)).await.unwrap();
    assert_eq!(direct.status, SettlementStatus::Completed);
    assert_eq!(direct.actual_path, path(&["A", "B", "D"]));
}

#[tokio::test]
async fn test_unreachable_intermediate_is_routed_around() {
    let h = Harness::diamond(Config::default());
    h.transport.inject_fault("B", LocalFault::Unreachable);

    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Rerouted);
    assert_eq!(outcome.actual_path, path(&["A", "C", "D"]));
    assert_eq!(h.calls("B"), 1);
    assert_eq!(
        h.orchestrator
            .metrics()
            .settlements(SettlementStatus::Rerouted),
        1
    );
}

#[tokio::test]
async fn test_reroutes_are_bounded() {
    let h = Harness::new(
        nodes(&["A", "X1", "X2", "D"]),
        vec![
            Edge::new("ax1", "A", "X1", 10, 20, 1_000),
            Edge::new("x1d", "X1", "D", 10, 20, 1_000),
            Edge::new("ax2", "A", "X2", 20, 20, 1_000),
            Edge::new("x2d", "X2", "D", 20, 20, 1_000),
        ],
        Config::default(),
    );
    h.transport.inject_fault("D", LocalFault::Unreachable);

    let request = h.request(100);
    let outcome = h.orchestrator.settle(request.clone()).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert_eq!(outcome.error, ErrorKind::NodeUnavailable);
    // First attempt plus three reroutes
    assert_eq!(h.calls("D"), 4);
    assert_eq!(h.orchestrator.metrics().reroutes_total.get(), 3);
    assert!(h.store.ledger_entries().unwrap().is_empty());

    // The failure is terminal; resubmission does not call anyone
    let calls = h.transport.total_hop_calls();
    let again = h.orchestrator.settle(request).await.unwrap();
    assert_eq!(again, outcome);
    assert_eq!(h.transport.total_hop_calls(), calls);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_settle_once() {
    let h = Harness::diamond(Config::default());
    h.transport
        .inject_fault("B", LocalFault::Delay(Duration::from_millis(20)));
    let request = h.request(100);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let request = request.clone();
        tasks.push(tokio::spawn(
            async move { orchestrator.settle(request).await },
        ));
    }

    let mut entry_ids = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, SettlementStatus::Completed);
        entry_ids.push(outcome.ledger_entry_id);
    }
    entry_ids.dedup();
    assert_eq!(entry_ids.len(), 1);
    assert!(entry_ids[0].is_some());

    assert_eq!(h.store.ledger_entries().unwrap().len(), 1);
    assert_eq!(h.calls("B"), 1);
    assert_eq!(h.liquidity("ab"), 900);
}

#[tokio::test]
async fn test_sequential_duplicate_returns_recorded_outcome() {
    let h = Harness::diamond(Config::default());
    let request = h.request(250);

    let first = h.orchestrator.settle(request.clone()).await.unwrap();
    let calls = h.transport.total_hop_calls();
    let second = h.orchestrator.settle(request).await.unwrap();

    assert_eq!(second, first);
    assert_eq!(h.transport.total_hop_calls(), calls);
    assert_eq!(h.liquidity("ab"), 750);
    assert_eq!(h.store.ledger_entries().unwrap().len(), 1);
}

#[tokio::test]
async fn test_no_path_is_terminal() {
    let h = Harness::new(
        nodes(&["A", "B", "D"]),
        vec![Edge::new("ab", "A", "B", 10, 20, 1_000)],
        Config::default(),
    );
    let request = h.request(100);
    let outcome = h.orchestrator.settle(request.clone()).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert_eq!(outcome.error, ErrorKind::PathNotFound);
    assert_eq!(h.transport.total_hop_calls(), 0);

    let record = h.store.get(request.request_id).unwrap().unwrap();
    assert!(matches!(record.state, IdempotencyState::Terminal(_)));
}

#[tokio::test]
async fn test_hop_bound_widens_once() {
    let h = Harness::new(
        nodes(&["A", "N1", "N2", "N3", "N4", "D"]),
        vec![
            Edge::new("e1", "A", "N1", 10, 20, 1_000),
            Edge::new("e2", "N1", "N2", 10, 20, 1_000),
            Edge::new("e3", "N2", "N3", 10, 20, 1_000),
            Edge::new("e4", "N3", "N4", 10, 20, 1_000),
            Edge::new("e5", "N4", "D", 10, 20, 1_000),
        ],
        Config::default(),
    );

    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(outcome.actual_path, path(&["A", "N1", "N2", "N3", "N4", "D"]));
}

#[tokio::test]
async fn test_liquidity_refusal_is_not_rerouted() {
    let h = Harness::diamond(Config::default());
    h.transport
        .inject_fault("B", LocalFault::Reject(ErrorKind::InsufficientLiquidity));

    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();

    assert_eq!(outcome.status, SettlementStatus::Failed);
    assert_eq!(outcome.error, ErrorKind::InsufficientLiquidity);
    assert_eq!(h.calls("C"), 0);
    assert_eq!(h.orchestrator.metrics().reroutes_total.get(), 0);
    // The peer answered promptly; its circuit stays closed
    assert_eq!(
        h.orchestrator.circuits().state(&"B".into()),
        CircuitState::Closed
    );
    assert_eq!(h.liquidity("ab"), 1_000);
}

#[tokio::test]
async fn test_signatures_are_required_when_configured() {
    let signer = RequestSigner::generate("bank-a");
    let mut config = Config::default();
    config.signers.insert(
        "bank-a".to_string(),
        hex::encode(signer.verifying_key().to_bytes()),
    );
    let h = Harness::diamond(config);

    let mut request = h.request(100);
    let unsigned = h.orchestrator.settle(request.clone()).await.unwrap();
    assert_eq!(unsigned.error, ErrorKind::SignatureInvalid);
    assert_eq!(h.transport.total_hop_calls(), 0);
    // Not recorded, so the id is not poisoned
    assert!(h.store.get(request.request_id).unwrap().is_none());

    signer.sign(&mut request);
    let signed = h.orchestrator.settle(request.clone()).await.unwrap();
    assert_eq!(signed.status, SettlementStatus::Completed);

    // Tampering with the amount breaks the signature
    let mut forged = request;
    forged.amount = 999;
    let rejected = h.orchestrator.settle(forged).await.unwrap();
    assert_eq!(rejected.error, ErrorKind::SignatureInvalid);
}

#[tokio::test]
async fn test_rate_limited_request_can_be_resubmitted() {
    let mut config = Config::default();
    config.admission = AdmissionConfig {
        window_ms: 100,
        per_node_limit: 1,
        ..Default::default()
    };
    let h = Harness::diamond(config);

    let first = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(first.status, SettlementStatus::Completed);

    let request = h.request(10);
    let limited = h.orchestrator.settle(request.clone()).await.unwrap();
    assert_eq!(limited.error, ErrorKind::RateLimited);
    assert!(limited.error.is_caller_retryable());
    assert!(h.store.get(request.request_id).unwrap().is_none());
    assert_eq!(h.orchestrator.metrics().admission_rejections.get(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let retried = h.orchestrator.settle(request).await.unwrap();
    assert_eq!(retried.status, SettlementStatus::Completed);
}

#[tokio::test]
async fn test_deadline_leaves_unknown_until_recovered() {
    let h = Harness::new(
        nodes(&["A", "B", "D"]),
        vec![
            Edge::new("ab", "A", "B", 10, 20, 1_000),
            Edge::new("bd", "B", "D", 10, 20, 1_000),
        ],
        Config::default(),
    );
    h.transport
        .inject_fault("B", LocalFault::Delay(Duration::from_millis(300)));

    let request = h.request(100);
    let expired = h
        .orchestrator
        .settle_with_deadline(request.clone(), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(expired.error, ErrorKind::Timeout);

    let record = h.store.get(request.request_id).unwrap().unwrap();
    assert!(matches!(record.state, IdempotencyState::Unknown));
    assert!(h.store.ledger_entries().unwrap().is_empty());
    assert_eq!(h.liquidity("ab"), 1_000);

    h.transport.clear_fault(&"B".into());
    let recovered = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].status, SettlementStatus::Completed);
    assert_eq!(h.store.ledger_entries().unwrap().len(), 1);
    assert!(h.store.unknown_requests().unwrap().is_empty());

    let again = h.orchestrator.settle(request).await.unwrap();
    assert_eq!(again, recovered[0]);
}

#[tokio::test]
async fn test_restart_marks_processing_unknown() {
    let h = Harness::diamond(Config::default());
    let request = h.request(100);
    // Claimed by a run that never finished
    h.store.claim(&request).unwrap();

    assert_eq!(h.orchestrator.mark_interrupted().unwrap(), 1);
    let recovered = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].is_success());
}

#[tokio::test]
async fn test_tripped_node_is_avoided_until_cool_down() {
    let mut config = Config::default();
    config.circuit = CircuitBreakerConfig {
        failure_threshold: 1,
        cool_down_ms: 100,
        ..Default::default()
    };
    let h = Harness::diamond(config);
    h.transport.inject_fault("B", LocalFault::Unreachable);

    let first = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(first.status, SettlementStatus::Rerouted);
    assert_eq!(h.orchestrator.metrics().circuit_trips.get(), 1);

    // Path search skips B while its circuit is open
    let second = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(second.status, SettlementStatus::Rerouted);
    assert_eq!(second.actual_path, path(&["A", "C", "D"]));
    assert_eq!(h.calls("B"), 1);

    h.transport.clear_fault(&"B".into());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let third = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(third.actual_path, path(&["A", "B", "D"]));
    assert_eq!(h.calls("B"), 2);
}

#[tokio::test]
async fn test_slow_hop_trips_latency_bound() {
    let h = Harness::diamond(Config::default());
    h.transport
        .inject_fault("B", LocalFault::Delay(Duration::from_millis(250)));

    let slow = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(slow.status, SettlementStatus::Completed);
    assert_eq!(slow.actual_path, path(&["A", "B", "D"]));
    assert!(slow.total_latency_ms >= 250);
    assert_eq!(
        h.orchestrator.circuits().state(&"B".into()),
        CircuitState::Open
    );
    assert_eq!(h.orchestrator.metrics().circuit_trips.get(), 1);

    let next = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(next.actual_path, path(&["A", "C", "D"]));
}

#[tokio::test]
async fn test_streaming_hop_mode() {
    let mut config = Config::default();
    config.orchestrator.hop_mode = HopMode::Streaming;
    let h = Harness::diamond(config);

    let outcome = h.orchestrator.settle(h.request(100)).await.unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(h.calls("B"), 1);
    assert_eq!(h.calls("D"), 1);
}

#[tokio::test]
async fn test_origination_through_hop_service() {
    let h = Harness::diamond(Config::default());
    let request = h.request(100);

    let outcome = h
        .transport
        .settle_hop(&"A".into(), request.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome.status, SettlementStatus::Completed);
    assert_eq!(outcome.actual_path, path(&["A", "B", "D"]));
    assert!(h.store.ledger_entry_for(request.request_id).unwrap().is_some());
}

#[tokio::test]
async fn test_cancelled_settlements_release_half_open_trials() {
    let mut config = Config::default();
    config.circuit = CircuitBreakerConfig {
        cool_down_ms: 20,
        ..Default::default()
    };
    let trials = config.circuit.half_open_max_trials;
    let h = Harness::diamond(config);
    let b = NodeId::from("B");

    h.orchestrator.circuits().force_open(&b);
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.transport
        .inject_fault("B", LocalFault::Delay(Duration::from_secs(5)));

    // Every trial slot is taken by a settlement that is then cancelled mid-hop
    let mut tasks = Vec::new();
    for _ in 0..trials {
        let orchestrator = Arc::clone(&h.orchestrator);
        let request = h.request(10);
        tasks.push(tokio::spawn(
            async move { orchestrator.settle(request).await },
        ));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.calls("B"), u64::from(trials));
    assert_eq!(
        h.orchestrator.circuits().state(&b),
        CircuitState::HalfOpen
    );
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        assert!(task.await.unwrap_err().is_cancelled());
    }

    h.transport.clear_fault(&b);
    let trial = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(trial.status, SettlementStatus::Completed);
    assert_eq!(trial.actual_path, path(&["A", "B", "D"]));
    assert_eq!(h.calls("B"), u64::from(trials) + 1);

    let closing = h.orchestrator.settle(h.request(10)).await.unwrap();
    assert_eq!(closing.actual_path, path(&["A", "B", "D"]));
    assert_eq!(h.orchestrator.circuits().state(&b), CircuitState::Closed);
}

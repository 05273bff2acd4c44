//! Configuration for a mesh node

use crate::node::{DEFAULT_REPLAY_CAPACITY, DEFAULT_REPLAY_WINDOW};
use crate::{Error, Result};
use ledger_core::{Backend, LedgerConfig};
use protocol_core::{HopMode, NetworkSettings, NodeId, TlsSettings};
use risk_engine::{AdmissionConfig, CircuitBreakerConfig};
use routing_engine::{ScoringWeights, DEFAULT_MAX_HOPS, MAX_CANDIDATE_PATHS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's id in the topology
    pub node_id: String,

    /// gRPC listen address
    pub listen_addr: String,

    /// Snowflake worker id for requests originated here
    pub worker_id: u16,

    /// JSON topology document
    pub topology_path: Option<PathBuf>,

    /// Emit JSON log lines
    pub log_json: bool,

    /// Serve Prometheus metrics
    pub metrics_enabled: bool,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// Network timeouts
    pub network: NetworkSettings,

    /// Mutual TLS material; required unless `insecure_plaintext` is set
    pub tls: Option<TlsSettings>,

    /// Serve and dial without TLS (local development only)
    pub insecure_plaintext: bool,

    /// Circuit breakers
    pub circuit: CircuitBreakerConfig,

    /// Admission control
    pub admission: AdmissionConfig,

    /// Path search
    pub routing: RoutingConfig,

    /// Settlement orchestration
    pub orchestrator: OrchestratorConfig,

    /// Peer heartbeats
    pub health: HealthConfig,

    /// Outbox and ledger storage
    pub ledger: LedgerConfig,

    /// Peer node id -> endpoint
    pub peers: HashMap<String, String>,

    /// Signer key id -> hex Ed25519 public key
    pub signers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            listen_addr: "0.0.0.0:50061".to_string(),
            worker_id: 1,
            topology_path: None,
            log_json: false,
            metrics_enabled: true,
            metrics_listen_addr: "0.0.0.0:9464".to_string(),
            network: NetworkSettings::default(),
            tls: None,
            insecure_plaintext: false,
            circuit: CircuitBreakerConfig::default(),
            admission: AdmissionConfig::default(),
            routing: RoutingConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            health: HealthConfig::default(),
            ledger: LedgerConfig::default(),
            peers: HashMap::new(),
            signers: HashMap::new(),
        }
    }
}

/// Path search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Hop bound of the first search
    pub max_hops: usize,

    /// Extra hops granted once when nothing fits the bound
    pub widen_step: usize,

    /// Candidate paths per search
    pub k: usize,

    /// Heuristic Settlement Score weights
    pub weights: ScoringWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            widen_step: 2,
            k: MAX_CANDIDATE_PATHS,
            weights: ScoringWeights::default(),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Reroutes after the first attempt
    pub max_reroutes: u32,

    /// Unary or streaming hop calls
    pub hop_mode: HopMode,

    /// Deadline applied when the caller supplies none (ms)
    pub default_deadline_ms: u64,

    /// Settlements executing at once that count as full load
    pub max_in_flight: usize,

    /// Hops a node accepts concurrently before reporting itself unavailable
    pub max_pending_hops: u32,

    /// How long a node answers a replayed hop from memory (ms)
    pub replay_window_ms: u64,

    /// Confirmed hops a node remembers at most
    pub replay_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_reroutes: 3,
            hop_mode: HopMode::Unary,
            default_deadline_ms: 120_000,
            max_in_flight: 1_000,
            max_pending_hops: 256,
            replay_window_ms: DEFAULT_REPLAY_WINDOW.as_millis() as u64,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Default deadline
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    /// Hop replay window
    pub fn replay_window(&self) -> Duration {
        Duration::from_millis(self.replay_window_ms)
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Heartbeat round interval (ms)
    pub interval_ms: u64,

    /// Random extra delay per round, up to this many ms
    pub jitter_ms: u64,

    /// Timeout of one heartbeat call (ms)
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            jitter_ms: 500,
            timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Defaults overridden by `MESH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides read through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .parse()
                .map_err(|_| Error::Config(format!("{} has an invalid value: {}", key, value)))
        }

        if let Some(id) = var("MESH_NODE_ID") {
            self.node_id = id;
        }
        if let Some(addr) = var("MESH_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(worker) = var("MESH_WORKER_ID") {
            self.worker_id = parse("MESH_WORKER_ID", worker)?;
        }
        if let Some(path) = var("MESH_TOPOLOGY") {
            self.topology_path = Some(PathBuf::from(path));
        }
        if let Some(json) = var("MESH_LOG_JSON") {
            self.log_json = parse("MESH_LOG_JSON", json)?;
        }
        if let Some(addr) = var("MESH_METRICS_ADDR") {
            self.metrics_listen_addr = addr;
        }
        if let Some(dir) = var("MESH_LEDGER_DIR") {
            self.ledger.data_dir = PathBuf::from(dir);
            self.ledger.backend = Backend::Rocksdb;
        }
        if let Some(dir) = var("MESH_TLS_DIR") {
            self.tls = Some(TlsSettings::in_dir(dir, &self.node_id));
        }
        if let Some(plaintext) = var("MESH_INSECURE_PLAINTEXT") {
            self.insecure_plaintext = parse("MESH_INSECURE_PLAINTEXT", plaintext)?;
        }
        if let Some(ms) = var("MESH_CALL_TIMEOUT_MS") {
            self.network.call_timeout_ms = parse("MESH_CALL_TIMEOUT_MS", ms)?;
        }
        if let Some(hops) = var("MESH_MAX_HOPS") {
            self.routing.max_hops = parse("MESH_MAX_HOPS", hops)?;
        }
        if let Some(mode) = var("MESH_HOP_MODE") {
            self.orchestrator.hop_mode = match mode.as_str() {
                "unary" => HopMode::Unary,
                "streaming" => HopMode::Streaming,
                other => {
                    return Err(Error::Config(format!(
                        "MESH_HOP_MODE must be unary or streaming, got {}",
                        other
                    )))
                }
            };
        }
        // MESH_PEERS=B=10.0.0.2:50061,C=10.0.0.3:50061
        if let Some(peers) = var("MESH_PEERS") {
            for entry in peers.split(',').filter(|e| !e.trim().is_empty()) {
                let (id, addr) = entry
                    .split_once('=')
                    .ok_or_else(|| Error::Config(format!("bad MESH_PEERS entry: {}", entry)))?;
                self.peers.insert(id.trim().to_string(), addr.trim().to_string());
            }
        }
        Ok(())
    }

    /// This node's id
    pub fn node(&self) -> NodeId {
        NodeId::from(self.node_id.as_str())
    }

    /// Peer endpoints keyed by node id
    pub fn peer_endpoints(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|(id, addr)| (NodeId::from(id.as_str()), addr.clone()))
            .collect()
    }

    /// Reject impossible values and an unauthenticated transport
    pub fn validate(&self) -> Result<()> {
        self.validate_engine()?;
        self.validate_transport()
    }

    /// Transport must be mutual TLS unless plaintext was asked for explicitly
    pub fn validate_transport(&self) -> Result<()> {
        match (&self.tls, self.insecure_plaintext) {
            (None, false) => Err(Error::Config(
                "tls must be configured (set insecure_plaintext = true for local development)"
                    .to_string(),
            )),
            (Some(_), true) => Err(Error::Config(
                "tls and insecure_plaintext are mutually exclusive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Reject values that would break routing, orchestration or storage
    pub fn validate_engine(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must be set".to_string()));
        }
        self.circuit.validate()?;
        self.admission.validate()?;
        self.routing.weights.validate()?;
        self.ledger.validate()?;
        if self.routing.max_hops == 0 {
            return Err(Error::Config("routing.max_hops must be > 0".to_string()));
        }
        if self.routing.k == 0 || self.routing.k > MAX_CANDIDATE_PATHS {
            return Err(Error::Config(format!(
                "routing.k must be in 1..={}",
                MAX_CANDIDATE_PATHS
            )));
        }
        if self.network.call_timeout_ms == 0 || self.network.dial_timeout_ms == 0 {
            return Err(Error::Config("network timeouts must be > 0".to_string()));
        }
        if self.orchestrator.default_deadline_ms == 0
            || self.orchestrator.max_in_flight == 0
            || self.orchestrator.max_pending_hops == 0
            || self.orchestrator.replay_window_ms == 0
            || self.orchestrator.replay_capacity == 0
        {
            return Err(Error::Config(
                "orchestrator deadline and capacity limits must be > 0".to_string(),
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(Error::Config("health.interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate_engine().unwrap();
        assert_eq!(config.network.dial_timeout_ms, 10_000);
        assert_eq!(config.network.call_timeout_ms, 30_000);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.latency_bound_ms, 200);
        assert_eq!(config.orchestrator.max_reroutes, 3);
        assert_eq!(config.routing.max_hops, 4);
        assert_eq!(config.routing.k, 10);
        assert_eq!(config.orchestrator.replay_window(), DEFAULT_REPLAY_WINDOW);
    }

    #[test]
    fn test_plaintext_requires_opt_in() {
        let config = Config::default();
        assert!(config.tls.is_none());
        assert!(!config.insecure_plaintext);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut plaintext = Config::default();
        plaintext.insecure_plaintext = true;
        plaintext.validate().unwrap();

        let mut tls = Config::default();
        tls.tls = Some(TlsSettings::in_dir("/etc/mesh", "node-1"));
        tls.validate().unwrap();

        tls.insecure_plaintext = true;
        assert!(matches!(tls.validate(), Err(Error::Config(_))));

        let mut from_env = Config::default();
        from_env
            .apply_env(|key| (key == "MESH_INSECURE_PLAINTEXT").then(|| "true".to_string()))
            .unwrap();
        from_env.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
node_id = "A"
listen_addr = "127.0.0.1:7000"

[tls]
cert_path = "/etc/mesh/A.crt"
key_path = "/etc/mesh/A.key"
ca_cert_path = "/etc/mesh/ca.crt"

[orchestrator]
hop_mode = "streaming"
max_reroutes = 2

[routing.weights]
cost = 0.6
sovereignty = 0.2
integrity = 0.2

[peers]
B = "127.0.0.1:7001"

[ledger]
backend = "rocksdb"
data_dir = "/tmp/ledger-a"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node(), NodeId::from("A"));
        assert_eq!(config.orchestrator.hop_mode, HopMode::Streaming);
        assert_eq!(config.orchestrator.max_reroutes, 2);
        assert_eq!(config.orchestrator.max_in_flight, 1_000);
        assert_eq!(config.routing.max_hops, DEFAULT_MAX_HOPS);
        assert_eq!(config.ledger.backend, Backend::Rocksdb);
        assert_eq!(
            config.tls.as_ref().map(|t| t.ca_cert_path.clone()),
            Some(PathBuf::from("/etc/mesh/ca.crt"))
        );
        assert_eq!(
            config.peer_endpoints().get(&NodeId::from("B")),
            Some(&"127.0.0.1:7001".to_string())
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_NODE_ID", "C"),
            ("MESH_MAX_HOPS", "6"),
            ("MESH_HOP_MODE", "streaming"),
            ("MESH_PEERS", "A=10.0.0.1:1,B=10.0.0.2:2"),
            ("MESH_TLS_DIR", "/etc/mesh"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.node_id, "C");
        assert_eq!(config.routing.max_hops, 6);
        assert_eq!(config.orchestrator.hop_mode, HopMode::Streaming);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(
            config.tls.unwrap().cert_path,
            PathBuf::from("/etc/mesh/C.crt")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.routing.max_hops = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.routing.weights.cost = 0.9;
        assert!(matches!(config.validate(), Err(Error::Routing(_))));

        let mut config = Config::default();
        config.circuit.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(Error::Risk(_))));

        let mut config = Config::default();
        assert!(config
            .apply_env(|key| (key == "MESH_WORKER_ID").then(|| "many".to_string()))
            .is_err());
    }
}

//! Core types shared by every mesh component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Mesh node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create new node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Settlement request identifier (Snowflake layout, see [`crate::snowflake`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Big-endian bytes; preserves ordering when used as a storage key
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement priority tier
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// First to be shed under load
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Time-sensitive transfers
    High,
    /// Never shed while any capacity remains
    Critical,
}

impl Priority {
    /// All tiers, lowest first
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    fn code(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Settlement lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Accepted, not started
    Pending,
    /// Executing (or being executed by a concurrent submission)
    Processing,
    /// Settled along a path with no substitution
    Completed,
    /// Terminal failure
    Failed,
    /// Settled after a path substitution
    Rerouted,
}

impl SettlementStatus {
    /// Terminal statuses are never changed once recorded
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementStatus::Completed | SettlementStatus::Failed | SettlementStatus::Rerouted
        )
    }

    /// Value moved end to end
    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Rerouted)
    }

    /// Stable lowercase name (metric label)
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Processing => "processing",
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Rerouted => "rerouted",
        }
    }
}

/// Error classification carried on every failed outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No error
    #[default]
    None,
    /// Edge cannot carry the amount
    InsufficientLiquidity,
    /// Peer unreachable or saturated
    NodeUnavailable,
    /// Peer rejected locally by its circuit breaker
    CircuitOpen,
    /// Admission control rejected the attempt
    RateLimited,
    /// Request signature did not verify
    SignatureInvalid,
    /// No active, healthy path within the hop bound
    PathNotFound,
    /// Call or deadline expired
    Timeout,
    /// Unclassified internal fault
    Internal,
}

impl ErrorKind {
    /// Retried inside the orchestrator by rerouting around the failing node
    pub fn is_reroutable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NodeUnavailable | ErrorKind::CircuitOpen | ErrorKind::Timeout
        )
    }

    /// Retried only by the caller, after backoff, with the same request id
    pub fn is_caller_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited)
    }

    /// Surfaced immediately without any retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InsufficientLiquidity
                | ErrorKind::SignatureInvalid
                | ErrorKind::PathNotFound
                | ErrorKind::Internal
        )
    }

    /// Wire-level snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::InsufficientLiquidity => "insufficient_liquidity",
            ErrorKind::NodeUnavailable => "node_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::PathNotFound => "path_not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state as reported on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow
    #[default]
    Closed,
    /// Requests rejected without a network call
    Open,
    /// Bounded trial requests allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Settlement request, used both for the caller's submission and for each hop
///
/// Only `source`, `target`, `path` and `hop_index` change as the request
/// advances; everything covered by the signature stays fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRequest {
    /// Globally unique, monotonically orderable id
    pub request_id: RequestId,
    /// Sending node of the current hop (the origin on submission)
    pub source: NodeId,
    /// Receiving node of the current hop
    pub target: NodeId,
    /// Where the value must end up
    pub final_destination: NodeId,
    /// Integer minor units
    pub amount: u64,
    /// Full intended path, origin first
    pub path: Vec<NodeId>,
    /// Index into `path` of the current hop's sending node
    pub hop_index: u32,
    /// Ed25519 signature over [`SettlementRequest::canonical_bytes`]
    pub signature: Vec<u8>,
    /// Submission time
    pub timestamp: DateTime<Utc>,
    /// Admission priority
    pub priority: Priority,
    /// Opaque caller metadata
    pub metadata: HashMap<String, String>,
}

impl SettlementRequest {
    /// Create an unsigned submission from `source` to `final_destination`
    pub fn new(
        request_id: RequestId,
        source: NodeId,
        final_destination: NodeId,
        amount: u64,
    ) -> Self {
        Self {
            request_id,
            target: final_destination.clone(),
            source,
            final_destination,
            amount,
            path: Vec::new(),
            hop_index: 0,
            signature: Vec::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
            metadata: HashMap::new(),
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set intended path
    pub fn with_path(mut self, path: Vec<NodeId>) -> Self {
        self.path = path;
        self
    }

    /// Derive the request for hop `hop_index` along `path`
    pub fn for_hop(&self, path: &[NodeId], hop_index: usize) -> Self {
        let mut hop = self.clone();
        hop.source = path[hop_index].clone();
        hop.target = path[hop_index + 1].clone();
        hop.path = path.to_vec();
        hop.hop_index = hop_index as u32;
        hop
    }

    /// Node the current hop's receiver must forward to, if any
    pub fn next_after_target(&self) -> Option<&NodeId> {
        if self.target == self.final_destination {
            return None;
        }
        self.path.get(self.hop_index as usize + 2)
    }

    /// Deterministic encoding of the fields that never change as the request advances
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + self.final_destination.as_str().len());
        bytes.extend_from_slice(b"mesh.settlement.v1");
        bytes.extend_from_slice(&self.request_id.to_be_bytes());
        bytes.extend_from_slice(&(self.final_destination.as_str().len() as u32).to_be_bytes());
        bytes.extend_from_slice(self.final_destination.as_str().as_bytes());
        bytes.extend_from_slice(&self.amount.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.timestamp_millis().to_be_bytes());
        bytes.push(self.priority.code());
        bytes
    }
}

/// Result of a hop or of a whole settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    /// Request this outcome answers
    pub request_id: RequestId,
    /// Status
    pub status: SettlementStatus,
    /// Ledger entry written for a settled request
    pub ledger_entry_id: Option<Uuid>,
    /// Originating error kind (`None` on success)
    pub error: ErrorKind,
    /// Human-readable error detail
    pub error_message: String,
    /// Path actually taken or attempted
    pub actual_path: Vec<NodeId>,
    /// Sum of base fees along the actual path
    pub total_fee_bps: u32,
    /// Sum of observed hop latencies
    pub total_latency_ms: u64,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

impl SettlementOutcome {
    /// Successful outcome
    pub fn completed(
        request_id: RequestId,
        actual_path: Vec<NodeId>,
        total_fee_bps: u32,
        total_latency_ms: u64,
    ) -> Self {
        Self {
            request_id,
            status: SettlementStatus::Completed,
            ledger_entry_id: None,
            error: ErrorKind::None,
            error_message: String::new(),
            actual_path,
            total_fee_bps,
            total_latency_ms,
            completed_at: Some(Utc::now()),
        }
    }

    /// Failed outcome carrying the originating error kind
    pub fn failed(
        request_id: RequestId,
        error: ErrorKind,
        message: impl Into<String>,
        actual_path: Vec<NodeId>,
    ) -> Self {
        Self {
            request_id,
            status: SettlementStatus::Failed,
            ledger_entry_id: None,
            error,
            error_message: message.into(),
            actual_path,
            total_fee_bps: 0,
            total_latency_ms: 0,
            completed_at: Some(Utc::now()),
        }
    }

    /// Request is being executed elsewhere
    pub fn processing(request_id: RequestId) -> Self {
        Self {
            request_id,
            status: SettlementStatus::Processing,
            ledger_entry_id: None,
            error: ErrorKind::None,
            error_message: String::new(),
            actual_path: Vec::new(),
            total_fee_bps: 0,
            total_latency_ms: 0,
            completed_at: None,
        }
    }

    /// Whether this outcome confirms the hop or settlement
    pub fn is_success(&self) -> bool {
        self.status.is_settled()
    }
}

/// Point status of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node
    pub node_id: NodeId,
    /// Topology active flag
    pub active: bool,
    /// Circuit state as seen by the node
    pub circuit_state: CircuitState,
    /// Pending settlements relative to capacity (0.0 - 1.0)
    pub current_load: f64,
    /// Sum of outgoing liquidity
    pub available_liquidity: u64,
    /// Hops currently being processed
    pub pending_settlements: u32,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

/// Heartbeat answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    /// Responding node
    pub node_id: NodeId,
    /// Liveness
    pub healthy: bool,
    /// Responder clock
    pub timestamp: DateTime<Utc>,
    /// Responder software version
    pub version: String,
}

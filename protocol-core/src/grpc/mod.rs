//! gRPC binding of the hop protocol (`mesh.v1`)

pub mod client;
pub mod server;

pub use client::GrpcTransport;
pub use server::{serve_with_tls, GrpcHopService};

/// Generated protobuf and tonic code
#[allow(missing_docs, clippy::all)]
pub mod pb {
    tonic::include_proto!("mesh.v1");
}

use crate::{
    CircuitState, Error, ErrorKind, HeartbeatReply, NodeId, NodeStatus, Priority, RequestId,
    Result, SettlementOutcome, SettlementRequest, SettlementStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::InvalidMessage(format!("timestamp out of range: {}", ms)))
}

fn node_ids(ids: Vec<String>) -> Vec<NodeId> {
    ids.into_iter().map(NodeId::from).collect()
}

fn id_strings(ids: &[NodeId]) -> Vec<String> {
    ids.iter().map(|n| n.as_str().to_string()).collect()
}

impl From<Priority> for pb::Priority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Low => pb::Priority::Low,
            Priority::Normal => pb::Priority::Normal,
            Priority::High => pb::Priority::High,
            Priority::Critical => pb::Priority::Critical,
        }
    }
}

impl From<pb::Priority> for Priority {
    fn from(p: pb::Priority) -> Self {
        match p {
            pb::Priority::Low => Priority::Low,
            pb::Priority::Normal => Priority::Normal,
            pb::Priority::High => Priority::High,
            pb::Priority::Critical => Priority::Critical,
        }
    }
}

impl From<SettlementStatus> for pb::SettlementStatus {
    fn from(s: SettlementStatus) -> Self {
        match s {
            SettlementStatus::Pending => pb::SettlementStatus::Pending,
            SettlementStatus::Processing => pb::SettlementStatus::Processing,
            SettlementStatus::Completed => pb::SettlementStatus::Completed,
            SettlementStatus::Failed => pb::SettlementStatus::Failed,
            SettlementStatus::Rerouted => pb::SettlementStatus::Rerouted,
        }
    }
}

impl From<pb::SettlementStatus> for SettlementStatus {
    fn from(s: pb::SettlementStatus) -> Self {
        match s {
            pb::SettlementStatus::Pending => SettlementStatus::Pending,
            pb::SettlementStatus::Processing => SettlementStatus::Processing,
            pb::SettlementStatus::Completed => SettlementStatus::Completed,
            pb::SettlementStatus::Failed => SettlementStatus::Failed,
            pb::SettlementStatus::Rerouted => SettlementStatus::Rerouted,
        }
    }
}

impl From<ErrorKind> for pb::ErrorCode {
    fn from(k: ErrorKind) -> Self {
        match k {
            ErrorKind::None => pb::ErrorCode::None,
            ErrorKind::InsufficientLiquidity => pb::ErrorCode::InsufficientLiquidity,
            ErrorKind::NodeUnavailable => pb::ErrorCode::NodeUnavailable,
            ErrorKind::CircuitOpen => pb::ErrorCode::CircuitOpen,
            ErrorKind::RateLimited => pb::ErrorCode::RateLimited,
            ErrorKind::SignatureInvalid => pb::ErrorCode::SignatureInvalid,
            ErrorKind::PathNotFound => pb::ErrorCode::PathNotFound,
            ErrorKind::Timeout => pb::ErrorCode::Timeout,
            ErrorKind::Internal => pb::ErrorCode::Internal,
        }
    }
}

impl From<pb::ErrorCode> for ErrorKind {
    fn from(c: pb::ErrorCode) -> Self {
        match c {
            pb::ErrorCode::None => ErrorKind::None,
            pb::ErrorCode::InsufficientLiquidity => ErrorKind::InsufficientLiquidity,
            pb::ErrorCode::NodeUnavailable => ErrorKind::NodeUnavailable,
            pb::ErrorCode::CircuitOpen => ErrorKind::CircuitOpen,
            pb::ErrorCode::RateLimited => ErrorKind::RateLimited,
            pb::ErrorCode::SignatureInvalid => ErrorKind::SignatureInvalid,
            pb::ErrorCode::PathNotFound => ErrorKind::PathNotFound,
            pb::ErrorCode::Timeout => ErrorKind::Timeout,
            pb::ErrorCode::Internal => ErrorKind::Internal,
        }
    }
}

impl From<CircuitState> for pb::CircuitState {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => pb::CircuitState::Closed,
            CircuitState::Open => pb::CircuitState::Open,
            CircuitState::HalfOpen => pb::CircuitState::HalfOpen,
        }
    }
}

impl From<pb::CircuitState> for CircuitState {
    fn from(s: pb::CircuitState) -> Self {
        match s {
            pb::CircuitState::Closed => CircuitState::Closed,
            pb::CircuitState::Open => CircuitState::Open,
            pb::CircuitState::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

impl From<&SettlementRequest> for pb::HopRequest {
    fn from(r: &SettlementRequest) -> Self {
        Self {
            request_id: r.request_id.value(),
            source_id: r.source.as_str().to_string(),
            target_id: r.target.as_str().to_string(),
            final_destination_id: r.final_destination.as_str().to_string(),
            amount: r.amount,
            path: id_strings(&r.path),
            current_hop: r.hop_index,
            signature: r.signature.clone(),
            timestamp_ms: r.timestamp.timestamp_millis(),
            priority: pb::Priority::from(r.priority) as i32,
            metadata: r.metadata.clone(),
        }
    }
}

impl TryFrom<pb::HopRequest> for SettlementRequest {
    type Error = Error;

    fn try_from(r: pb::HopRequest) -> Result<Self> {
        if r.source_id.is_empty() || r.target_id.is_empty() || r.final_destination_id.is_empty()
        {
            return Err(Error::InvalidMessage(
                "source, target and final destination are required".to_string(),
            ));
        }
        let priority = Priority::from(r.priority());
        Ok(Self {
            request_id: RequestId::new(r.request_id),
            source: NodeId::from(r.source_id),
            target: NodeId::from(r.target_id),
            final_destination: NodeId::from(r.final_destination_id),
            amount: r.amount,
            path: node_ids(r.path),
            hop_index: r.current_hop,
            signature: r.signature,
            timestamp: timestamp(r.timestamp_ms)?,
            priority,
            metadata: r.metadata,
        })
    }
}

impl From<&SettlementOutcome> for pb::HopResponse {
    fn from(o: &SettlementOutcome) -> Self {
        Self {
            request_id: o.request_id.value(),
            status: pb::SettlementStatus::from(o.status) as i32,
            ledger_entry_id: o
                .ledger_entry_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            error_code: pb::ErrorCode::from(o.error) as i32,
            error_message: o.error_message.clone(),
            actual_path: id_strings(&o.actual_path),
            total_fee_bps: o.total_fee_bps,
            total_latency_ms: o.total_latency_ms,
            completed_at_ms: o.completed_at.map(|t| t.timestamp_millis()).unwrap_or(0),
        }
    }
}

impl TryFrom<pb::HopResponse> for SettlementOutcome {
    type Error = Error;

    fn try_from(r: pb::HopResponse) -> Result<Self> {
        let ledger_entry_id = if r.ledger_entry_id.is_empty() {
            None
        } else {
            Some(
                Uuid::parse_str(&r.ledger_entry_id)
                    .map_err(|e| Error::InvalidMessage(format!("ledger entry id: {}", e)))?,
            )
        };
        let completed_at = if r.completed_at_ms == 0 {
            None
        } else {
            Some(timestamp(r.completed_at_ms)?)
        };
        let status = SettlementStatus::from(r.status());
        let error = ErrorKind::from(r.error_code());
        Ok(Self {
            request_id: RequestId::new(r.request_id),
            status,
            ledger_entry_id,
            error,
            error_message: r.error_message,
            actual_path: node_ids(r.actual_path),
            total_fee_bps: r.total_fee_bps,
            total_latency_ms: r.total_latency_ms,
            completed_at,
        })
    }
}

impl From<&NodeStatus> for pb::NodeStatusResponse {
    fn from(s: &NodeStatus) -> Self {
        Self {
            node_id: s.node_id.as_str().to_string(),
            active: s.active,
            circuit_state: pb::CircuitState::from(s.circuit_state) as i32,
            current_load: s.current_load,
            available_liquidity: s.available_liquidity,
            pending_settlements: s.pending_settlements,
            timestamp_ms: s.timestamp.timestamp_millis(),
        }
    }
}

impl TryFrom<pb::NodeStatusResponse> for NodeStatus {
    type Error = Error;

    fn try_from(s: pb::NodeStatusResponse) -> Result<Self> {
        let circuit_state = CircuitState::from(s.circuit_state());
        Ok(Self {
            node_id: NodeId::from(s.node_id),
            active: s.active,
            circuit_state,
            current_load: s.current_load,
            available_liquidity: s.available_liquidity,
            pending_settlements: s.pending_settlements,
            timestamp: timestamp(s.timestamp_ms)?,
        })
    }
}

impl From<&HeartbeatReply> for pb::HeartbeatResponse {
    fn from(h: &HeartbeatReply) -> Self {
        Self {
            healthy: h.healthy,
            timestamp_ms: h.timestamp.timestamp_millis(),
            version: h.version.clone(),
        }
    }
}

/// Heartbeat responses do not carry the responder id; the caller supplies it
pub fn heartbeat_reply(peer: &NodeId, h: pb::HeartbeatResponse) -> Result<HeartbeatReply> {
    Ok(HeartbeatReply {
        node_id: peer.clone(),
        healthy: h.healthy,
        timestamp: timestamp(h.timestamp_ms)?,
        version: h.version,
    })
}

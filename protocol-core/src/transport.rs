//! Settlement transport capability
//!
//! [`SettlementTransport`] is the caller side of the hop protocol, with a
//! unary and a streaming variant of the hop call. [`HopHandler`] is the
//! receiving side; transports dispatch into it.

use crate::{HeartbeatReply, NodeId, NodeStatus, Result, SettlementOutcome, SettlementRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the orchestrator drives hop calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopMode {
    /// One request/response call per hop
    #[default]
    Unary,
    /// One streaming session per peer, reused across hops of a settlement
    Streaming,
}

/// Receiving side of the hop protocol
#[async_trait]
pub trait HopHandler: Send + Sync {
    /// Process one hop. Failures are reported in the outcome's error kind.
    async fn handle_hop(&self, request: SettlementRequest) -> SettlementOutcome;

    /// Point status of this node
    async fn status(&self) -> NodeStatus;

    /// Liveness check from `from`
    async fn heartbeat(&self, from: &NodeId) -> HeartbeatReply;
}

/// Open streaming session to one peer; responses come back in request order
#[async_trait]
pub trait HopStream: Send {
    /// Send one hop on the session and wait up to `timeout` for its response
    async fn send_hop(
        &mut self,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome>;
}

/// Caller side of the hop protocol
///
/// An `Err` means the call itself did not complete (peer unreachable,
/// timeout, stream closed). A peer that answered with a failure returns
/// `Ok` with a failed outcome.
#[async_trait]
pub trait SettlementTransport: Send + Sync {
    /// Unary hop call bounded by `timeout`
    async fn settle_hop(
        &self,
        peer: &NodeId,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome>;

    /// Open a bidirectional hop stream to `peer`
    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn HopStream>>;

    /// Query a peer's status
    async fn node_status(&self, peer: &NodeId, timeout: Duration) -> Result<NodeStatus>;

    /// Heartbeat a peer on behalf of `from`
    async fn heartbeat(
        &self,
        peer: &NodeId,
        from: &NodeId,
        timeout: Duration,
    ) -> Result<HeartbeatReply>;
}

//! In-process transport
//!
//! Dispatches hop calls straight to registered [`HopHandler`]s. Faults can be
//! injected per peer, which makes it the transport of choice for tests and
//! local simulation of a mesh.

use crate::transport::{HopHandler, HopStream, SettlementTransport};
use crate::{
    Error, ErrorKind, HeartbeatReply, NodeId, NodeStatus, Result, SettlementOutcome,
    SettlementRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fault injected for calls to one peer
#[derive(Debug, Clone, PartialEq)]
pub enum LocalFault {
    /// Calls fail as if the peer were down
    Unreachable,
    /// Calls are delayed before reaching the handler
    Delay(Duration),
    /// Calls are answered with a failed outcome of this kind
    Reject(ErrorKind),
}

#[derive(Default)]
struct Inner {
    handlers: DashMap<NodeId, Arc<dyn HopHandler>>,
    faults: DashMap<NodeId, LocalFault>,
    hop_calls: DashMap<NodeId, u64>,
    total_hop_calls: AtomicU64,
}

/// In-process [`SettlementTransport`]
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<Inner>,
}

impl LocalTransport {
    /// Empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `node` to `handler`
    pub fn register(&self, node: impl Into<NodeId>, handler: Arc<dyn HopHandler>) {
        self.inner.handlers.insert(node.into(), handler);
    }

    /// Inject a fault for `node`
    pub fn inject_fault(&self, node: impl Into<NodeId>, fault: LocalFault) {
        self.inner.faults.insert(node.into(), fault);
    }

    /// Remove any fault for `node`
    pub fn clear_fault(&self, node: &NodeId) {
        self.inner.faults.remove(node);
    }

    /// Hop calls made to `node` (unary and streamed)
    pub fn hop_calls_to(&self, node: &NodeId) -> u64 {
        self.inner.hop_calls.get(node).map(|c| *c).unwrap_or(0)
    }

    /// Hop calls made to any node
    pub fn total_hop_calls(&self) -> u64 {
        self.inner.total_hop_calls.load(Ordering::SeqCst)
    }

    fn handler(&self, peer: &NodeId) -> Result<Arc<dyn HopHandler>> {
        self.inner
            .handlers
            .get(peer)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))
    }

    fn fault(&self, peer: &NodeId) -> Option<LocalFault> {
        self.inner.faults.get(peer).map(|f| f.value().clone())
    }

    async fn apply_fault(&self, peer: &NodeId) -> Result<Option<ErrorKind>> {
        match self.fault(peer) {
            Some(LocalFault::Unreachable) => Err(Error::Transport {
                peer: peer.to_string(),
                reason: "connection refused".to_string(),
            }),
            Some(LocalFault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            Some(LocalFault::Reject(kind)) => Ok(Some(kind)),
            None => Ok(None),
        }
    }

    async fn dispatch(
        &self,
        peer: &NodeId,
        request: SettlementRequest,
    ) -> Result<SettlementOutcome> {
        *self.inner.hop_calls.entry(peer.clone()).or_insert(0) += 1;
        self.inner.total_hop_calls.fetch_add(1, Ordering::SeqCst);
        debug!(%peer, request_id = %request.request_id, hop = request.hop_index, "local hop dispatch");

        let handler = self.handler(peer)?;
        if let Some(kind) = self.apply_fault(peer).await? {
            return Ok(SettlementOutcome::failed(
                request.request_id,
                kind,
                format!("{} rejected the hop", peer),
                request.path.clone(),
            ));
        }
        Ok(handler.handle_hop(request).await)
    }
}

async fn bounded<T>(
    peer: &NodeId,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout {
            peer: peer.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

#[async_trait]
impl SettlementTransport for LocalTransport {
    async fn settle_hop(
        &self,
        peer: &NodeId,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome> {
        bounded(peer, timeout, self.dispatch(peer, request)).await
    }

    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn HopStream>> {
        self.handler(peer)?;
        if let Some(LocalFault::Unreachable) = self.fault(peer) {
            return Err(Error::Transport {
                peer: peer.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(LocalHopStream {
            transport: self.clone(),
            peer: peer.clone(),
        }))
    }

    async fn node_status(&self, peer: &NodeId, timeout: Duration) -> Result<NodeStatus> {
        bounded(peer, timeout, async {
            let handler = self.handler(peer)?;
            self.apply_fault(peer).await?;
            Ok(handler.status().await)
        })
        .await
    }

    async fn heartbeat(
        &self,
        peer: &NodeId,
        from: &NodeId,
        timeout: Duration,
    ) -> Result<HeartbeatReply> {
        bounded(peer, timeout, async {
            let handler = self.handler(peer)?;
            self.apply_fault(peer).await?;
            Ok(handler.heartbeat(from).await)
        })
        .await
    }
}

struct LocalHopStream {
    transport: LocalTransport,
    peer: NodeId,
}

#[async_trait]
impl HopStream for LocalHopStream {
    async fn send_hop(
        &mut self,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome> {
        bounded(&self.peer, timeout, self.transport.dispatch(&self.peer, request)).await
    }
}

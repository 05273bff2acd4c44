//! tonic client side of the hop protocol

use super::pb::mesh_settlement_client::MeshSettlementClient;
use super::pb;
use crate::config::NetworkSettings;
use crate::transport::{HopStream, SettlementTransport};
use crate::{
    Error, HeartbeatReply, NodeId, NodeStatus, Result, SettlementOutcome, SettlementRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status, Streaming};
use tracing::{debug, warn};

/// [`SettlementTransport`] over gRPC with per-peer channels
///
/// Channels are dialed on first use and cached; a channel is dropped when a
/// call reports the peer unavailable so the next call redials.
pub struct GrpcTransport {
    endpoints: HashMap<NodeId, String>,
    settings: NetworkSettings,
    tls: Option<ClientTlsConfig>,
    channels: DashMap<NodeId, MeshSettlementClient<Channel>>,
}

impl GrpcTransport {
    /// Create a transport for the given peer endpoints (`host:port` or full URI)
    pub fn new(
        endpoints: HashMap<NodeId, String>,
        settings: NetworkSettings,
        tls: Option<ClientTlsConfig>,
    ) -> Self {
        Self {
            endpoints,
            settings,
            tls,
            channels: DashMap::new(),
        }
    }

    fn uri(&self, address: &str) -> String {
        if address.contains("://") {
            address.to_string()
        } else if self.tls.is_some() {
            format!("https://{}", address)
        } else {
            format!("http://{}", address)
        }
    }

    async fn client(&self, peer: &NodeId) -> Result<MeshSettlementClient<Channel>> {
        if let Some(client) = self.channels.get(peer) {
            return Ok(client.clone());
        }

        let address = self
            .endpoints
            .get(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
        let transport_err = |e: tonic::transport::Error| Error::Transport {
            peer: peer.to_string(),
            reason: e.to_string(),
        };

        let mut endpoint = Endpoint::from_shared(self.uri(address))
            .map_err(transport_err)?
            .connect_timeout(self.settings.dial_timeout())
            .timeout(self.settings.call_timeout())
            .http2_keep_alive_interval(self.settings.keepalive_interval())
            .keep_alive_timeout(self.settings.keepalive_timeout())
            .keep_alive_while_idle(true);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone()).map_err(transport_err)?;
        }

        let channel = endpoint.connect().await.map_err(transport_err)?;
        debug!(%peer, %address, "dialed peer");

        let client = MeshSettlementClient::new(channel);
        self.channels.insert(peer.clone(), client.clone());
        Ok(client)
    }

    fn status_error(&self, peer: &NodeId, status: Status, timeout: Duration) -> Error {
        match status.code() {
            Code::DeadlineExceeded | Code::Cancelled => Error::Timeout {
                peer: peer.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            Code::InvalidArgument => Error::InvalidMessage(status.message().to_string()),
            code => {
                if code == Code::Unavailable || code == Code::Unknown {
                    self.channels.remove(peer);
                }
                warn!(%peer, ?code, message = status.message(), "hop call failed");
                Error::Transport {
                    peer: peer.to_string(),
                    reason: status.message().to_string(),
                }
            }
        }
    }

    async fn call<T, F>(&self, peer: &NodeId, timeout: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<tonic::Response<T>, Status>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(self.status_error(peer, status, timeout)),
            Err(_) => Err(Error::Timeout {
                peer: peer.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl SettlementTransport for GrpcTransport {
    async fn settle_hop(
        &self,
        peer: &NodeId,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome> {
        let mut client = self.client(peer).await?;
        let message = pb::HopRequest::from(&request);
        let response = self.call(peer, timeout, client.settle_hop(message)).await?;
        SettlementOutcome::try_from(response)
    }

    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn HopStream>> {
        let mut client = self.client(peer).await?;
        let (tx, rx) = mpsc::channel(16);
        let dial_timeout = self.settings.dial_timeout();
        let inbound = self
            .call(
                peer,
                dial_timeout,
                client.settle_stream(ReceiverStream::new(rx)),
            )
            .await?;

        Ok(Box::new(GrpcHopStream {
            peer: peer.clone(),
            outbound: tx,
            inbound,
        }))
    }

    async fn node_status(&self, peer: &NodeId, timeout: Duration) -> Result<NodeStatus> {
        let mut client = self.client(peer).await?;
        let request = pb::NodeStatusRequest {
            node_id: peer.as_str().to_string(),
        };
        let response = self
            .call(peer, timeout, client.get_node_status(request))
            .await?;
        NodeStatus::try_from(response)
    }

    async fn heartbeat(
        &self,
        peer: &NodeId,
        from: &NodeId,
        timeout: Duration,
    ) -> Result<HeartbeatReply> {
        let mut client = self.client(peer).await?;
        let request = pb::HeartbeatRequest {
            node_id: from.as_str().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let response = self.call(peer, timeout, client.heartbeat(request)).await?;
        super::heartbeat_reply(peer, response)
    }
}

struct GrpcHopStream {
    peer: NodeId,
    outbound: mpsc::Sender<pb::HopRequest>,
    inbound: Streaming<pb::HopResponse>,
}

#[async_trait]
impl HopStream for GrpcHopStream {
    async fn send_hop(
        &mut self,
        request: SettlementRequest,
        timeout: Duration,
    ) -> Result<SettlementOutcome> {
        self.outbound
            .send(pb::HopRequest::from(&request))
            .await
            .map_err(|_| Error::StreamClosed(self.peer.to_string()))?;

        match tokio::time::timeout(timeout, self.inbound.message()).await {
            Ok(Ok(Some(response))) => SettlementOutcome::try_from(response),
            Ok(Ok(None)) => Err(Error::StreamClosed(self.peer.to_string())),
            Ok(Err(status)) => Err(Error::Transport {
                peer: self.peer.to_string(),
                reason: status.message().to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                peer: self.peer.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

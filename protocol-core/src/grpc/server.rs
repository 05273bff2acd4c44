//! tonic server side of the hop protocol

use super::pb;
use super::pb::mesh_settlement_server::{MeshSettlement, MeshSettlementServer};
use crate::transport::HopHandler;
use crate::{NodeId, Result, SettlementRequest};
use rustls::ServerConfig;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// gRPC service wrapping a [`HopHandler`]
pub struct GrpcHopService {
    handler: Arc<dyn HopHandler>,
}

impl GrpcHopService {
    /// Wrap `handler`
    pub fn new(handler: Arc<dyn HopHandler>) -> Self {
        Self { handler }
    }

    /// tonic server for this service
    pub fn into_server(self) -> MeshSettlementServer<Self> {
        MeshSettlementServer::new(self)
    }
}

fn decode(message: pb::HopRequest) -> std::result::Result<SettlementRequest, Status> {
    SettlementRequest::try_from(message).map_err(|e| Status::invalid_argument(e.to_string()))
}

#[tonic::async_trait]
impl MeshSettlement for GrpcHopService {
    async fn settle_hop(
        &self,
        request: Request<pb::HopRequest>,
    ) -> std::result::Result<Response<pb::HopResponse>, Status> {
        let hop = decode(request.into_inner())?;
        let outcome = self.handler.handle_hop(hop).await;
        Ok(Response::new(pb::HopResponse::from(&outcome)))
    }

    type SettleStreamStream = ReceiverStream<std::result::Result<pb::HopResponse, Status>>;

    async fn settle_stream(
        &self,
        request: Request<Streaming<pb::HopRequest>>,
    ) -> std::result::Result<Response<Self::SettleStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(code = ?status.code(), "hop stream ended with error");
                        break;
                    }
                };
                // Sequential handling keeps responses in request order
                let reply = match decode(message) {
                    Ok(hop) => Ok(pb::HopResponse::from(&handler.handle_hop(hop).await)),
                    Err(status) => Err(status),
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_node_status(
        &self,
        _request: Request<pb::NodeStatusRequest>,
    ) -> std::result::Result<Response<pb::NodeStatusResponse>, Status> {
        let status = self.handler.status().await;
        Ok(Response::new(pb::NodeStatusResponse::from(&status)))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> std::result::Result<Response<pb::HeartbeatResponse>, Status> {
        let from = NodeId::from(request.into_inner().node_id);
        let reply = self.handler.heartbeat(&from).await;
        Ok(Response::new(pb::HeartbeatResponse::from(&reply)))
    }
}

/// Serve `handler` on `listener` over mutual TLS until `shutdown` resolves
///
/// Handshakes run concurrently; a connection whose handshake fails (for
/// example a client without a certificate chained to the trust root) is
/// dropped and never reaches the service.
pub async fn serve_with_tls<F>(
    listener: TcpListener,
    handler: Arc<dyn HopHandler>,
    tls: Arc<ServerConfig>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let acceptor = TlsAcceptor::from(tls);
    let local_addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(64);

    let accept_loop = tokio::spawn(async move {
        loop {
            let (tcp, addr) = tokio::select! {
                _ = tx.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(stream) => {
                        let _ = tx.send(Ok::<_, std::io::Error>(stream)).await;
                    }
                    Err(e) => warn!(%addr, error = %e, "TLS handshake rejected"),
                }
            });
        }
    });

    info!(%local_addr, "hop service listening (mTLS, TLS 1.3)");
    let served = tonic::transport::Server::builder()
        .add_service(GrpcHopService::new(handler).into_server())
        .serve_with_incoming_shutdown(ReceiverStream::new(rx), shutdown)
        .await;
    accept_loop.abort();

    served.map_err(|e| crate::Error::Transport {
        peer: local_addr.to_string(),
        reason: e.to_string(),
    })
}

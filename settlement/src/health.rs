//! Peer heartbeats
//!
//! Every interval (plus random jitter) each known peer is sent a heartbeat.
//! Answers feed the circuit breaker registry, so a peer that goes quiet is
//! avoided by path search before any settlement fails on it.

use crate::config::HealthConfig;
use protocol_core::{NodeId, SettlementTransport};
use rand::Rng;
use risk_engine::CircuitBreakerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic heartbeat driver
pub struct HealthMonitor {
    node_id: NodeId,
    peers: Vec<NodeId>,
    transport: Arc<dyn SettlementTransport>,
    circuits: Arc<CircuitBreakerRegistry>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Monitor `peers` on behalf of `node_id`
    pub fn new(
        node_id: NodeId,
        peers: Vec<NodeId>,
        transport: Arc<dyn SettlementTransport>,
        circuits: Arc<CircuitBreakerRegistry>,
        config: HealthConfig,
    ) -> Self {
        Self {
            node_id,
            peers,
            transport,
            circuits,
            config,
        }
    }

    /// Heartbeat every peer once; returns how many answered healthy
    pub async fn check_all(&self) -> usize {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut healthy = 0;
        for peer in &self.peers {
            let ok = match self.transport.heartbeat(peer, &self.node_id, timeout).await {
                Ok(reply) => reply.healthy,
                Err(e) => {
                    debug!(%peer, error = %e, "heartbeat failed");
                    false
                }
            };
            let was_open = self.circuits.is_open(peer);
            self.circuits.record_heartbeat(peer, ok);
            if ok {
                healthy += 1;
            } else if !was_open && self.circuits.is_open(peer) {
                warn!(%peer, "peer unhealthy, circuit opened");
            }
        }
        healthy
    }

    /// Run until `shutdown` flips to `true`
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                peers = self.peers.len(),
                interval_ms = self.config.interval_ms,
                "health monitor started"
            );
            loop {
                let jitter = if self.config.jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=self.config.jitter_ms)
                } else {
                    0
                };
                let wait = Duration::from_millis(self.config.interval_ms + jitter);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let healthy = self.check_all().await;
                        debug!(healthy, total = self.peers.len(), "heartbeat round");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("health monitor stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

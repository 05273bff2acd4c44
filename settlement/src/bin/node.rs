//! Mesh node binary
//!
//! Usage: `mesh-node [config.toml]`; without a file, configuration comes from
//! `MESH_*` environment variables.

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use protocol_core::grpc::{serve_with_tls, GrpcHopService, GrpcTransport};
use protocol_core::{HopHandler, SettlementTransport};
use routing_engine::{InMemoryMesh, MeshStore};
use settlement::{Config, HealthMonitor, MeshNode, Orchestrator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env(|key| std::env::var(key).ok())?;
            config
        }
        None => Config::from_env()?,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config.validate()?;
    let node_id = config.node();
    if config.insecure_plaintext {
        tracing::warn!(
            node = %node_id,
            "insecure_plaintext is set: peers are neither encrypted nor authenticated"
        );
    }
    tracing::info!(
        node = %node_id,
        version = protocol_core::PROTOCOL_VERSION,
        "Starting mesh node"
    );

    let topology = config
        .topology_path
        .as_ref()
        .context("topology_path (MESH_TOPOLOGY) must be set")?;
    let mesh: Arc<dyn MeshStore> = Arc::new(
        InMemoryMesh::from_json_file(topology)
            .with_context(|| format!("loading topology from {}", topology.display()))?,
    );
    mesh.get_node(&node_id)
        .with_context(|| format!("{} is not in the topology", node_id))?;

    let store = config.ledger.open()?;
    tracing::info!(backend = ?config.ledger.backend, "Ledger opened");

    let client_tls = match &config.tls {
        Some(tls) => Some(tls.client_config(node_id.as_str())?),
        None => None,
    };
    let transport: Arc<dyn SettlementTransport> = Arc::new(GrpcTransport::new(
        config.peer_endpoints(),
        config.network.clone(),
        client_tls,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        Arc::clone(&mesh),
        Arc::clone(&transport),
        store,
    )?);
    orchestrator.mark_interrupted()?;

    let node = MeshNode::new(
        node_id.clone(),
        Arc::clone(&mesh),
        Arc::clone(orchestrator.circuits()),
        orchestrator.signers().cloned(),
        config.orchestrator.max_pending_hops,
    )
    .with_replay_window(
        config.orchestrator.replay_window(),
        config.orchestrator.replay_capacity,
    )
    .with_orchestrator(Arc::clone(&orchestrator));
    let handler: Arc<dyn HopHandler> = Arc::new(node);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut peers: Vec<_> = config.peer_endpoints().into_keys().collect();
    peers.sort();
    let health = HealthMonitor::new(
        node_id.clone(),
        peers,
        Arc::clone(&transport),
        Arc::clone(orchestrator.circuits()),
        config.health.clone(),
    )
    .spawn(shutdown_rx.clone());

    if config.metrics_enabled {
        let listener = TcpListener::bind(&config.metrics_listen_addr)
            .await
            .with_context(|| format!("binding metrics on {}", config.metrics_listen_addr))?;
        tracing::info!(addr = %config.metrics_listen_addr, "Serving metrics");
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&orchestrator));
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "metrics server stopped");
            }
        });
    }

    // Settlements interrupted by the previous run
    let recovery = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        match recovery.recover().await {
            Ok(outcomes) if !outcomes.is_empty() => {
                tracing::info!(recovered = outcomes.len(), "Recovery finished");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Recovery failed"),
        }
    });

    let mut stop = shutdown_rx.clone();
    let shutdown = async move {
        let _ = stop.changed().await;
    };

    let server = async move {
        match &config.tls {
            Some(tls) => {
                let listener = TcpListener::bind(&config.listen_addr)
                    .await
                    .with_context(|| format!("binding {}", config.listen_addr))?;
                serve_with_tls(listener, handler, tls.server_config()?, shutdown).await?;
            }
            None => {
                let addr: SocketAddr = config
                    .listen_addr
                    .parse()
                    .with_context(|| format!("invalid listen_addr {}", config.listen_addr))?;
                tracing::warn!(%addr, "hop service listening without TLS");
                tonic::transport::Server::builder()
                    .add_service(GrpcHopService::new(handler).into_server())
                    .serve_with_shutdown(addr, shutdown)
                    .await?;
            }
        }
        anyhow::Ok(())
    };

    let server = tokio::spawn(server);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down mesh node");
    let _ = shutdown_tx.send(true);

    server.await??;
    health.await?;
    Ok(())
}

async fn metrics_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<String, (StatusCode, String)> {
    orchestrator
        .metrics()
        .gather_text()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

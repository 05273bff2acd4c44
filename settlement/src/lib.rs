//! Mesh Settlement
//!
//! Drives a settlement from its origin node to the final destination over
//! the mesh, one hop at a time.
//!
//! # Architecture
//!
//! - **Orchestrator**: claims the request id, admits it, walks a route and
//!   reroutes around failing nodes a bounded number of times
//! - **Node**: the receiving side of every hop (liquidity, capacity and
//!   signature checks), and the entry point for originations
//! - **Health**: periodic heartbeats that feed the circuit breakers
//!
//! # Outcomes
//!
//! Every terminal outcome is recorded in the outbox before it is returned,
//! together with its ledger entry when the settlement succeeded. Submitting
//! the same request id again returns the recorded outcome.
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, Orchestrator};
//! use ledger_core::MemoryStore;
//! use protocol_core::{LocalTransport, SettlementRequest};
//! use routing_engine::InMemoryMesh;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let config = Config::default();
//!     let mesh = Arc::new(InMemoryMesh::from_json_file("topology.json")?);
//!     let orchestrator = Orchestrator::new(
//!         &config,
//!         mesh,
//!         Arc::new(LocalTransport::new()),
//!         Arc::new(MemoryStore::new()),
//!     )?;
//!
//!     let id = orchestrator.next_request_id()?;
//!     let request = SettlementRequest::new(id, "A".into(), "D".into(), 10_000);
//!     let outcome = orchestrator.settle(request).await?;
//!     println!("{:?} via {:?}", outcome.status, outcome.actual_path);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications, clippy::all)]

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod node;
pub mod orchestrator;

// Re-exports
pub use config::{Config, HealthConfig, OrchestratorConfig, RoutingConfig};
pub use error::{Error, Result};
pub use health::HealthMonitor;
pub use metrics::Metrics;
pub use node::MeshNode;
pub use orchestrator::Orchestrator;

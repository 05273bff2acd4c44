//! # Mesh Protocol Core
//!
//! The hop-by-hop settlement contract spoken between mesh nodes:
//! - Domain request/outcome types and the closed error-kind taxonomy
//! - Snowflake request ids and Ed25519 request signing
//! - The transport capability (unary + streaming hop calls, status, heartbeat)
//! - gRPC client/server bindings over mutual TLS 1.3, plus an in-process transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ SettlementTransport  │        │     HopHandler       │
//! │  (caller side)       │        │  (receiving node)    │
//! └──────────┬───────────┘        └──────────▲───────────┘
//!            │                               │
//!     ┌──────┴──────┐                 ┌──────┴───────┐
//!     │GrpcTransport│── mTLS / h2 ───▶│GrpcHopService│
//!     └─────────────┘                 └──────────────┘
//!     ┌──────────────┐
//!     │LocalTransport│── in-process dispatch ──▶ HopHandler
//!     └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications, clippy::all)]

pub mod config;
pub mod error;
pub mod grpc;
pub mod local;
pub mod signing;
pub mod snowflake;
pub mod tls;
pub mod transport;
pub mod types;

pub use config::NetworkSettings;
pub use error::{Error, Result};
pub use local::{LocalFault, LocalTransport};
pub use signing::{RequestSigner, SignerRegistry};
pub use snowflake::SnowflakeGenerator;
pub use tls::TlsSettings;
pub use transport::{HopHandler, HopMode, HopStream, SettlementTransport};
pub use types::*;

/// Version string reported in heartbeats
pub const PROTOCOL_VERSION: &str = concat!("mesh.v1/", env!("CARGO_PKG_VERSION"));

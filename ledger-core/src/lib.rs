//! Mesh Ledger Core
//!
//! Idempotency records and the settled-transfer ledger.
//!
//! # Architecture
//!
//! - **Outbox**: request id -> outcome, put-if-absent, terminal records never overwritten
//! - **Ledger**: append-only entries, BLAKE3 hash-chained to their predecessor
//! - **Atomic commit**: a settled outcome and its ledger entry are written together
//!
//! # Invariants
//!
//! - At most one ledger entry per request id
//! - At most one `Processing` owner per request id
//! - A crash between decision and record leaves the record `Unknown`, never terminal

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications, clippy::all)]

pub mod config;
pub mod error;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod store;
pub mod types;

// Re-exports
pub use config::{Backend, LedgerConfig};
pub use error::{Error, Result};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;
pub use store::OutboxStore;
pub use types::{
    verify_chain, Claim, IdempotencyRecord, IdempotencyState, LedgerEntry, SettledTransfer,
};

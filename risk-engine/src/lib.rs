//! Node health and admission control for the settlement mesh
//!
//! - [`CircuitBreakerRegistry`]: per-node closed/open/half-open state machine,
//!   the single source of truth for node health
//! - [`AdmissionController`]: sliding-window limits per destination node and
//!   globally, with priority-tiered headroom and load shedding
//!
//! Both are plain values meant to be shared behind an `Arc` and injected
//! into the path finder and orchestrator.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod circuit;
pub mod error;

pub use admission::{AdmissionConfig, AdmissionController, TierCeilings};
pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, TrialPermit};
pub use error::{Error, Result};

/// Default consecutive failures before a circuit opens
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default cool-down before an open circuit admits trials (ms)
pub const DEFAULT_CB_COOL_DOWN_MS: u64 = 30_000;

/// Default latency bound; a slower attempt trips the circuit (ms)
pub const DEFAULT_CB_LATENCY_BOUND_MS: u64 = 200;

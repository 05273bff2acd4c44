//! Error types for risk engine

use protocol_core::{ErrorKind, NodeId, Priority};
use thiserror::Error;

/// Risk engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Circuit for the node is open
    #[error("Circuit open for node {node}, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Node whose circuit rejected the attempt
        node: NodeId,
        /// Remaining cool-down (0 when the half-open trial budget is exhausted)
        retry_in_ms: u64,
    },

    /// Admission control rejected the attempt
    #[error("Rate limited ({scope}) at priority {priority:?}")]
    RateLimited {
        /// Window or policy that rejected the attempt
        scope: String,
        /// Priority of the rejected attempt
        priority: Priority,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Wire-level classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::InvalidConfig(_) => ErrorKind::Internal,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

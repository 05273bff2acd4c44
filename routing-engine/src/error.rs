//! Error types for routing

use protocol_core::{ErrorKind, NodeId};
use thiserror::Error;

/// Routing error
#[derive(Debug, Error)]
pub enum Error {
    /// Node missing from the topology
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// No edge matched
    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    /// No active, healthy path within the hop bound
    #[error("No path from {source_node} to {destination} within {max_hops} hops")]
    PathNotFound {
        /// Search origin
        source_node: NodeId,
        /// Search target
        destination: NodeId,
        /// Hop bound used
        max_hops: usize,
    },

    /// Edge cannot carry the requested amount
    #[error("Insufficient liquidity on {edge}: available {available}, requested {requested}")]
    InsufficientLiquidity {
        /// Edge id
        edge: String,
        /// Current liquidity
        available: u64,
        /// Requested debit
        requested: u64,
    },

    /// Topology document is inconsistent
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Query cannot be answered as posed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wire-level classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PathNotFound { .. } | Error::NodeNotFound(_) => ErrorKind::PathNotFound,
            Error::InsufficientLiquidity { .. } => ErrorKind::InsufficientLiquidity,
            Error::EdgeNotFound(_)
            | Error::InvalidTopology(_)
            | Error::InvalidQuery(_)
            | Error::InvalidConfig(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the ledger

use protocol_core::{ErrorKind, RequestId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Operation not valid for the record's current state
    #[error("Request {request_id} is {state}, cannot {operation}")]
    InvalidState {
        /// Request
        request_id: RequestId,
        /// Current state name
        state: &'static str,
        /// Attempted operation
        operation: &'static str,
    },

    /// No record for the request
    #[error("No idempotency record for request {0}")]
    RecordNotFound(RequestId),

    /// Hash chain does not verify
    #[error("Ledger chain broken at entry {0}")]
    ChainBroken(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire-level classification; every storage fault is internal
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

//! Error types for the settlement layer

use protocol_core::{ErrorKind, RequestId};
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
///
/// Hop failures never surface here; they are reported inside a failed
/// [`protocol_core::SettlementOutcome`]. This type covers the faults that
/// prevent an outcome from being produced at all.
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger / outbox error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(#[from] routing_engine::Error),

    /// Risk engine error
    #[error("Risk engine error: {0}")]
    Risk(#[from] risk_engine::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol_core::Error),

    /// Another execution of the request is in progress
    #[error("Request {0} is already processing")]
    AlreadyProcessing(RequestId),

    /// Execution ended without publishing an outcome
    #[error("Execution of request {0} was aborted")]
    Aborted(RequestId),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire-level classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Ledger(e) => e.kind(),
            Error::Routing(e) => e.kind(),
            Error::Risk(e) => e.kind(),
            Error::Protocol(e) => e.kind(),
            Error::AlreadyProcessing(_) => ErrorKind::RateLimited,
            Error::Aborted(_) | Error::Config(_) | Error::Metrics(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

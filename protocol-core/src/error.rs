//! Error types for protocol operations

use crate::types::ErrorKind;
use thiserror::Error;

/// Protocol result type
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors
#[derive(Error, Debug)]
pub enum Error {
    /// Peer could not be reached or the call failed in transit
    #[error("Transport error talking to {peer}: {reason}")]
    Transport {
        /// Peer node
        peer: String,
        /// Underlying failure
        reason: String,
    },

    /// No endpoint or handler is registered for the peer
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Per-call timeout elapsed
    #[error("Call to {peer} timed out after {timeout_ms}ms")]
    Timeout {
        /// Peer node
        peer: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Message could not be decoded into a domain type
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    /// TLS material could not be loaded or assembled
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Wall clock moved backwards further than tolerated
    #[error("Clock moved backwards by {0}ms")]
    ClockSkew(u64),

    /// Snowflake worker id out of range
    #[error("Invalid worker id {0} (max 1023)")]
    InvalidWorker(u16),

    /// Streaming session closed by the peer
    #[error("Stream to {0} closed")]
    StreamClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classification used by the orchestrator's retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } | Error::UnknownPeer(_) | Error::StreamClosed(_) => {
                ErrorKind::NodeUnavailable
            }
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Error::InvalidMessage(_)
            | Error::Tls(_)
            | Error::ClockSkew(_)
            | Error::InvalidWorker(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureInvalid(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Error::Tls(e.to_string())
    }
}

//! Network timeouts for the hop protocol

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dial, per-call and keepalive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Connection establishment bound
    pub dial_timeout_ms: u64,
    /// Per-call bound, separate from the dial bound
    pub call_timeout_ms: u64,
    /// HTTP/2 keepalive ping interval
    pub keepalive_interval_ms: u64,
    /// HTTP/2 keepalive ping timeout
    pub keepalive_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 10_000,
        }
    }
}

impl NetworkSettings {
    /// Dial timeout
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Keepalive interval
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Keepalive timeout
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

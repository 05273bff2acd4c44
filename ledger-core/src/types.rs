//! Ledger and idempotency record types

use chrono::{DateTime, Utc};
use protocol_core::{NodeId, RequestId, SettlementOutcome, SettlementRequest, SettlementStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hash preceding the first ledger entry
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Settled transfer about to be appended to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledTransfer {
    /// Request
    pub request_id: RequestId,
    /// Origin node
    pub origin: NodeId,
    /// Final destination
    pub destination: NodeId,
    /// Amount (minor units)
    pub amount: u64,
    /// Path actually taken
    pub path: Vec<NodeId>,
    /// Sum of base fees along the path
    pub total_fee_bps: u32,
    /// Sum of observed hop latencies
    pub total_latency_ms: u64,
    /// Settled over a substitute for the preferred path
    #[serde(default)]
    pub rerouted: bool,
}

/// Immutable ledger entry, hash-chained to its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id (UUID v7, time ordered)
    pub entry_id: Uuid,
    /// Position in the ledger, starting at 0
    pub sequence: u64,
    /// Settled transfer
    pub transfer: SettledTransfer,
    /// Settlement time
    pub settled_at: DateTime<Utc>,
    /// Hash of the previous entry
    pub prev_hash: [u8; 32],
    /// BLAKE3 over `prev_hash` and this entry's fields
    pub hash: [u8; 32],
}

impl LedgerEntry {
    /// Build the entry following `prev_hash`
    pub fn new(transfer: SettledTransfer, sequence: u64, prev_hash: [u8; 32]) -> Self {
        let mut entry = Self {
            entry_id: Uuid::now_v7(),
            sequence,
            transfer,
            settled_at: Utc::now(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Recompute this entry's hash from its fields
    pub fn compute_hash(&self) -> [u8; 32] {
        let t = &self.transfer;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.prev_hash);
        hasher.update(self.entry_id.as_bytes());
        hasher.update(&self.sequence.to_be_bytes());
        hasher.update(&t.request_id.to_be_bytes());
        for id in [&t.origin, &t.destination] {
            hasher.update(&(id.as_str().len() as u32).to_be_bytes());
            hasher.update(id.as_str().as_bytes());
        }
        hasher.update(&t.amount.to_be_bytes());
        hasher.update(&(t.path.len() as u32).to_be_bytes());
        for node in &t.path {
            hasher.update(&(node.as_str().len() as u32).to_be_bytes());
            hasher.update(node.as_str().as_bytes());
        }
        hasher.update(&t.total_fee_bps.to_be_bytes());
        hasher.update(&t.total_latency_ms.to_be_bytes());
        hasher.update(&[u8::from(t.rerouted)]);
        hasher.update(&self.settled_at.timestamp_micros().to_be_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Outcome this entry settled, as reported to the submitter
    pub fn settled_outcome(&self) -> SettlementOutcome {
        let t = &self.transfer;
        let mut outcome = SettlementOutcome::completed(
            t.request_id,
            t.path.clone(),
            t.total_fee_bps,
            t.total_latency_ms,
        );
        if t.rerouted {
            outcome.status = SettlementStatus::Rerouted;
        }
        outcome.ledger_entry_id = Some(self.entry_id);
        outcome.completed_at = Some(self.settled_at);
        outcome
    }
}

/// Check that `entries` (in ledger order) form an unbroken chain from genesis
pub fn verify_chain(entries: &[LedgerEntry]) -> crate::Result<()> {
    let mut prev = GENESIS_HASH;
    for (i, entry) in entries.iter().enumerate() {
        if entry.sequence != i as u64 || entry.prev_hash != prev || entry.compute_hash() != entry.hash
        {
            return Err(crate::Error::ChainBroken(entry.entry_id.to_string()));
        }
        prev = entry.hash;
    }
    Ok(())
}

/// State of one request id in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdempotencyState {
    /// Claimed and executing
    Processing,
    /// Execution outcome not known (crash or abandoned deadline)
    Unknown,
    /// Final; never overwritten
    Terminal(SettlementOutcome),
}

impl IdempotencyState {
    /// Short state name
    pub fn name(&self) -> &'static str {
        match self {
            IdempotencyState::Processing => "processing",
            IdempotencyState::Unknown => "unknown",
            IdempotencyState::Terminal(_) => "terminal",
        }
    }
}

/// Idempotency record for one request id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Request as first submitted
    pub request: SettlementRequest,
    /// Current state
    pub state: IdempotencyState,
    /// Times the request has been claimed for execution
    pub attempts: u32,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Fresh record in `Processing`
    pub fn processing(request: SettlementRequest) -> Self {
        Self {
            request,
            state: IdempotencyState::Processing,
            attempts: 1,
            updated_at: Utc::now(),
        }
    }

    /// Move to a new state
    pub fn set_state(&mut self, state: IdempotencyState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Result of claiming a request id
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Caller now owns execution
    Acquired,
    /// Another execution is in progress
    InFlight,
    /// A previous execution's outcome is unknown; re-validate before retrying
    Unknown,
    /// Already final
    Terminal(SettlementOutcome),
}

//! Outbox store contract
//!
//! One record per request id moves through
//! `Processing -> Terminal` or `Processing -> Unknown -> Processing -> ...`.
//! A terminal record is never overwritten, and a settled outcome is written
//! in the same atomic step as its ledger entry.

use crate::error::{Error, Result};
use crate::types::{Claim, IdempotencyRecord, IdempotencyState, LedgerEntry, SettledTransfer};
use protocol_core::{RequestId, SettlementOutcome, SettlementRequest};

/// Durable request-id -> outcome mapping plus the settled-transfer ledger
pub trait OutboxStore: Send + Sync {
    /// Put-if-absent: create a `Processing` record, or report the existing state
    fn claim(&self, request: &SettlementRequest) -> Result<Claim>;

    /// Take ownership of an `Unknown` record for re-execution
    fn reclaim(&self, request_id: RequestId) -> Result<Claim>;

    /// Current record
    fn get(&self, request_id: RequestId) -> Result<Option<IdempotencyRecord>>;

    /// Record a terminal outcome, appending `transfer` to the ledger when given.
    ///
    /// Returns the outcome that is now stored: the existing one if the record
    /// was already terminal, otherwise `outcome` with its ledger entry id filled.
    fn commit(
        &self,
        request_id: RequestId,
        outcome: SettlementOutcome,
        transfer: Option<SettledTransfer>,
    ) -> Result<SettlementOutcome>;

    /// Drop a non-terminal record so the id can be submitted again
    fn release(&self, request_id: RequestId) -> Result<()>;

    /// Move a `Processing` record to `Unknown`
    fn mark_unknown(&self, request_id: RequestId) -> Result<()>;

    /// Move every `Processing` record to `Unknown` (startup after a crash)
    fn mark_all_unknown(&self) -> Result<usize>;

    /// Records whose outcome is unknown
    fn unknown_requests(&self) -> Result<Vec<IdempotencyRecord>>;

    /// Ledger entry written for a request
    fn ledger_entry_for(&self, request_id: RequestId) -> Result<Option<LedgerEntry>>;

    /// Whole ledger in append order
    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>>;
}

/// Claim decision shared by the backends; `Some` record must be persisted
pub(crate) fn claim_transition(
    existing: Option<&IdempotencyRecord>,
    request: &SettlementRequest,
) -> (Claim, Option<IdempotencyRecord>) {
    match existing.map(|r| &r.state) {
        None => (
            Claim::Acquired,
            Some(IdempotencyRecord::processing(request.clone())),
        ),
        Some(IdempotencyState::Processing) => (Claim::InFlight, None),
        Some(IdempotencyState::Unknown) => (Claim::Unknown, None),
        Some(IdempotencyState::Terminal(outcome)) => (Claim::Terminal(outcome.clone()), None),
    }
}

pub(crate) fn reclaim_transition(
    request_id: RequestId,
    existing: Option<&IdempotencyRecord>,
) -> Result<(Claim, Option<IdempotencyRecord>)> {
    let record = existing.ok_or(Error::RecordNotFound(request_id))?;
    Ok(match &record.state {
        IdempotencyState::Unknown => {
            let mut next = record.clone();
            next.attempts += 1;
            next.set_state(IdempotencyState::Processing);
            (Claim::Acquired, Some(next))
        }
        IdempotencyState::Processing => (Claim::InFlight, None),
        IdempotencyState::Terminal(outcome) => (Claim::Terminal(outcome.clone()), None),
    })
}

pub(crate) fn ensure_releasable(request_id: RequestId, record: &IdempotencyRecord) -> Result<()> {
    if let IdempotencyState::Terminal(_) = record.state {
        return Err(Error::InvalidState {
            request_id,
            state: record.state.name(),
            operation: "release",
        });
    }
    Ok(())
}

//! In-memory outbox store

use crate::error::{Error, Result};
use crate::store::{claim_transition, ensure_releasable, reclaim_transition, OutboxStore};
use crate::types::{
    Claim, IdempotencyRecord, IdempotencyState, LedgerEntry, SettledTransfer, GENESIS_HASH,
};
use parking_lot::Mutex;
use protocol_core::{RequestId, SettlementOutcome, SettlementRequest};
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    records: HashMap<RequestId, IdempotencyRecord>,
    ledger: Vec<LedgerEntry>,
    by_request: HashMap<RequestId, usize>,
}

/// Outbox store held in process memory
///
/// Every operation runs under one lock, so record updates and ledger appends
/// are atomic with respect to each other.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutboxStore for MemoryStore {
    fn claim(&self, request: &SettlementRequest) -> Result<Claim> {
        let mut inner = self.inner.lock();
        let (claim, record) = claim_transition(inner.records.get(&request.request_id), request);
        if let Some(record) = record {
            inner.records.insert(request.request_id, record);
        }
        Ok(claim)
    }

    fn reclaim(&self, request_id: RequestId) -> Result<Claim> {
        let mut inner = self.inner.lock();
        let (claim, record) = reclaim_transition(request_id, inner.records.get(&request_id))?;
        if let Some(record) = record {
            inner.records.insert(request_id, record);
        }
        Ok(claim)
    }

    fn get(&self, request_id: RequestId) -> Result<Option<IdempotencyRecord>> {
        Ok(self.inner.lock().records.get(&request_id).cloned())
    }

    fn commit(
        &self,
        request_id: RequestId,
        mut outcome: SettlementOutcome,
        transfer: Option<SettledTransfer>,
    ) -> Result<SettlementOutcome> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get(&request_id)
            .ok_or(Error::RecordNotFound(request_id))?;
        if let IdempotencyState::Terminal(existing) = &record.state {
            return Ok(existing.clone());
        }

        if let Some(&idx) = inner.by_request.get(&request_id) {
            outcome.ledger_entry_id = Some(inner.ledger[idx].entry_id);
        } else if let Some(transfer) = transfer {
            let prev = inner.ledger.last().map(|e| e.hash).unwrap_or(GENESIS_HASH);
            let entry = LedgerEntry::new(transfer, inner.ledger.len() as u64, prev);
            outcome.ledger_entry_id = Some(entry.entry_id);
            let idx = inner.ledger.len();
            inner.ledger.push(entry);
            inner.by_request.insert(request_id, idx);
        }

        if let Some(record) = inner.records.get_mut(&request_id) {
            record.set_state(IdempotencyState::Terminal(outcome.clone()));
        }
        Ok(outcome)
    }

    fn release(&self, request_id: RequestId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get(&request_id) {
            ensure_releasable(request_id, record)?;
            inner.records.remove(&request_id);
        }
        Ok(())
    }

    fn mark_unknown(&self, request_id: RequestId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&request_id)
            .ok_or(Error::RecordNotFound(request_id))?;
        if record.state == IdempotencyState::Processing {
            record.set_state(IdempotencyState::Unknown);
        }
        Ok(())
    }

    fn mark_all_unknown(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut marked = 0;
        for record in inner.records.values_mut() {
            if record.state == IdempotencyState::Processing {
                record.set_state(IdempotencyState::Unknown);
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn unknown_requests(&self) -> Result<Vec<IdempotencyRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.state == IdempotencyState::Unknown)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.request.request_id);
        Ok(records)
    }

    fn ledger_entry_for(&self, request_id: RequestId) -> Result<Option<LedgerEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_request
            .get(&request_id)
            .map(|&idx| inner.ledger[idx].clone()))
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.inner.lock().ledger.clone())
    }
}

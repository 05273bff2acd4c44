//! RocksDB outbox store
//!
//! # Column Families
//!
//! - `outbox` - Idempotency records (key: request_id)
//! - `ledger` - Ledger entries (key: sequence)
//! - `ledger_index` - request_id -> sequence
//! - `meta` - Ledger head (next sequence, last hash)
//!
//! Reads go straight to the database. Every mutation runs under a single
//! writer lock and lands in one `WriteBatch`, so an outcome and its ledger
//! entry become visible together or not at all.

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::store::{claim_transition, ensure_releasable, reclaim_transition, OutboxStore};
use crate::types::{
    Claim, IdempotencyRecord, IdempotencyState, LedgerEntry, SettledTransfer, GENESIS_HASH,
};
use parking_lot::Mutex;
use protocol_core::{RequestId, SettlementOutcome, SettlementRequest};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions,
    DB,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const CF_OUTBOX: &str = "outbox";
const CF_LEDGER: &str = "ledger";
const CF_LEDGER_INDEX: &str = "ledger_index";
const CF_META: &str = "meta";

const HEAD_KEY: &[u8] = b"head";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LedgerHead {
    next_sequence: u64,
    last_hash: [u8; 32],
}

impl Default for LedgerHead {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_hash: GENESIS_HASH,
        }
    }
}

/// Durable outbox store
pub struct RocksStore {
    db: Arc<DB>,
    writer: Mutex<LedgerHead>,
    sync_writes: bool,
}

impl RocksStore {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_OUTBOX, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_LEDGER, Self::cf_options_zstd()),
            ColumnFamilyDescriptor::new(CF_LEDGER_INDEX, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let store = Self {
            db: Arc::new(db),
            writer: Mutex::new(LedgerHead::default()),
            sync_writes: config.rocksdb.sync_writes,
        };
        let head = store.load_head()?;
        *store.writer.lock() = head;

        info!(
            path = %path.display(),
            ledger_entries = head.next_sequence,
            "Opened outbox store"
        );
        Ok(store)
    }

    fn cf_options_lz4() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_zstd() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn load_head(&self) -> Result<LedgerHead> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(&cf, HEAD_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(LedgerHead::default()),
        }
    }

    fn read_record(&self, request_id: RequestId) -> Result<Option<IdempotencyRecord>> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        self.db
            .get_cf(&cf, request_id.to_be_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    fn put_record(&self, record: &IdempotencyRecord) -> Result<()> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf,
            record.request.request_id.to_be_bytes(),
            bincode::serialize(record)?,
        );
        self.write(batch)
    }

    fn read_entry(&self, sequence: u64) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        self.db
            .get_cf(&cf, sequence.to_be_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    fn sequence_for(&self, request_id: RequestId) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_LEDGER_INDEX)?;
        Ok(self
            .db
            .get_cf(&cf, request_id.to_be_bytes())?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<IdempotencyRecord>> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }
}

impl OutboxStore for RocksStore {
    fn claim(&self, request: &SettlementRequest) -> Result<Claim> {
        let _writer = self.writer.lock();
        let existing = self.read_record(request.request_id)?;
        let (claim, record) = claim_transition(existing.as_ref(), request);
        if let Some(record) = record {
            self.put_record(&record)?;
        }
        Ok(claim)
    }

    fn reclaim(&self, request_id: RequestId) -> Result<Claim> {
        let _writer = self.writer.lock();
        let existing = self.read_record(request_id)?;
        let (claim, record) = reclaim_transition(request_id, existing.as_ref())?;
        if let Some(record) = record {
            self.put_record(&record)?;
        }
        Ok(claim)
    }

    fn get(&self, request_id: RequestId) -> Result<Option<IdempotencyRecord>> {
        self.read_record(request_id)
    }

    fn commit(
        &self,
        request_id: RequestId,
        mut outcome: SettlementOutcome,
        transfer: Option<SettledTransfer>,
    ) -> Result<SettlementOutcome> {
        let mut head = self.writer.lock();
        let mut record = self
            .read_record(request_id)?
            .ok_or(Error::RecordNotFound(request_id))?;
        if let IdempotencyState::Terminal(existing) = record.state {
            return Ok(existing);
        }

        let mut batch = WriteBatch::default();
        let mut next_head = *head;
        if let Some(sequence) = self.sequence_for(request_id)? {
            let entry = self
                .read_entry(sequence)?
                .ok_or_else(|| Error::Storage(format!("ledger index dangling at {}", sequence)))?;
            outcome.ledger_entry_id = Some(entry.entry_id);
        } else if let Some(transfer) = transfer {
            let entry = LedgerEntry::new(transfer, head.next_sequence, head.last_hash);
            let sequence_key = entry.sequence.to_be_bytes();
            batch.put_cf(&self.cf_handle(CF_LEDGER)?, sequence_key, bincode::serialize(&entry)?);
            batch.put_cf(
                &self.cf_handle(CF_LEDGER_INDEX)?,
                request_id.to_be_bytes(),
                sequence_key,
            );
            next_head = LedgerHead {
                next_sequence: entry.sequence + 1,
                last_hash: entry.hash,
            };
            batch.put_cf(&self.cf_handle(CF_META)?, HEAD_KEY, bincode::serialize(&next_head)?);
            outcome.ledger_entry_id = Some(entry.entry_id);
            debug!(
                request_id = %request_id,
                entry_id = %entry.entry_id,
                sequence = entry.sequence,
                "Ledger entry appended"
            );
        }

        record.set_state(IdempotencyState::Terminal(outcome.clone()));
        batch.put_cf(
            &self.cf_handle(CF_OUTBOX)?,
            request_id.to_be_bytes(),
            bincode::serialize(&record)?,
        );
        self.write(batch)?;
        *head = next_head;
        Ok(outcome)
    }

    fn release(&self, request_id: RequestId) -> Result<()> {
        let _writer = self.writer.lock();
        if let Some(record) = self.read_record(request_id)? {
            ensure_releasable(request_id, &record)?;
            let cf = self.cf_handle(CF_OUTBOX)?;
            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf, request_id.to_be_bytes());
            self.write(batch)?;
        }
        Ok(())
    }

    fn mark_unknown(&self, request_id: RequestId) -> Result<()> {
        let _writer = self.writer.lock();
        let mut record = self
            .read_record(request_id)?
            .ok_or(Error::RecordNotFound(request_id))?;
        if record.state == IdempotencyState::Processing {
            record.set_state(IdempotencyState::Unknown);
            self.put_record(&record)?;
        }
        Ok(())
    }

    fn mark_all_unknown(&self) -> Result<usize> {
        let _writer = self.writer.lock();
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut batch = WriteBatch::default();
        let mut marked = 0;
        for mut record in self.records()? {
            if record.state == IdempotencyState::Processing {
                record.set_state(IdempotencyState::Unknown);
                batch.put_cf(
                    &cf,
                    record.request.request_id.to_be_bytes(),
                    bincode::serialize(&record)?,
                );
                marked += 1;
            }
        }
        self.write(batch)?;
        Ok(marked)
    }

    fn unknown_requests(&self) -> Result<Vec<IdempotencyRecord>> {
        // Keys are big-endian request ids, so iteration is already id-ordered
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.state == IdempotencyState::Unknown)
            .collect())
    }

    fn ledger_entry_for(&self, request_id: RequestId) -> Result<Option<LedgerEntry>> {
        match self.sequence_for(request_id)? {
            Some(sequence) => self.read_entry(sequence),
            None => Ok(None),
        }
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_LEDGER)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }
}

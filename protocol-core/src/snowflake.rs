//! Snowflake-style request ids
//!
//! Layout (most significant first): 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of worker id, 12 bits of per-millisecond sequence.
//! Ids from one generator are strictly increasing.
//!
//! Generation never blocks, so it is safe to call from async code. When the
//! wall clock is behind the last issued id (a backwards step, or a burst that
//! used up a millisecond's sequence) ids keep counting on the generator's own
//! millisecond, up to [`MAX_CLOCK_SKEW_MS`] ahead of the wall clock.

use crate::{Error, RequestId, Result};
use chrono::Utc;
use parking_lot::Mutex;

/// Custom epoch: 2024-01-01T00:00:00Z
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// How far the generator may run ahead of the wall clock (ms)
pub const MAX_CLOCK_SKEW_MS: u64 = 50;

#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Request id generator owned by one process/worker
#[derive(Debug)]
pub struct SnowflakeGenerator {
    worker_id: u16,
    state: Mutex<State>,
}

/// Decomposed id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Unix milliseconds
    pub timestamp_ms: i64,
    /// Worker id
    pub worker_id: u16,
    /// Sequence within the millisecond
    pub sequence: u16,
}

impl SnowflakeGenerator {
    /// Create a generator for `worker_id` (0..=1023)
    pub fn new(worker_id: u16) -> Result<Self> {
        if worker_id > MAX_WORKER {
            return Err(Error::InvalidWorker(worker_id));
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Worker id baked into every generated id
    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Next id
    pub fn next_id(&self) -> Result<RequestId> {
        self.next_id_at(current_ms())
    }

    fn next_id_at(&self, wall_ms: u64) -> Result<RequestId> {
        let mut state = self.state.lock();
        if state.last_ms > wall_ms + MAX_CLOCK_SKEW_MS {
            return Err(Error::ClockSkew(state.last_ms - wall_ms));
        }

        let mut now = wall_ms.max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted; continue on the next millisecond
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let raw = (now << (WORKER_BITS + SEQUENCE_BITS))
            | (u64::from(self.worker_id) << SEQUENCE_BITS)
            | state.sequence;
        Ok(RequestId::new(raw))
    }
}

/// Split an id back into its fields
pub fn decompose(id: RequestId) -> SnowflakeParts {
    let raw = id.value();
    SnowflakeParts {
        timestamp_ms: (raw >> (WORKER_BITS + SEQUENCE_BITS)) as i64 + EPOCH_MS,
        worker_id: ((raw >> SEQUENCE_BITS) & u64::from(MAX_WORKER)) as u16,
        sequence: (raw & SEQUENCE_MASK) as u16,
    }
}

fn current_ms() -> u64 {
    (Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64
}

//! Timestamp management for MVCC transactions.
//!
//! Commit timestamps are hybrid-logical-clock readings packed into a u64:
//! the wall-clock millisecond component occupies the high bits and a
//! logical counter the low [`HybridLogicalClock::LOGICAL_BITS`] bits, so
//! lexicographic `(wall, logical)` order is numeric order on the raw value.
//! Transaction ids live in a disjoint domain marked by the top bit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Represents a timestamp used for multi-version concurrency control.
/// It can either represent a transaction ID which starts from 1 << 63,
/// or a commit timestamp (an HLC reading) below that. A timestamp is a
/// transaction ID iff the highest bit is set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The start of the transaction ID range.
    pub const TXN_ID_START: u64 = 1 << 63;

    /// The pre-history marker: "no transaction" / "object never existed".
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from a raw value.
    pub fn with_ts(timestamp: u64) -> Self {
        Self(timestamp)
    }

    /// Returns the maximum possible commit timestamp.
    pub fn max_commit_ts() -> Self {
        Self(u64::MAX & !Self::TXN_ID_START)
    }

    /// Returns true if the timestamp is a transaction ID.
    pub fn is_txn_id(&self) -> bool {
        self.0 & Self::TXN_ID_START != 0
    }

    /// Returns true if the timestamp is a commit timestamp.
    pub fn is_commit_ts(&self) -> bool {
        self.0 & Self::TXN_ID_START == 0
    }

    /// Returns the raw value of the timestamp.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Wall-clock milliseconds of a commit timestamp.
    pub fn wall_ms(&self) -> u64 {
        self.0 >> HybridLogicalClock::LOGICAL_BITS
    }

    /// Logical counter of a commit timestamp.
    pub fn logical(&self) -> u64 {
        self.0 & ((1 << HybridLogicalClock::LOGICAL_BITS) - 1)
    }
}

/// A hybrid-logical clock producing strictly increasing commit timestamps.
///
/// Each reading is `max(wall_ms << LOGICAL_BITS, last + 1)`: the logical
/// counter absorbs bursts within one millisecond and observed remote
/// timestamps ([`Self::update_if_greater`]) pull the clock forward, so a
/// reading is never repeated and never behind anything already observed.
///
/// One instance is shared per node and passed into shards at construction.
pub struct HybridLogicalClock {
    last: AtomicU64,
}

impl HybridLogicalClock {
    /// Low bits reserved for the logical counter; the remaining 43 commit
    /// bits of wall-clock milliseconds last until the year 2248.
    pub const LOGICAL_BITS: u32 = 20;

    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Create a clock resuming from a previously observed timestamp
    /// (recovery path).
    pub fn with_start(start: Timestamp) -> Self {
        Self {
            last: AtomicU64::new(start.raw()),
        }
    }

    fn wall_component() -> u64 {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ms << Self::LOGICAL_BITS
    }

    /// Produce the next timestamp, strictly greater than every earlier
    /// reading and every timestamp passed to [`Self::update_if_greater`].
    pub fn next(&self) -> Result<Timestamp, TimestampError> {
        let mut cur = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = Self::wall_component().max(cur + 1);
            if candidate >= Timestamp::TXN_ID_START {
                return Err(TimestampError::CommitTsOverflow(candidate));
            }
            match self
                .last
                .compare_exchange_weak(cur, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(Timestamp::with_ts(candidate)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current reading without advancing the clock.
    pub fn current(&self) -> Timestamp {
        Timestamp::with_ts(self.last.load(Ordering::SeqCst))
    }

    /// Fold in a timestamp observed from elsewhere (a coordinator-assigned
    /// commit ts, a peer's shard version); later readings will exceed it.
    pub fn update_if_greater(&self, ts: Timestamp) -> Result<(), TimestampError> {
        if !ts.is_commit_ts() {
            return Err(TimestampError::WrongDomainCommit(ts.raw()));
        }
        if ts.raw() >= Timestamp::max_commit_ts().raw() {
            return Err(TimestampError::CommitTsOverflow(ts.raw()));
        }
        self.last.fetch_max(ts.raw(), Ordering::SeqCst);
        Ok(())
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction ID source. Ids are node-local and only need to be unique
/// among live transactions; the domain bit keeps them apart from commit
/// timestamps on version chains.
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(Timestamp::TXN_ID_START + 1),
        }
    }

    /// Generate the next transaction ID.
    pub fn next(&self) -> Result<Timestamp, TimestampError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TimestampError::TxnIdOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Timestamp::with_ts(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Update the counter if the given transaction ID is greater than the
    /// current value (recovery and split paths re-register foreign ids).
    pub fn update_if_greater(&self, txn_id: Timestamp) -> Result<(), TimestampError> {
        if !txn_id.is_txn_id() {
            return Err(TimestampError::WrongDomainTxnId(txn_id.raw()));
        }
        if txn_id.raw() == u64::MAX {
            return Err(TimestampError::TxnIdOverflow(txn_id.raw()));
        }
        self.counter.fetch_max(txn_id.raw() + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

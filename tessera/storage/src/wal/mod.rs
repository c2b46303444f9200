pub mod shard_wal;

use std::path::Path;

pub use shard_wal::{FileWal, Operation, RedoEntry, WalManager};

use crate::error::StorageResult;

/// Trait for records that can be stored in a write-ahead log.
pub trait LogRecord: Clone + std::fmt::Debug {
    /// Convert the record to bytes for storage.
    fn to_bytes(&self) -> StorageResult<Vec<u8>>;

    /// Create a record from bytes.
    fn from_bytes(bytes: &[u8]) -> StorageResult<Self>
    where
        Self: Sized;
}

/// Trait defining a write-ahead log interface.
///
/// A WAL is an append-only log used to ensure durability of operations
/// before they are applied to the main data structure. Records correspond
/// one-to-one with deltas plus index/schema operations.
pub trait ShardWal {
    type Record: LogRecord;

    /// Open existing log or create a new one at the specified path.
    fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self>
    where
        Self: Sized;

    /// Append a record to the log and buffer it.
    fn append(&mut self, record: &Self::Record) -> StorageResult<()>;

    /// Flush internal buffer and fsync to guarantee durability.
    fn flush(&mut self) -> StorageResult<()>;

    /// Read all records from the log, in append order.
    fn read_all(&self) -> StorageResult<Vec<Self::Record>>;
}

use std::io;

use tessera_common::value::PropertyDataType;
use tessera_transaction::TimestampError;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Concurrent conflicting write; the caller may retry with a fresh
    /// transaction.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("nonexistent object: {0}")]
    NonexistentObject(String),

    /// Operation on an object tombstoned earlier in the same transaction.
    #[error("operation on deleted object: {0}")]
    DeletedObject(String),

    /// Non-detach delete of a vertex with visible incident edges.
    #[error("vertex has edges: {0}")]
    VertexHasEdges(String),

    #[error("edge properties are disabled on this shard")]
    PropertiesDisabled,

    /// Primary-key collision on create (also raised for gid collisions on
    /// edge creation).
    #[error("already inserted: {0}")]
    VertexAlreadyInserted(String),

    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    /// Primary key outside the shard's `[min, max)` range.
    #[error("primary key outside the shard's key range")]
    OutOfRange,

    /// The caller acted on an older shard version than the shard accepts.
    #[error("stale shard map: expected shard version {expected}, got {actual}")]
    StaleShardMap { expected: u64, actual: u64 },

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction already committed: {0}")]
    AlreadyCommitted(String),
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
}

/// Why a create was rejected by the primary-key schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("no schema defined for label {label}")]
    SchemaNotFound { label: u32 },
    #[error("schema already defined for label {label}")]
    SchemaAlreadyExists { label: u32 },
    #[error("primary label missing from the label set")]
    MissingPrimaryLabel,
    #[error("primary key has {actual} values, schema declares {expected}")]
    KeyArityMismatch { expected: usize, actual: usize },
    #[error("primary key property {property} is {actual:?}, schema declares {expected}")]
    KeyTypeMismatch {
        property: u32,
        expected: PropertyDataType,
        actual: Option<PropertyDataType>,
    },
    #[error("property {property} is part of the primary key and cannot be set separately")]
    KeyPropertyOverlap { property: u32 },
}

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("data corruption: checksum mismatch")]
    ChecksumMismatch,
    #[error("record serialization failed: {0}")]
    SerializationFailed(String),
    #[error("record deserialization failed: {0}")]
    DeserializationFailed(String),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("data corruption: checksum mismatch")]
    ChecksumMismatch,
    #[error("snapshot serialization failed: {0}")]
    SerializationFailed(String),
    #[error("snapshot deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("timeout waiting for active transactions to drain")]
    Timeout,
}

//! Per-shard multi-version graph storage engine.
//!
//! A [`shard::Shard`] owns one contiguous primary-key range of one label:
//! ordered vertex/edge containers with delta-chain version histories,
//! secondary indexes, a primary-key schema, snapshot-isolated
//! transactions, a write-ahead log, and an online split operation that
//! preserves in-progress transactions.

pub mod delta;
pub mod error;
pub mod model;
pub mod name_mapper;
pub mod shard;
pub mod snapshot;
pub mod wal;

pub use delta::{Delta, DeltaTarget};
pub use error::{StorageError, StorageResult};
pub use model::{
    Edge, EdgeKey, EdgeRef, PrimaryKey, PrimaryKeySchema, PropertyStore, SchemaProperty, Vertex,
    VertexKey,
};
pub use name_mapper::NameIdMapper;
pub use shard::{
    KeyRange, NodeContext, Shard, ShardConfig, ShardOptions, ShardTransaction, SplitData, View,
};
pub use snapshot::{SnapshotConfig, SnapshotManager};
pub use tessera_transaction::{IsolationLevel, Timestamp, Transaction, TxnState};

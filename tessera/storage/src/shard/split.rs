//! Online shard splitting.
//!
//! A split partitions one shard at primary key `K` into two successors
//! whose union is the parent's keyspace, preserving in-progress
//! transactions. Undo entries are `Arc`-owned by transaction buffers and
//! only weakly linked from objects, so moving a container entry together
//! with the undo entries targeting it carries every delta chain to the
//! successor intact; the entries that stay preserve the transaction's view
//! on the parent.

use std::sync::Arc;

use tessera_common::types::{CommandId, LabelId, PropertyId};
use tessera_transaction::{IsolationLevel, Timestamp, Transaction};
use tracing::info;
use uuid::Uuid;

use super::index::{IndexEntryMeta, IndexOp, LabelIndexKey, LabelPropertyIndexKey};
use super::mvcc::{VersionedEdge, VersionedVertex};
use super::transaction::ShardTransaction;
use super::{KeyRange, NodeContext, Shard, ShardConfig, ShardOptions};
use crate::delta::UndoEntry;
use crate::error::{StorageError, StorageResult};
use crate::model::{EdgeKey, PrimaryKey, PrimaryKeySchema};

/// An in-progress transaction's share of a split: same identity, command
/// counter, and isolation, carrying exactly the deltas and index ops whose
/// targets moved.
#[derive(Debug)]
pub(crate) struct TxnSplit {
    pub txn_id: Timestamp,
    pub start_ts: Timestamp,
    pub command_id: CommandId,
    pub isolation: IsolationLevel,
    pub undo_buffer: Vec<Arc<UndoEntry>>,
    pub index_log: Vec<IndexOp>,
    pub redo_buffer: Vec<crate::wal::RedoEntry>,
}

/// A committed transaction's share: kept so the moved delta chains stay
/// reachable for garbage collection on the successor.
#[derive(Debug)]
pub(crate) struct CommittedTxnSplit {
    pub txn_id: Timestamp,
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub undo_buffer: Vec<Arc<UndoEntry>>,
    pub index_log: Vec<IndexOp>,
}

/// Everything the right-hand successor of a split needs. Handed to the
/// shard manager, which installs the new shard with
/// [`Shard::from_split_data`].
#[derive(Debug)]
pub struct SplitData {
    pub parent: Uuid,
    pub primary_label: LabelId,
    pub key_range: KeyRange,
    /// The successor's shard version (`new_rhs_ver`).
    pub version: Timestamp,
    pub config: ShardConfig,
    pub(crate) schemas: Vec<PrimaryKeySchema>,
    pub(crate) label_indexes: Vec<LabelId>,
    pub(crate) label_property_indexes: Vec<(LabelId, PropertyId)>,
    pub(crate) vertices: Vec<(PrimaryKey, VersionedVertex)>,
    pub(crate) edges: Vec<(EdgeKey, VersionedEdge)>,
    pub(crate) label_entries: Vec<(LabelIndexKey, Timestamp, Timestamp)>,
    pub(crate) property_entries: Vec<(LabelPropertyIndexKey, Timestamp, Timestamp)>,
    pub(crate) transactions: Vec<TxnSplit>,
    pub(crate) committed: Vec<CommittedTxnSplit>,
    pub(crate) latest_commit_ts: Timestamp,
}

impl SplitData {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

fn index_op_pk(op: &IndexOp) -> &PrimaryKey {
    match op {
        IndexOp::LabelCreated(key)
        | IndexOp::LabelExpired(key)
        | IndexOp::LabelReinstated { key, .. } => &key.pk,
        IndexOp::PropCreated(key)
        | IndexOp::PropExpired(key)
        | IndexOp::PropReinstated { key, .. } => &key.pk,
    }
}

impl Shard {
    /// Splits this shard at `split_key`: entries with `pk >= split_key`
    /// (vertices, edges by source, index entries, transaction deltas) move
    /// into the returned [`SplitData`]; the parent keeps `[min, split_key)`
    /// and is restamped `new_lhs_ver`.
    pub fn perform_split(
        &self,
        split_key: &PrimaryKey,
        old_ver: Timestamp,
        new_lhs_ver: Timestamp,
        new_rhs_ver: Timestamp,
    ) -> StorageResult<SplitData> {
        // Freeze structural writes and commits for the duration.
        let _schema_guard = self.schema_lock.lock().unwrap();
        let _commit_guard = self.txn_manager.commit_latch();

        let current_ver = self.version();
        if current_ver != old_ver {
            return Err(StorageError::StaleShardMap {
                expected: current_ver.raw(),
                actual: old_ver.raw(),
            });
        }
        if new_lhs_ver <= old_ver || new_rhs_ver <= old_ver {
            return Err(StorageError::StaleShardMap {
                expected: old_ver.raw(),
                actual: new_lhs_ver.min(new_rhs_ver).raw(),
            });
        }
        let old_range = self.key_range();
        if !old_range.contains(split_key) || split_key.as_slice() <= old_range.min.as_slice() {
            return Err(StorageError::OutOfRange);
        }

        // Partition the vertex container at the split key.
        let moved_vertex_keys: Vec<PrimaryKey> = self
            .vertices
            .range::<PrimaryKey, _>((std::ops::Bound::Included(split_key), std::ops::Bound::Unbounded))
            .map(|entry| entry.key().clone())
            .collect();
        let mut vertices = Vec::with_capacity(moved_vertex_keys.len());
        for pk in moved_vertex_keys {
            if let Some(entry) = self.vertices.remove(&pk) {
                vertices.push((pk, entry.value().clone()));
            }
        }

        // Partition edges: an edge belongs to the successor owning its
        // source vertex.
        let moved_edge_keys: Vec<EdgeKey> = self
            .edges
            .iter()
            .filter(|entry| entry.key().src >= *split_key)
            .map(|entry| entry.key().clone())
            .collect();
        let mut edges = Vec::with_capacity(moved_edge_keys.len());
        for key in moved_edge_keys {
            if let Some(entry) = self.edges.remove(&key) {
                edges.push((key, entry.value().clone()));
            }
        }

        // Partition index entries by primary-key side.
        let mut label_entries = Vec::new();
        let moved_label_keys: Vec<LabelIndexKey> = self
            .label_index
            .entries
            .iter()
            .filter(|entry| entry.key().pk >= *split_key)
            .map(|entry| entry.key().clone())
            .collect();
        for key in moved_label_keys {
            if let Some(entry) = self.label_index.entries.remove(&key) {
                let (created, expired) = entry.value().stamps();
                label_entries.push((key, created, expired));
            }
        }
        let mut property_entries = Vec::new();
        let moved_property_keys: Vec<LabelPropertyIndexKey> = self
            .label_property_index
            .entries
            .iter()
            .filter(|entry| entry.key().pk >= *split_key)
            .map(|entry| entry.key().clone())
            .collect();
        for key in moved_property_keys {
            if let Some(entry) = self.label_property_index.entries.remove(&key) {
                let (created, expired) = entry.value().stamps();
                property_entries.push((key, created, expired));
            }
        }

        // Partition transactions: every in-progress transaction is
        // represented in both successors, each carrying exactly the deltas
        // touching that successor's range.
        let mut transactions = Vec::new();
        for entry in self.txn_manager.active_txns.iter() {
            let txn = entry.value();
            let moved_undo: Vec<Arc<UndoEntry>> = {
                let mut buffer = txn.undo_buffer.write().unwrap();
                let (rhs, lhs): (Vec<_>, Vec<_>) = buffer
                    .drain(..)
                    .partition(|e| *e.target().partition_key() >= *split_key);
                *buffer = lhs;
                rhs
            };
            let moved_ops: Vec<IndexOp> = {
                let mut log = txn.index_log.write().unwrap();
                let (rhs, lhs): (Vec<_>, Vec<_>) = log
                    .drain(..)
                    .partition(|op| *index_op_pk(op) >= *split_key);
                *log = lhs;
                rhs
            };
            // Redo records follow their targets so a post-split commit logs
            // each delta on the shard that owns it.
            let moved_redo: Vec<crate::wal::RedoEntry> = {
                let mut redo = txn.redo_buffer.write().unwrap();
                let (rhs, lhs): (Vec<_>, Vec<_>) =
                    redo.drain(..).partition(|entry| {
                        entry
                            .op
                            .partition_key()
                            .is_some_and(|pk| *pk >= *split_key)
                    });
                *redo = lhs;
                rhs
            };
            if !moved_undo.is_empty() || !moved_ops.is_empty() {
                transactions.push(TxnSplit {
                    txn_id: txn.txn_id(),
                    start_ts: txn.start_ts(),
                    command_id: txn.command_id(),
                    isolation: txn.isolation_level(),
                    undo_buffer: moved_undo,
                    index_log: moved_ops,
                    redo_buffer: moved_redo,
                });
            }
        }

        // Committed transactions still in the log hand over the moved
        // chains the same way, so GC on either side sees a complete buffer.
        let mut committed = Vec::new();
        for entry in self.txn_manager.committed_txns.iter() {
            let txn = entry.value();
            let moved_undo: Vec<Arc<UndoEntry>> = {
                let mut buffer = txn.undo_buffer.write().unwrap();
                let (rhs, lhs): (Vec<_>, Vec<_>) = buffer
                    .drain(..)
                    .partition(|e| *e.target().partition_key() >= *split_key);
                *buffer = lhs;
                rhs
            };
            let moved_ops: Vec<IndexOp> = {
                let mut log = txn.index_log.write().unwrap();
                let (rhs, lhs): (Vec<_>, Vec<_>) = log
                    .drain(..)
                    .partition(|op| *index_op_pk(op) >= *split_key);
                *log = lhs;
                rhs
            };
            if !moved_undo.is_empty() || !moved_ops.is_empty() {
                committed.push(CommittedTxnSplit {
                    txn_id: txn.txn_id(),
                    start_ts: txn.start_ts(),
                    commit_ts: entry.key().to_owned(),
                    undo_buffer: moved_undo,
                    index_log: moved_ops,
                });
            }
        }

        // Narrow the parent and stamp both successors.
        {
            let mut range = self.key_range.write().unwrap();
            range.max = Some(split_key.clone());
        }
        *self.version.write().unwrap() = new_lhs_ver;
        self.hlc().update_if_greater(new_lhs_ver)?;
        self.hlc().update_if_greater(new_rhs_ver)?;

        info!(
            shard = %self.uuid(),
            moved_vertices = vertices.len(),
            moved_edges = edges.len(),
            carried_txns = transactions.len(),
            "shard split performed"
        );

        Ok(SplitData {
            parent: self.uuid(),
            primary_label: self.primary_label(),
            key_range: KeyRange::new(split_key.clone(), old_range.max),
            version: new_rhs_ver,
            config: self.config().clone(),
            schemas: self.schemas_dump(),
            label_indexes: self
                .label_index
                .registered
                .read()
                .unwrap()
                .iter()
                .copied()
                .collect(),
            label_property_indexes: self
                .label_property_index
                .registered
                .read()
                .unwrap()
                .iter()
                .copied()
                .collect(),
            vertices,
            edges,
            label_entries,
            property_entries,
            transactions,
            committed,
            latest_commit_ts: self.txn_manager.latest_commit_ts(),
        })
    }

    pub(crate) fn schemas_dump(&self) -> Vec<PrimaryKeySchema> {
        self.schemas.dump()
    }

    /// Builds the right-hand successor of a split. `uuid` is assigned by
    /// the shard manager; `config` (notably WAL and snapshot paths) comes
    /// from the caller so the successor gets its own files.
    pub fn from_split_data(
        uuid: Uuid,
        config: ShardConfig,
        data: SplitData,
        ctx: NodeContext,
    ) -> StorageResult<Arc<Self>> {
        let shard = Shard::new(
            ShardOptions {
                uuid,
                primary_label: data.primary_label,
                key_range: data.key_range,
                version: data.version,
                config,
            },
            ctx,
        )?;
        shard.hlc().update_if_greater(data.version)?;

        for schema in data.schemas {
            shard.schemas.create(schema)?;
        }
        for label in data.label_indexes {
            shard.label_index.register(label);
        }
        for (label, property) in data.label_property_indexes {
            shard.label_property_index.register(label, property);
        }
        for (key, vertex) in data.vertices {
            shard.vertices.insert(key, vertex);
        }
        for (key, edge) in data.edges {
            shard.edges.insert(key, edge);
        }
        for (key, created, expired) in data.label_entries {
            shard
                .label_index
                .entries
                .insert(key, IndexEntryMeta::with_stamps(created, expired));
        }
        for (key, created, expired) in data.property_entries {
            shard
                .label_property_index
                .entries
                .insert(key, IndexEntryMeta::with_stamps(created, expired));
        }

        shard.txn_manager.record_commit(data.latest_commit_ts);
        for split in data.committed {
            shard.txn_ids().update_if_greater(split.txn_id)?;
            let txn = ShardTransaction::resume_committed(
                Arc::downgrade(&shard),
                split.txn_id,
                split.start_ts,
                split.commit_ts,
                split.undo_buffer,
                split.index_log,
            );
            shard.txn_manager.adopt_committed(Arc::new(txn));
        }
        for split in data.transactions {
            shard.txn_ids().update_if_greater(split.txn_id)?;
            let txn = ShardTransaction::resume(
                Arc::downgrade(&shard),
                split.txn_id,
                split.start_ts,
                split.command_id,
                split.isolation,
                split.undo_buffer,
                split.index_log,
            );
            *txn.redo_buffer.write().unwrap() = split.redo_buffer;
            shard.txn_manager.adopt(Arc::new(txn));
        }

        info!(
            shard = %shard.uuid(),
            parent = %data.parent,
            vertices = shard.vertex_count(),
            "shard installed from split data"
        );
        Ok(shard)
    }
}

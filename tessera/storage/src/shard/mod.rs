//! The shard: owner of one primary-key range of one label, embedding its
//! own MVCC store, secondary indexes, schema, transactions, and WAL.

pub mod index;
pub mod iterators;
pub mod mvcc;
pub mod split;
pub mod transaction;
pub mod txn_manager;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;
pub use mvcc::View;
pub use split::SplitData;
use tessera_common::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use tessera_common::value::PropertyValue;
use tessera_transaction::{
    HybridLogicalClock, IsolationLevel, Timestamp, Transaction, TransactionIdGenerator, TxnManager,
};
use tracing::info;
pub use transaction::ShardTransaction;
pub use txn_manager::ShardTxnManager;
use uuid::Uuid;

use self::index::{LabelIndex, LabelIndexKey, LabelPropertyIndex, LabelPropertyIndexKey};
use self::mvcc::{VersionChain, VersionedEdge, VersionedVertex, check_write_conflict};
use crate::delta::{Delta, DeltaTarget, ObjectState, UndoEntry};
use crate::error::{SchemaViolation, StorageError, StorageResult};
use crate::model::{
    Edge, EdgeKey, PrimaryKey, PrimaryKeySchema, PropertyStore, SchemaProperty, Schemas, Vertex,
    VertexKey,
};
use crate::name_mapper::NameIdMapper;
use crate::snapshot::SnapshotConfig;
use crate::wal::{Operation, RedoEntry, ShardWal, WalManager};

use serde::{Deserialize, Serialize};

/// The half-open primary-key range `[min, max)` a shard owns. `max = None`
/// means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: PrimaryKey,
    pub max: Option<PrimaryKey>,
}

impl KeyRange {
    /// The full keyspace.
    pub fn unbounded() -> Self {
        Self {
            min: Vec::new(),
            max: None,
        }
    }

    pub fn new(min: PrimaryKey, max: Option<PrimaryKey>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, pk: &[PropertyValue]) -> bool {
        if pk < self.min.as_slice() {
            return false;
        }
        match &self.max {
            Some(max) => pk < max.as_slice(),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// When false, edge property writes fail with `PropertiesDisabled`.
    pub edge_properties: bool,
    /// `should_split` fires once the vertex count reaches this.
    pub split_vertex_threshold: usize,
    /// WAL file; `None` runs the shard without durability.
    pub wal_path: Option<PathBuf>,
    /// Snapshot directory; `None` disables snapshots.
    pub snapshot: Option<SnapshotConfig>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            edge_properties: true,
            split_vertex_threshold: 100_000,
            wal_path: None,
            snapshot: None,
        }
    }
}

/// Node-wide dependencies handed to every shard at construction. The clock
/// and the id source are shared per node, never process singletons.
#[derive(Clone)]
pub struct NodeContext {
    pub name_mapper: Arc<NameIdMapper>,
    pub hlc: Arc<HybridLogicalClock>,
    pub txn_ids: Arc<TransactionIdGenerator>,
}

impl NodeContext {
    pub fn new() -> Self {
        Self {
            name_mapper: Arc::new(NameIdMapper::new()),
            hlc: Arc::new(HybridLogicalClock::new()),
            txn_ids: Arc::new(TransactionIdGenerator::new()),
        }
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Construction parameters of one shard.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub uuid: Uuid,
    pub primary_label: LabelId,
    pub key_range: KeyRange,
    pub version: Timestamp,
    pub config: ShardConfig,
}

pub struct Shard {
    uuid: Uuid,
    primary_label: LabelId,
    pub(crate) key_range: std::sync::RwLock<KeyRange>,
    /// Shard version, bumped by every split.
    pub(crate) version: std::sync::RwLock<Timestamp>,
    config: ShardConfig,

    ctx: NodeContext,

    pub(crate) schemas: Schemas,
    pub(crate) vertices: SkipMap<PrimaryKey, VersionedVertex>,
    pub(crate) edges: SkipMap<EdgeKey, VersionedEdge>,
    pub(crate) label_index: LabelIndex,
    pub(crate) label_property_index: LabelPropertyIndex,
    pub(crate) txn_manager: ShardTxnManager,
    wal: Option<WalManager>,

    /// Structural freeze latch: index create/drop and splits serialize
    /// here.
    pub(crate) schema_lock: Mutex<()>,
}

impl Shard {
    /// Creates an empty shard. The WAL (if configured) is opened but not
    /// replayed; use [`Shard::recover`] to restore persisted state.
    pub fn new(options: ShardOptions, ctx: NodeContext) -> StorageResult<Arc<Self>> {
        let wal = match &options.config.wal_path {
            Some(path) => Some(WalManager::open(path)?),
            None => None,
        };
        let shard = Arc::new_cyclic(|weak| Self {
            uuid: options.uuid,
            primary_label: options.primary_label,
            key_range: std::sync::RwLock::new(options.key_range),
            version: std::sync::RwLock::new(options.version),
            config: options.config,
            ctx,
            schemas: Schemas::new(),
            vertices: SkipMap::new(),
            edges: SkipMap::new(),
            label_index: LabelIndex::default(),
            label_property_index: LabelPropertyIndex::default(),
            txn_manager: ShardTxnManager::new(weak.clone()),
            wal,
            schema_lock: Mutex::new(()),
        });
        Ok(shard)
    }

    /// Rebuilds a shard from its snapshot and WAL. Failures here are fatal
    /// at startup.
    pub fn recover(options: ShardOptions, ctx: NodeContext) -> StorageResult<Arc<Self>> {
        let shard = Self::new(options, ctx)?;

        let mut wal_cut = 0;
        if let Some(snapshot_config) = shard.config.snapshot.clone() {
            let manager = crate::snapshot::SnapshotManager::new(snapshot_config);
            if let Some(snapshot) = manager.load_latest()? {
                wal_cut = crate::snapshot::apply_snapshot(&shard, snapshot)?;
            }
        }

        if shard.wal.is_some() {
            let entries = {
                let wal_manager = shard.wal.as_ref().unwrap();
                let wal = wal_manager.wal().read().unwrap();
                wal.read_all()?
            };
            shard.apply_wal_entries(entries, wal_cut)?;
        }
        info!(shard = %shard.uuid, "shard recovered");
        Ok(shard)
    }

    // ===== Basic accessors =====

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn primary_label(&self) -> LabelId {
        self.primary_label
    }

    pub fn key_range(&self) -> KeyRange {
        self.key_range.read().unwrap().clone()
    }

    pub fn version(&self) -> Timestamp {
        *self.version.read().unwrap()
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn name_mapper(&self) -> &Arc<NameIdMapper> {
        &self.ctx.name_mapper
    }

    pub fn hlc(&self) -> &Arc<HybridLogicalClock> {
        &self.ctx.hlc
    }

    pub(crate) fn txn_ids(&self) -> &Arc<TransactionIdGenerator> {
        &self.ctx.txn_ids
    }

    pub fn node_context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn txn_manager(&self) -> &ShardTxnManager {
        &self.txn_manager
    }

    pub(crate) fn vertices(&self) -> &SkipMap<PrimaryKey, VersionedVertex> {
        &self.vertices
    }

    pub(crate) fn edges(&self) -> &SkipMap<EdgeKey, VersionedEdge> {
        &self.edges
    }

    pub(crate) fn label_index(&self) -> &LabelIndex {
        &self.label_index
    }

    pub(crate) fn label_property_index(&self) -> &LabelPropertyIndex {
        &self.label_property_index
    }

    pub(crate) fn wal_manager(&self) -> Option<&WalManager> {
        self.wal.as_ref()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Whether a primary key falls inside this shard's `[min, max)` range.
    pub fn contains_key(&self, pk: &[PropertyValue]) -> bool {
        self.key_range.read().unwrap().contains(pk)
    }

    fn is_local_vertex(&self, key: &VertexKey) -> bool {
        key.label == self.primary_label && self.contains_key(&key.pk)
    }

    // ===== Transactions =====

    /// Opens an accessor at `start_ts` (or at the clock's next reading).
    /// An in-progress transaction with the same start timestamp is reused.
    pub fn access(
        self: &Arc<Self>,
        start_ts: Option<Timestamp>,
    ) -> StorageResult<Arc<ShardTransaction>> {
        self.txn_manager.access(start_ts, IsolationLevel::Snapshot)
    }

    // ===== Reads =====

    /// Looks up a vertex by primary key under the transaction's snapshot.
    /// `View::Old` hides the transaction's own pending changes.
    pub fn find_vertex(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
        view: View,
    ) -> Option<Vertex> {
        let slot = self.vertices.get(pk)?;
        slot.value().read(&txn.read_view(view))
    }

    pub fn find_edge(
        &self,
        txn: &Arc<ShardTransaction>,
        key: &EdgeKey,
        view: View,
    ) -> Option<Edge> {
        let slot = self.edges.get(key)?;
        slot.value().read(&txn.read_view(view))
    }

    // ===== Writes =====

    fn push_redo(&self, txn: &Arc<ShardTransaction>, op: Operation) {
        txn.redo_buffer.write().unwrap().push(RedoEntry {
            lsn: 0, // assigned when the commit drains the buffer
            txn_id: txn.txn_id(),
            op,
        });
    }

    fn push_undo<D>(
        txn: &Arc<ShardTransaction>,
        chain: &VersionChain<D>,
        delta: Delta,
        target: DeltaTarget,
        restore_ts: Timestamp,
    ) {
        let next = chain.undo_ptr.read().unwrap().clone();
        let entry = Arc::new(UndoEntry::new(
            delta,
            target,
            restore_ts,
            txn.txn_id(),
            txn.command_id(),
            next,
        ));
        txn.undo_buffer.write().unwrap().push(entry.clone());
        *chain.undo_ptr.write().unwrap() = Arc::downgrade(&entry);
    }

    /// Creates a vertex after validating it against the primary-key
    /// schema and the shard's key range.
    pub fn create_vertex(
        &self,
        txn: &Arc<ShardTransaction>,
        labels: &[LabelId],
        pk: PrimaryKey,
        properties: PropertyStore,
    ) -> StorageResult<Vertex> {
        let schema = self.schemas.get(self.primary_label)?;
        schema.validate_create(labels, &pk, &properties)?;
        if !self.contains_key(&pk) {
            return Err(StorageError::OutOfRange);
        }

        // A vacant slot is a tombstone that never existed, so fresh inserts
        // and re-creates over a committed deletion share this path.
        let slot = self
            .vertices
            .get_or_insert_with(pk.clone(), || VersionedVertex::vacant(pk.clone()));
        let chain = &slot.value().chain;
        let vertex = {
            let mut current = chain.current.write().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if !current.data.is_tombstone() {
                return Err(StorageError::VertexAlreadyInserted(format!(
                    "vertex {:?}",
                    pk
                )));
            }
            let vertex = Vertex::new(
                pk.clone(),
                smallvec::SmallVec::from_slice(labels),
                properties.clone(),
            );
            Self::push_undo(
                txn,
                chain,
                Delta::DeleteObject,
                DeltaTarget::Vertex(pk.clone()),
                current.commit_ts,
            );
            current.data = vertex.clone();
            current.commit_ts = txn.txn_id();
            vertex
        };

        self.index_vertex_created(txn, &vertex);
        self.push_redo(txn, Operation::CreateVertex {
            labels: labels.to_vec(),
            pk,
            properties: properties
                .iter()
                .map(|(id, value)| (id, value.clone()))
                .collect(),
        });
        Ok(vertex)
    }

    fn index_vertex_created(&self, txn: &Arc<ShardTransaction>, vertex: &Vertex) {
        let mut log = txn.index_log.write().unwrap();
        for label in &vertex.labels {
            if self.label_index.is_registered(*label) {
                log.push(self.label_index.insert(
                    LabelIndexKey {
                        label: *label,
                        pk: vertex.pk.clone(),
                    },
                    txn.txn_id(),
                ));
            }
            for (property, value) in vertex.properties.iter() {
                if self.label_property_index.is_registered(*label, property) {
                    log.push(self.label_property_index.insert(
                        LabelPropertyIndexKey {
                            label: *label,
                            property,
                            value: value.clone(),
                            pk: vertex.pk.clone(),
                        },
                        txn.txn_id(),
                    ));
                }
            }
        }
    }

    /// Creates an edge from a local vertex. The destination's in-edge list
    /// is maintained when the destination is local; a cross-shard edge is
    /// kept on the source side with a reference to the remote destination.
    pub fn create_edge(
        &self,
        txn: &Arc<ShardTransaction>,
        src_pk: &PrimaryKey,
        dst: VertexKey,
        edge_type: EdgeTypeId,
        gid: Gid,
    ) -> StorageResult<Edge> {
        if !self.contains_key(src_pk) {
            return Err(StorageError::OutOfRange);
        }

        // Validate everything this operation will touch before threading
        // any delta, so a failure leaves the transaction clean.
        let src_slot = self
            .vertices
            .get(src_pk)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", src_pk)))?;
        {
            let current = src_slot.value().chain.current.read().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if current.data.is_tombstone() {
                return Err(self.tombstone_error(current.commit_ts, txn, "vertex", src_pk));
            }
        }
        let dst_slot = if self.is_local_vertex(&dst) {
            let slot = self
                .vertices
                .get(&dst.pk)
                .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", dst.pk)))?;
            {
                let current = slot.value().chain.current.read().unwrap();
                check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
                if current.data.is_tombstone() {
                    return Err(self.tombstone_error(current.commit_ts, txn, "vertex", &dst.pk));
                }
            }
            Some(slot)
        } else {
            None
        };

        let key = EdgeKey {
            src: src_pk.clone(),
            dst: dst.clone(),
            edge_type,
            gid,
        };
        let edge_slot = self
            .edges
            .get_or_insert_with(key.clone(), || VersionedEdge::vacant(&key, self.primary_label));
        let edge = Edge::new(
            gid,
            VertexKey::new(self.primary_label, src_pk.clone()),
            dst.clone(),
            edge_type,
            self.config.edge_properties.then(PropertyStore::default),
        );
        {
            let chain = &edge_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if !current.data.is_tombstone() {
                return Err(StorageError::VertexAlreadyInserted(format!("edge {}", gid)));
            }
            Self::push_undo(
                txn,
                chain,
                Delta::DeleteObject,
                DeltaTarget::Edge(key.clone()),
                current.commit_ts,
            );
            current.data = edge.clone();
            current.commit_ts = txn.txn_id();
        }

        // Reciprocal references: the source's out-edge entry and, when
        // local, the destination's in-edge entry, in the same command.
        {
            let chain = &src_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            let out_ref = edge.out_ref();
            Self::push_undo(
                txn,
                chain,
                Delta::RemoveOutEdge(out_ref.clone()),
                DeltaTarget::Vertex(src_pk.clone()),
                current.commit_ts,
            );
            current.data.add_out_edge(out_ref);
            current.commit_ts = txn.txn_id();
        }
        if let Some(dst_slot) = dst_slot {
            let chain = &dst_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            let in_ref = edge.in_ref();
            Self::push_undo(
                txn,
                chain,
                Delta::RemoveInEdge(in_ref.clone()),
                DeltaTarget::Vertex(dst.pk.clone()),
                current.commit_ts,
            );
            current.data.add_in_edge(in_ref);
            current.commit_ts = txn.txn_id();
        }

        self.push_redo(txn, Operation::CreateEdge {
            src: src_pk.clone(),
            dst,
            edge_type,
            gid,
        });
        Ok(edge)
    }

    fn tombstone_error(
        &self,
        stamp: Timestamp,
        txn: &Arc<ShardTransaction>,
        kind: &str,
        id: &dyn std::fmt::Debug,
    ) -> StorageError {
        if stamp == txn.txn_id() {
            StorageError::DeletedObject(format!("{} {:?}", kind, id))
        } else {
            StorageError::NonexistentObject(format!("{} {:?}", kind, id))
        }
    }

    /// Deletes an edge, dropping the reciprocal references on both local
    /// endpoints. Returns the removed edge.
    pub fn delete_edge(&self, txn: &Arc<ShardTransaction>, key: &EdgeKey) -> StorageResult<Edge> {
        let edge_slot = self
            .edges
            .get(key)
            .ok_or_else(|| StorageError::NonexistentObject(format!("edge {}", key.gid)))?;
        let old = {
            let stamp = {
                let current = edge_slot.value().chain.current.read().unwrap();
                current.commit_ts
            };
            check_write_conflict(stamp, txn.txn_id(), txn.start_ts())?;
            let old = edge_slot.value().reconstruct(&txn.write_view());
            if old.is_tombstone() {
                return Err(self.tombstone_error(stamp, txn, "edge", &key.gid));
            }
            old
        };

        let src_slot = self
            .vertices
            .get(&key.src)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", key.src)))?;
        {
            let current = src_slot.value().chain.current.read().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
        }
        let dst_slot = if self.is_local_vertex(&old.dst) {
            let slot = self.vertices.get(&old.dst.pk).ok_or_else(|| {
                StorageError::NonexistentObject(format!("vertex {:?}", old.dst.pk))
            })?;
            {
                let current = slot.value().chain.current.read().unwrap();
                check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            }
            Some(slot)
        } else {
            None
        };

        {
            let chain = &edge_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            Self::push_undo(
                txn,
                chain,
                Delta::RecreateObject(Box::new(ObjectState::Edge(old.clone()))),
                DeltaTarget::Edge(key.clone()),
                current.commit_ts,
            );
            current.data.is_tombstone = true;
            current.commit_ts = txn.txn_id();
        }
        {
            let chain = &src_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            let out_ref = old.out_ref();
            Self::push_undo(
                txn,
                chain,
                Delta::AddOutEdge(out_ref.clone()),
                DeltaTarget::Vertex(key.src.clone()),
                current.commit_ts,
            );
            current.data.remove_out_edge(&out_ref);
            current.commit_ts = txn.txn_id();
        }
        if let Some(dst_slot) = dst_slot {
            let chain = &dst_slot.value().chain;
            let mut current = chain.current.write().unwrap();
            let in_ref = old.in_ref();
            Self::push_undo(
                txn,
                chain,
                Delta::AddInEdge(in_ref.clone()),
                DeltaTarget::Vertex(old.dst.pk.clone()),
                current.commit_ts,
            );
            current.data.remove_in_edge(&in_ref);
            current.commit_ts = txn.txn_id();
        }

        self.push_redo(txn, Operation::DeleteEdge { key: key.clone() });
        Ok(old)
    }

    /// Deletes a vertex. Fails with `VertexHasEdges` when the current
    /// version has visible incident edges.
    pub fn delete_vertex(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
    ) -> StorageResult<Vertex> {
        self.delete_vertex_inner(txn, pk, false).map(|(v, _)| v)
    }

    /// Deletes a vertex together with all its incident edges. Returns the
    /// vertex and the removed edges.
    pub fn detach_delete_vertex(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
    ) -> StorageResult<(Vertex, Vec<Edge>)> {
        self.delete_vertex_inner(txn, pk, true)
    }

    fn delete_vertex_inner(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
        detach: bool,
    ) -> StorageResult<(Vertex, Vec<Edge>)> {
        let visible = {
            let slot = self
                .vertices
                .get(pk)
                .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", pk)))?;
            let stamp = {
                let current = slot.value().chain.current.read().unwrap();
                current.commit_ts
            };
            check_write_conflict(stamp, txn.txn_id(), txn.start_ts())?;
            // After the conflict check the write-visible state is the
            // current one; reconstruction only filters later own commands.
            let visible = slot.value().reconstruct(&txn.write_view());
            if visible.is_tombstone() {
                return Err(self.tombstone_error(stamp, txn, "vertex", pk));
            }
            visible
        };

        if visible.has_edges() && !detach {
            return Err(StorageError::VertexHasEdges(format!("vertex {:?}", pk)));
        }

        let mut removed_edges = Vec::new();
        if detach {
            let mut removed_keys: Vec<EdgeKey> = Vec::new();
            for out_ref in &visible.out_edges {
                let key = EdgeKey {
                    src: pk.clone(),
                    dst: out_ref.other.clone(),
                    edge_type: out_ref.edge_type,
                    gid: out_ref.gid,
                };
                if removed_keys.contains(&key) {
                    continue;
                }
                removed_edges.push(self.delete_edge(txn, &key)?);
                removed_keys.push(key);
            }
            for in_ref in &visible.in_edges {
                if self.is_local_vertex(&in_ref.other) {
                    let key = EdgeKey {
                        src: in_ref.other.pk.clone(),
                        dst: VertexKey::new(self.primary_label, pk.clone()),
                        edge_type: in_ref.edge_type,
                        gid: in_ref.gid,
                    };
                    // A self-loop was already removed through the out list.
                    if removed_keys.contains(&key) {
                        continue;
                    }
                    removed_edges.push(self.delete_edge(txn, &key)?);
                    removed_keys.push(key);
                } else {
                    // The edge record lives on the remote source shard;
                    // only the local in-reference is dropped here.
                    let slot = self.vertices.get(pk).ok_or_else(|| {
                        StorageError::NonexistentObject(format!("vertex {:?}", pk))
                    })?;
                    let chain = &slot.value().chain;
                    let mut current = chain.current.write().unwrap();
                    Self::push_undo(
                        txn,
                        chain,
                        Delta::AddInEdge(in_ref.clone()),
                        DeltaTarget::Vertex(pk.clone()),
                        current.commit_ts,
                    );
                    current.data.remove_in_edge(in_ref);
                    current.commit_ts = txn.txn_id();
                }
            }
        }

        let slot = self
            .vertices
            .get(pk)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", pk)))?;
        let chain = &slot.value().chain;
        let old = {
            let mut current = chain.current.write().unwrap();
            let old = current.data.clone();
            Self::push_undo(
                txn,
                chain,
                Delta::RecreateObject(Box::new(ObjectState::Vertex(old.clone()))),
                DeltaTarget::Vertex(pk.clone()),
                current.commit_ts,
            );
            current.data.is_tombstone = true;
            current.commit_ts = txn.txn_id();
            old
        };

        // Expire index entries for everything the vertex carried.
        {
            let mut log = txn.index_log.write().unwrap();
            for label in &old.labels {
                if self.label_index.is_registered(*label) {
                    if let Some(op) = self.label_index.expire(
                        LabelIndexKey {
                            label: *label,
                            pk: pk.clone(),
                        },
                        txn.txn_id(),
                    ) {
                        log.push(op);
                    }
                }
                for (property, value) in old.properties.iter() {
                    if self.label_property_index.is_registered(*label, property) {
                        if let Some(op) = self.label_property_index.expire(
                            LabelPropertyIndexKey {
                                label: *label,
                                property,
                                value: value.clone(),
                                pk: pk.clone(),
                            },
                            txn.txn_id(),
                        ) {
                            log.push(op);
                        }
                    }
                }
            }
        }

        self.push_redo(txn, Operation::DeleteVertex { pk: pk.clone() });
        Ok((old, removed_edges))
    }

    /// Sets a vertex property; setting `Null` removes it. Re-writing the
    /// current value is a no-op and produces no delta. Returns the old
    /// value.
    pub fn set_vertex_property(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
        property: PropertyId,
        value: PropertyValue,
    ) -> StorageResult<PropertyValue> {
        let schema = self.schemas.get(self.primary_label)?;
        if schema.properties.iter().any(|p| p.property_id == property) {
            return Err(StorageError::SchemaViolation(
                SchemaViolation::KeyPropertyOverlap { property },
            ));
        }

        let slot = self
            .vertices
            .get(pk)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", pk)))?;
        let chain = &slot.value().chain;
        let (old, labels) = {
            let mut current = chain.current.write().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if current.data.is_tombstone() {
                return Err(self.tombstone_error(current.commit_ts, txn, "vertex", pk));
            }
            let old = current
                .data
                .properties
                .get(property)
                .cloned()
                .unwrap_or(PropertyValue::Null);
            if old == value {
                return Ok(old);
            }
            Self::push_undo(
                txn,
                chain,
                Delta::SetProperty(property, old.clone()),
                DeltaTarget::Vertex(pk.clone()),
                current.commit_ts,
            );
            current.data.properties.set(property, value.clone());
            current.commit_ts = txn.txn_id();
            (old, current.data.labels.clone())
        };

        {
            let mut log = txn.index_log.write().unwrap();
            for label in labels {
                if self.label_property_index.is_registered(label, property) {
                    if !old.is_null() {
                        if let Some(op) = self.label_property_index.expire(
                            LabelPropertyIndexKey {
                                label,
                                property,
                                value: old.clone(),
                                pk: pk.clone(),
                            },
                            txn.txn_id(),
                        ) {
                            log.push(op);
                        }
                    }
                    if !value.is_null() {
                        log.push(self.label_property_index.insert(
                            LabelPropertyIndexKey {
                                label,
                                property,
                                value: value.clone(),
                                pk: pk.clone(),
                            },
                            txn.txn_id(),
                        ));
                    }
                }
            }
        }

        self.push_redo(txn, Operation::SetVertexProperty {
            pk: pk.clone(),
            property,
            value,
        });
        Ok(old)
    }

    /// Sets an edge property. Fails with `PropertiesDisabled` when the
    /// shard is configured property-less for edges.
    pub fn set_edge_property(
        &self,
        txn: &Arc<ShardTransaction>,
        key: &EdgeKey,
        property: PropertyId,
        value: PropertyValue,
    ) -> StorageResult<PropertyValue> {
        if !self.config.edge_properties {
            return Err(StorageError::PropertiesDisabled);
        }
        let slot = self
            .edges
            .get(key)
            .ok_or_else(|| StorageError::NonexistentObject(format!("edge {}", key.gid)))?;
        let chain = &slot.value().chain;
        let mut current = chain.current.write().unwrap();
        check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
        if current.data.is_tombstone() {
            return Err(self.tombstone_error(current.commit_ts, txn, "edge", &key.gid));
        }
        let old = current
            .data
            .properties
            .as_ref()
            .and_then(|props| props.get(property).cloned())
            .unwrap_or(PropertyValue::Null);
        if old == value {
            return Ok(old);
        }
        Self::push_undo(
            txn,
            chain,
            Delta::SetProperty(property, old.clone()),
            DeltaTarget::Edge(key.clone()),
            current.commit_ts,
        );
        if let Some(props) = current.data.properties.as_mut() {
            props.set(property, value.clone());
        }
        current.commit_ts = txn.txn_id();
        drop(current);

        self.push_redo(txn, Operation::SetEdgeProperty {
            key: key.clone(),
            property,
            value,
        });
        Ok(old)
    }

    /// Adds a label; returns false (and produces no delta) when the label
    /// was already present.
    pub fn add_label(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
        label: LabelId,
    ) -> StorageResult<bool> {
        let slot = self
            .vertices
            .get(pk)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", pk)))?;
        let chain = &slot.value().chain;
        let properties = {
            let mut current = chain.current.write().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if current.data.is_tombstone() {
                return Err(self.tombstone_error(current.commit_ts, txn, "vertex", pk));
            }
            if current.data.has_label(label) {
                return Ok(false);
            }
            Self::push_undo(
                txn,
                chain,
                Delta::RemoveLabel(label),
                DeltaTarget::Vertex(pk.clone()),
                current.commit_ts,
            );
            current.data.add_label(label);
            current.commit_ts = txn.txn_id();
            current.data.properties.clone()
        };

        {
            let mut log = txn.index_log.write().unwrap();
            if self.label_index.is_registered(label) {
                log.push(self.label_index.insert(
                    LabelIndexKey {
                        label,
                        pk: pk.clone(),
                    },
                    txn.txn_id(),
                ));
            }
            for (property, value) in properties.iter() {
                if self.label_property_index.is_registered(label, property) {
                    log.push(self.label_property_index.insert(
                        LabelPropertyIndexKey {
                            label,
                            property,
                            value: value.clone(),
                            pk: pk.clone(),
                        },
                        txn.txn_id(),
                    ));
                }
            }
        }

        self.push_redo(txn, Operation::AddLabel {
            pk: pk.clone(),
            label,
        });
        Ok(true)
    }

    /// Removes a label; returns false when it was not present. The primary
    /// label cannot be removed.
    pub fn remove_label(
        &self,
        txn: &Arc<ShardTransaction>,
        pk: &PrimaryKey,
        label: LabelId,
    ) -> StorageResult<bool> {
        if label == self.primary_label {
            return Err(StorageError::SchemaViolation(
                SchemaViolation::MissingPrimaryLabel,
            ));
        }
        let slot = self
            .vertices
            .get(pk)
            .ok_or_else(|| StorageError::NonexistentObject(format!("vertex {:?}", pk)))?;
        let chain = &slot.value().chain;
        let properties = {
            let mut current = chain.current.write().unwrap();
            check_write_conflict(current.commit_ts, txn.txn_id(), txn.start_ts())?;
            if current.data.is_tombstone() {
                return Err(self.tombstone_error(current.commit_ts, txn, "vertex", pk));
            }
            if !current.data.has_label(label) {
                return Ok(false);
            }
            Self::push_undo(
                txn,
                chain,
                Delta::AddLabel(label),
                DeltaTarget::Vertex(pk.clone()),
                current.commit_ts,
            );
            current.data.remove_label(label);
            current.commit_ts = txn.txn_id();
            current.data.properties.clone()
        };

        {
            let mut log = txn.index_log.write().unwrap();
            if self.label_index.is_registered(label) {
                if let Some(op) = self.label_index.expire(
                    LabelIndexKey {
                        label,
                        pk: pk.clone(),
                    },
                    txn.txn_id(),
                ) {
                    log.push(op);
                }
            }
            for (property, value) in properties.iter() {
                if self.label_property_index.is_registered(label, property) {
                    if let Some(op) = self.label_property_index.expire(
                        LabelPropertyIndexKey {
                            label,
                            property,
                            value: value.clone(),
                            pk: pk.clone(),
                        },
                        txn.txn_id(),
                    ) {
                        log.push(op);
                    }
                }
            }
        }

        self.push_redo(txn, Operation::RemoveLabel {
            pk: pk.clone(),
            label,
        });
        Ok(true)
    }

    // ===== Admin operations =====

    fn append_admin_record(&self, op: Operation) -> StorageResult<()> {
        if let Some(wal_manager) = self.wal.as_ref() {
            let mut wal = wal_manager.wal().write().unwrap();
            wal.append(&RedoEntry {
                lsn: wal_manager.next_lsn(),
                txn_id: Timestamp::ZERO,
                op,
            })?;
            wal.flush()?;
        }
        Ok(())
    }

    /// Declares the primary-key schema of a label.
    pub fn create_schema(
        &self,
        label: LabelId,
        properties: Vec<SchemaProperty>,
    ) -> StorageResult<()> {
        self.create_schema_inner(label, properties, true)
    }

    fn create_schema_inner(
        &self,
        label: LabelId,
        properties: Vec<SchemaProperty>,
        log: bool,
    ) -> StorageResult<()> {
        let _guard = self.schema_lock.lock().unwrap();
        self.schemas
            .create(PrimaryKeySchema::new(label, properties.clone()))?;
        if log {
            self.append_admin_record(Operation::CreateSchema { label, properties })?;
        }
        Ok(())
    }

    pub fn drop_schema(&self, label: LabelId) -> StorageResult<()> {
        self.drop_schema_inner(label, true)
    }

    fn drop_schema_inner(&self, label: LabelId, log: bool) -> StorageResult<()> {
        let _guard = self.schema_lock.lock().unwrap();
        self.schemas.drop(label)?;
        if log {
            self.append_admin_record(Operation::DropSchema { label })?;
        }
        Ok(())
    }

    /// Creates a label index (`property = None`) or a label-property
    /// index, backfilling entries for currently stored vertices.
    /// Idempotent.
    pub fn create_index(&self, label: LabelId, property: Option<PropertyId>) -> StorageResult<()> {
        self.create_index_inner(label, property, true)
    }

    fn create_index_inner(
        &self,
        label: LabelId,
        property: Option<PropertyId>,
        log: bool,
    ) -> StorageResult<()> {
        let _guard = self.schema_lock.lock().unwrap();
        match property {
            None => {
                if self.label_index.register(label) {
                    for slot in self.vertices.iter() {
                        let current = slot.value().chain.current.read().unwrap();
                        if !current.data.is_tombstone() && current.data.has_label(label) {
                            self.label_index.backfill(
                                LabelIndexKey {
                                    label,
                                    pk: slot.key().clone(),
                                },
                                current.commit_ts,
                            );
                        }
                    }
                }
            }
            Some(property) => {
                if self.label_property_index.register(label, property) {
                    for slot in self.vertices.iter() {
                        let current = slot.value().chain.current.read().unwrap();
                        if current.data.is_tombstone() || !current.data.has_label(label) {
                            continue;
                        }
                        if let Some(value) = current.data.properties.get(property) {
                            self.label_property_index.backfill(
                                LabelPropertyIndexKey {
                                    label,
                                    property,
                                    value: value.clone(),
                                    pk: slot.key().clone(),
                                },
                                current.commit_ts,
                            );
                        }
                    }
                }
            }
        }
        if log {
            self.append_admin_record(Operation::CreateIndex { label, property })?;
        }
        Ok(())
    }

    pub fn drop_index(&self, label: LabelId, property: Option<PropertyId>) -> StorageResult<()> {
        self.drop_index_inner(label, property, true)
    }

    fn drop_index_inner(
        &self,
        label: LabelId,
        property: Option<PropertyId>,
        log: bool,
    ) -> StorageResult<()> {
        let _guard = self.schema_lock.lock().unwrap();
        match property {
            None => {
                self.label_index.unregister(label);
            }
            Some(property) => {
                self.label_property_index.unregister(label, property);
            }
        }
        if log {
            self.append_admin_record(Operation::DropIndex { label, property })?;
        }
        Ok(())
    }

    // ===== Maintenance =====

    /// Runs one garbage-collection pass against the current watermark.
    pub fn collect_garbage(&self, now: Timestamp) -> StorageResult<()> {
        self.txn_manager.collect_garbage(self, now)
    }

    /// Suggests a split key once the shard exceeds its configured size:
    /// the primary key at the median of the vertex container. Returns
    /// `None` while the shard is small or no key strictly inside the range
    /// exists.
    pub fn should_split(&self) -> Option<PrimaryKey> {
        let len = self.vertices.len();
        if len < self.config.split_vertex_threshold {
            return None;
        }
        let candidate = self.vertices.iter().nth(len / 2)?.key().clone();
        let range = self.key_range.read().unwrap();
        if candidate.as_slice() <= range.min.as_slice() {
            return None;
        }
        Some(candidate)
    }

    // ===== Recovery =====

    /// Replays WAL entries through the normal write paths. Entries with
    /// `lsn <= skip_upto_lsn` precede the snapshot and are skipped.
    pub(crate) fn apply_wal_entries(
        self: &Arc<Self>,
        entries: Vec<RedoEntry>,
        skip_upto_lsn: u64,
    ) -> StorageResult<()> {
        let mut open: HashMap<u64, Arc<ShardTransaction>> = HashMap::new();
        for entry in entries {
            if let Some(wal_manager) = self.wal.as_ref() {
                wal_manager.observe_lsn(entry.lsn);
            }
            if entry.lsn <= skip_upto_lsn {
                continue;
            }
            match entry.op {
                Operation::Begin { start_ts } => {
                    self.hlc().update_if_greater(start_ts)?;
                    let txn = self
                        .txn_manager
                        .access(Some(start_ts), IsolationLevel::Snapshot)?;
                    open.insert(entry.txn_id.raw(), txn);
                }
                Operation::Commit { commit_ts } => {
                    if let Some(txn) = open.remove(&entry.txn_id.raw()) {
                        txn.commit_at(Some(commit_ts), true)?;
                    }
                }
                ref op => {
                    let Some(txn) = open.get(&entry.txn_id.raw()) else {
                        // Admin records carry no transaction.
                        match op {
                            Operation::CreateIndex { label, property } => {
                                self.create_index_inner(*label, *property, false)?;
                            }
                            Operation::DropIndex { label, property } => {
                                self.drop_index_inner(*label, *property, false)?;
                            }
                            Operation::CreateSchema { label, properties } => {
                                self.create_schema_inner(*label, properties.clone(), false)?;
                            }
                            Operation::DropSchema { label } => {
                                self.drop_schema_inner(*label, false)?;
                            }
                            _ => {}
                        }
                        continue;
                    };
                    match op.clone() {
                        Operation::CreateVertex {
                            labels,
                            pk,
                            properties,
                        } => {
                            self.create_vertex(txn, &labels, pk, PropertyStore::new(properties))?;
                        }
                        Operation::DeleteVertex { pk } => {
                            self.delete_vertex_inner(txn, &pk, false)?;
                        }
                        Operation::AddLabel { pk, label } => {
                            self.add_label(txn, &pk, label)?;
                        }
                        Operation::RemoveLabel { pk, label } => {
                            self.remove_label(txn, &pk, label)?;
                        }
                        Operation::SetVertexProperty {
                            pk,
                            property,
                            value,
                        } => {
                            self.set_vertex_property(txn, &pk, property, value)?;
                        }
                        Operation::CreateEdge {
                            src,
                            dst,
                            edge_type,
                            gid,
                        } => {
                            self.create_edge(txn, &src, dst, edge_type, gid)?;
                        }
                        Operation::DeleteEdge { key } => {
                            self.delete_edge(txn, &key)?;
                        }
                        Operation::SetEdgeProperty {
                            key,
                            property,
                            value,
                        } => {
                            self.set_edge_property(txn, &key, property, value)?;
                        }
                        _ => {}
                    }
                }
            }
        }
        // A crash can leave the tail of the log without a commit marker;
        // those transactions never became durable and are rolled back.
        for (_, txn) in open {
            txn.rollback()?;
        }
        Ok(())
    }
}

//! Version chains and the snapshot-visibility walk.
//!
//! Every stored object holds its newest state plus a weak pointer into a
//! chain of undo entries (newest-undone first). The entries themselves are
//! owned by the producing transactions' buffers; when GC drops a buffer the
//! chain tail dies with it.

use std::sync::{Arc, RwLock, Weak};

use tessera_common::types::CommandId;
use tessera_transaction::Timestamp;

use crate::delta::{Delta, UndoPtr};
use crate::error::{StorageError, StorageResult};
use crate::model::{Edge, Vertex};

/// Which state of the transaction's own pending changes a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    /// The state before this transaction's changes.
    Old,
    /// The state including this transaction's changes from earlier
    /// commands.
    #[default]
    New,
}

/// The reader's identity and snapshot, captured once per operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadView {
    pub txn_id: Timestamp,
    pub start_ts: Timestamp,
    pub command_id: CommandId,
    pub view: View,
    /// Write paths see their own current command's creations.
    pub for_write: bool,
}

impl ReadView {
    pub fn read(txn_id: Timestamp, start_ts: Timestamp, command_id: CommandId, view: View) -> Self {
        Self {
            txn_id,
            start_ts,
            command_id,
            view,
            for_write: false,
        }
    }

    pub fn write(txn_id: Timestamp, start_ts: Timestamp, command_id: CommandId) -> Self {
        Self {
            txn_id,
            start_ts,
            command_id,
            view: View::New,
            for_write: true,
        }
    }
}

/// The newest version of an entity plus its stamp: a commit timestamp once
/// the writer committed, or the writer's transaction id while uncommitted.
#[derive(Debug)]
pub(crate) struct CurrentVersion<D> {
    pub data: D,
    pub commit_ts: Timestamp,
}

/// Maintains the version history of an entity.
#[derive(Debug)]
pub(crate) struct VersionChain<D> {
    /// The latest version in memory.
    pub current: RwLock<CurrentVersion<D>>,
    /// Head of the undo chain; always points at the entry undoing the
    /// newest change.
    pub undo_ptr: RwLock<UndoPtr>,
}

impl<D: Clone> VersionChain<D> {
    fn new(data: D, commit_ts: Timestamp) -> Self {
        Self {
            current: RwLock::new(CurrentVersion { data, commit_ts }),
            undo_ptr: RwLock::new(Weak::new()),
        }
    }

    /// Reconstructs the version of the entity visible to `rv`, applying
    /// undo entries newest-first until the restored version belongs to the
    /// reader's snapshot.
    pub(crate) fn reconstruct(&self, rv: &ReadView, apply: impl Fn(&mut D, &Delta)) -> D {
        let (mut data, mut ts) = {
            let current = self.current.read().unwrap();
            (current.data.clone(), current.commit_ts)
        };
        let mut undo = self.undo_ptr.read().unwrap().clone();

        // Phase 1: the newest changes are the reader's own. Undo the ones
        // this view must not see: everything for View::Old, and the current
        // (for reads) or later (for writes) commands for View::New.
        if ts == rv.txn_id {
            loop {
                let Some(entry) = undo.upgrade() else {
                    return data;
                };
                if entry.txn_id() != rv.txn_id {
                    // The chain head no longer matches the stamp; treat the
                    // reconstructed state as visible.
                    return data;
                }
                let undo_own = match rv.view {
                    View::Old => true,
                    View::New => {
                        if rv.for_write {
                            entry.command_id() > rv.command_id
                        } else {
                            entry.command_id() >= rv.command_id
                        }
                    }
                };
                if !undo_own {
                    // An own change from an earlier command: visible as-is.
                    return data;
                }
                apply(&mut data, entry.delta());
                ts = entry.timestamp();
                undo = entry.next();
                if ts != rv.txn_id {
                    break;
                }
            }
        }

        // Phase 2: foreign versions. A state stamped with a commit ts at or
        // before the reader's start is the visible one; anything newer or
        // still uncommitted is undone.
        while ts.is_txn_id() || ts > rv.start_ts {
            let Some(entry) = undo.upgrade() else {
                break;
            };
            apply(&mut data, entry.delta());
            ts = entry.timestamp();
            undo = entry.next();
        }
        data
    }
}

/// A versioned vertex held by the shard's primary-key container.
#[derive(Debug, Clone)]
pub(crate) struct VersionedVertex {
    pub chain: Arc<VersionChain<Vertex>>,
}

impl VersionedVertex {
    /// A committed version, used by recovery and split installation.
    pub fn committed(vertex: Vertex, commit_ts: Timestamp) -> Self {
        Self {
            chain: Arc::new(VersionChain::new(vertex, commit_ts)),
        }
    }

    /// A free slot: a tombstone that never existed. Creates treat it
    /// exactly like a committed deletion, so fresh inserts and re-creates
    /// share one code path.
    pub fn vacant(pk: crate::model::PrimaryKey) -> Self {
        Self {
            chain: Arc::new(VersionChain::new(
                Vertex::placeholder(pk),
                Timestamp::ZERO,
            )),
        }
    }

    /// The vertex state visible to `rv`, including its tombstone flag.
    pub fn reconstruct(&self, rv: &ReadView) -> Vertex {
        self.chain.reconstruct(rv, |v, d| d.apply_to_vertex(v))
    }

    /// The visible vertex, or `None` when deleted or never created for
    /// this reader.
    pub fn read(&self, rv: &ReadView) -> Option<Vertex> {
        let vertex = self.reconstruct(rv);
        (!vertex.is_tombstone()).then_some(vertex)
    }
}

/// A versioned edge held by the shard's edge container.
#[derive(Debug, Clone)]
pub(crate) struct VersionedEdge {
    pub chain: Arc<VersionChain<Edge>>,
}

impl VersionedEdge {
    pub fn committed(edge: Edge, commit_ts: Timestamp) -> Self {
        Self {
            chain: Arc::new(VersionChain::new(edge, commit_ts)),
        }
    }

    pub fn vacant(key: &crate::model::EdgeKey, src_label: tessera_common::types::LabelId) -> Self {
        Self {
            chain: Arc::new(VersionChain::new(
                Edge::placeholder(key, src_label),
                Timestamp::ZERO,
            )),
        }
    }

    pub fn reconstruct(&self, rv: &ReadView) -> Edge {
        self.chain.reconstruct(rv, |e, d| d.apply_to_edge(e))
    }

    pub fn read(&self, rv: &ReadView) -> Option<Edge> {
        let edge = self.reconstruct(rv);
        (!edge.is_tombstone()).then_some(edge)
    }
}

/// Rejects a write when the object's newest version belongs to another
/// live transaction or committed after this transaction started.
pub(crate) fn check_write_conflict(
    commit_ts: Timestamp,
    txn_id: Timestamp,
    start_ts: Timestamp,
) -> StorageResult<()> {
    if commit_ts.is_txn_id() && commit_ts != txn_id {
        return Err(StorageError::Serialization(format!(
            "object is being modified by transaction {:?}",
            commit_ts
        )));
    }
    if commit_ts.is_commit_ts() && commit_ts > start_ts {
        return Err(StorageError::Serialization(format!(
            "object version committed at {:?} is newer than the snapshot",
            commit_ts
        )));
    }
    Ok(())
}

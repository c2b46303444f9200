//! The per-shard transaction: identity, command counter, undo/redo
//! buffers, and the commit/abort paths.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use tessera_common::types::CommandId;
use tessera_transaction::{IsolationLevel, Timestamp, Transaction, TxnState};

use super::Shard;
use super::index::{IndexOp, abort_index_op, commit_index_op};
use super::mvcc::{ReadView, View};
use crate::delta::{Delta, DeltaTarget, UndoEntry};
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::wal::{Operation, RedoEntry, ShardWal};

pub struct ShardTransaction {
    /// The owning shard. Weak: the active-transaction registry holds the
    /// transaction, not the other way around.
    shard: Weak<Shard>,

    isolation_level: IsolationLevel,

    // ---- Timestamp management ----
    start_ts: Timestamp,
    txn_id: Timestamp,
    commit_ts: OnceLock<Timestamp>,

    /// Current command. Mutations record the command that produced them;
    /// reads see effects of strictly earlier commands.
    command_id: AtomicU32,

    state: RwLock<TxnState>,

    // ---- Undo log: the transaction owns its deltas ----
    pub(crate) undo_buffer: RwLock<Vec<Arc<UndoEntry>>>,

    // ---- Index entries touched, for commit stamping / abort unwinding ----
    pub(crate) index_log: RwLock<Vec<IndexOp>>,

    // ---- Redo log buffered until commit ----
    pub(crate) redo_buffer: RwLock<Vec<RedoEntry>>,

    /// Set once the transaction was committed or aborted; the Drop guard
    /// aborts anything left unhandled.
    is_handled: AtomicBool,
}

impl Transaction for ShardTransaction {
    type Error = StorageError;

    fn txn_id(&self) -> Timestamp {
        self.txn_id
    }

    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts.get().copied()
    }

    fn command_id(&self) -> CommandId {
        self.command_id.load(Ordering::Acquire)
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn commit(&self) -> Result<Timestamp, Self::Error> {
        self.commit_at(None, false)
    }

    fn abort(&self) -> Result<(), Self::Error> {
        self.rollback()
    }
}

impl ShardTransaction {
    pub(crate) fn with_shard(
        shard: Weak<Shard>,
        txn_id: Timestamp,
        start_ts: Timestamp,
        isolation_level: IsolationLevel,
    ) -> Self {
        Self {
            shard,
            isolation_level,
            start_ts,
            txn_id,
            commit_ts: OnceLock::new(),
            command_id: AtomicU32::new(0),
            state: RwLock::new(TxnState::Active),
            undo_buffer: RwLock::new(Vec::new()),
            index_log: RwLock::new(Vec::new()),
            redo_buffer: RwLock::new(Vec::new()),
            is_handled: AtomicBool::new(false),
        }
    }

    /// Rebuilds an in-progress transaction on a split successor: same
    /// identity and command counter, carrying exactly the deltas whose
    /// targets moved to that successor.
    pub(crate) fn resume(
        shard: Weak<Shard>,
        txn_id: Timestamp,
        start_ts: Timestamp,
        command_id: CommandId,
        isolation_level: IsolationLevel,
        undo_buffer: Vec<Arc<UndoEntry>>,
        index_log: Vec<IndexOp>,
    ) -> Self {
        Self {
            shard,
            isolation_level,
            start_ts,
            txn_id,
            commit_ts: OnceLock::new(),
            command_id: AtomicU32::new(command_id),
            state: RwLock::new(TxnState::Active),
            undo_buffer: RwLock::new(undo_buffer),
            index_log: RwLock::new(index_log),
            redo_buffer: RwLock::new(Vec::new()),
            is_handled: AtomicBool::new(false),
        }
    }

    /// Rebuilds a committed transaction's record on a split successor so
    /// the moved delta chains stay reachable for GC.
    pub(crate) fn resume_committed(
        shard: Weak<Shard>,
        txn_id: Timestamp,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        undo_buffer: Vec<Arc<UndoEntry>>,
        index_log: Vec<IndexOp>,
    ) -> Self {
        let txn = Self::resume(
            shard,
            txn_id,
            start_ts,
            0,
            IsolationLevel::Snapshot,
            undo_buffer,
            index_log,
        );
        let _ = txn.commit_ts.set(commit_ts);
        *txn.state.write().unwrap() = TxnState::Committed;
        txn.is_handled.store(true, Ordering::Release);
        txn
    }

    pub fn state(&self) -> TxnState {
        *self.state.read().unwrap()
    }

    /// Increments the command id; later reads observe the effects of all
    /// commands before the new one.
    pub fn advance_command(&self) -> CommandId {
        self.command_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn read_view(&self, view: View) -> ReadView {
        ReadView::read(self.txn_id, self.start_ts, self.command_id(), view)
    }

    pub(crate) fn write_view(&self) -> ReadView {
        ReadView::write(self.txn_id, self.start_ts, self.command_id())
    }

    fn ensure_active(&self) -> StorageResult<()> {
        match self.state() {
            TxnState::Active => Ok(()),
            other => Err(StorageError::Transaction(TransactionError::InvalidState(
                format!("transaction {:?} is {:?}", self.txn_id, other),
            ))),
        }
    }

    /// Marks the transaction as handled, preventing the automatic rollback
    /// in the Drop implementation.
    pub fn mark_handled(&self) {
        self.is_handled.store(true, Ordering::Release);
    }

    /// Commits the transaction. `commit_ts` may be supplied by a
    /// coordinator; otherwise the shard's clock assigns the next reading.
    /// All deltas of the transaction share the single assigned timestamp.
    pub fn commit_at(
        &self,
        commit_ts: Option<Timestamp>,
        skip_wal: bool,
    ) -> StorageResult<Timestamp> {
        self.ensure_active()?;
        let shard = self.shard.upgrade().ok_or_else(|| {
            StorageError::Transaction(TransactionError::InvalidState(
                "shard is no longer available".to_string(),
            ))
        })?;

        // Serialize commits: the commit latch makes timestamp assignment
        // and stamping atomic per shard.
        let _guard = shard.txn_manager().commit_latch();

        let commit_ts = match commit_ts {
            Some(ts) => {
                if ts <= self.start_ts {
                    return Err(StorageError::Timestamp(
                        tessera_transaction::TimestampError::NonMonotonicCommit {
                            start: self.start_ts.raw(),
                            commit: ts.raw(),
                        },
                    ));
                }
                shard.hlc().update_if_greater(ts)?;
                ts
            }
            None => shard.hlc().next()?,
        };

        self.commit_ts.set(commit_ts).map_err(|_| {
            StorageError::Transaction(TransactionError::AlreadyCommitted(format!(
                "{:?}",
                self.txn_id
            )))
        })?;

        // Install the commit timestamp on every version this transaction
        // produced.
        {
            let undo_entries = self.undo_buffer.read().unwrap();
            for entry in undo_entries.iter() {
                match entry.target() {
                    DeltaTarget::Vertex(pk) => {
                        if let Some(slot) = shard.vertices().get(pk) {
                            let mut current = slot.value().chain.current.write().unwrap();
                            if current.commit_ts == self.txn_id {
                                current.commit_ts = commit_ts;
                            }
                        }
                    }
                    DeltaTarget::Edge(key) => {
                        if let Some(slot) = shard.edges().get(key) {
                            let mut current = slot.value().chain.current.write().unwrap();
                            if current.commit_ts == self.txn_id {
                                current.commit_ts = commit_ts;
                            }
                        }
                    }
                }
            }
        }

        // Install the commit timestamp on every index entry touched.
        {
            let index_log = self.index_log.read().unwrap();
            for op in index_log.iter() {
                commit_index_op(
                    shard.label_index(),
                    shard.label_property_index(),
                    op,
                    self.txn_id,
                    commit_ts,
                );
            }
        }

        // Flush the transaction as one contiguous WAL run: begin marker,
        // buffered redo records, commit marker. Aborted transactions never
        // reach the log at all.
        if !skip_wal {
            if let Some(wal_manager) = shard.wal_manager() {
                let mut wal = wal_manager.wal().write().unwrap();
                wal.append(&RedoEntry {
                    lsn: wal_manager.next_lsn(),
                    txn_id: self.txn_id,
                    op: Operation::Begin {
                        start_ts: self.start_ts,
                    },
                })?;
                let redo_entries: Vec<_> = self
                    .redo_buffer
                    .write()
                    .unwrap()
                    .drain(..)
                    .map(|mut entry| {
                        entry.lsn = wal_manager.next_lsn();
                        entry
                    })
                    .collect();
                for entry in &redo_entries {
                    wal.append(entry)?;
                }
                wal.append(&RedoEntry {
                    lsn: wal_manager.next_lsn(),
                    txn_id: self.txn_id,
                    op: Operation::Commit { commit_ts },
                })?;
                wal.flush()?;
            }
        }

        *self.state.write().unwrap() = TxnState::Committed;
        shard.txn_manager().record_commit(commit_ts);
        shard.txn_manager().finish_transaction_inner(self)?;
        self.is_handled.store(true, Ordering::Release);

        Ok(commit_ts)
    }

    /// Aborts the transaction: walks its deltas newest-first, reversing
    /// each, then unwinds touched index entries.
    pub fn rollback(&self) -> StorageResult<()> {
        self.ensure_active()?;
        let Some(shard) = self.shard.upgrade() else {
            // The shard is gone; nothing left to restore.
            self.is_handled.store(true, Ordering::Release);
            *self.state.write().unwrap() = TxnState::Aborted;
            return Ok(());
        };

        let undo_entries: Vec<_> = self.undo_buffer.write().unwrap().drain(..).collect();
        let now = shard.hlc().current();

        for entry in undo_entries.iter().rev() {
            match entry.target() {
                DeltaTarget::Vertex(pk) => {
                    if let Some(slot) = shard.vertices().get(pk) {
                        let chain = &slot.value().chain;
                        let mut current = chain.current.write().unwrap();
                        if current.commit_ts == self.txn_id {
                            entry.delta().apply_to_vertex(&mut current.data);
                            current.commit_ts = entry.timestamp();
                            *chain.undo_ptr.write().unwrap() = entry.next();
                        }
                    }
                    // A reverted fresh create leaves a vacant tombstone slot
                    // for GC to reclaim.
                    if matches!(entry.delta(), Delta::DeleteObject)
                        && entry.timestamp() == Timestamp::ZERO
                    {
                        shard.txn_manager().defer_vertex_removal(pk.clone(), now);
                    }
                }
                DeltaTarget::Edge(key) => {
                    if let Some(slot) = shard.edges().get(key) {
                        let chain = &slot.value().chain;
                        let mut current = chain.current.write().unwrap();
                        if current.commit_ts == self.txn_id {
                            entry.delta().apply_to_edge(&mut current.data);
                            current.commit_ts = entry.timestamp();
                            *chain.undo_ptr.write().unwrap() = entry.next();
                        }
                    }
                    if matches!(entry.delta(), Delta::DeleteObject)
                        && entry.timestamp() == Timestamp::ZERO
                    {
                        shard.txn_manager().defer_edge_removal(key.clone(), now);
                    }
                }
            }
        }

        // Unwind index entries, newest-first.
        {
            let mut index_log = self.index_log.write().unwrap();
            for op in index_log.iter().rev() {
                abort_index_op(
                    shard.label_index(),
                    shard.label_property_index(),
                    op,
                    self.txn_id,
                );
            }
            index_log.clear();
        }

        // Nothing of this transaction was persisted; dropping the buffered
        // redo records is the whole of the WAL-side rollback.
        self.redo_buffer.write().unwrap().clear();

        *self.state.write().unwrap() = TxnState::Aborted;
        shard.txn_manager().finish_transaction_inner(self)?;
        self.is_handled.store(true, Ordering::Release);

        Ok(())
    }
}

impl Drop for ShardTransaction {
    fn drop(&mut self) {
        // An unhandled transaction rolls back; errors are ignored in Drop.
        if !self.is_handled.load(Ordering::Acquire) {
            let _ = self.rollback();
        }
    }
}

//! Common transaction infrastructure for the tessera storage engine.
//!
//! Shared timestamp, undo-entry, and transaction-lifecycle types used by the
//! per-shard store and the cluster layer.

use std::sync::Weak;

use tessera_common::types::CommandId;

pub mod error;
pub mod manager;
pub mod timestamp;
pub mod transaction;

pub use error::TimestampError;
pub use manager::TxnManager;
pub use timestamp::{HybridLogicalClock, Timestamp, TransactionIdGenerator};
pub use transaction::{IsolationLevel, Transaction, TxnState};

/// A generic undo log entry for multi-version concurrency control.
///
/// `D` is the delta payload (the inverse of the applied change); `T` is the
/// handle of the object the delta undoes — the back-pointer that lets
/// commit stamping, abort, split partitioning, and GC find the owning
/// record without reference cycles.
#[derive(Debug)]
pub struct UndoEntry<D, T> {
    /// The delta operation of the undo entry.
    delta: D,
    /// Handle of the object this entry undoes.
    target: T,
    /// Commit timestamp of the version this entry restores
    /// ([`Timestamp::ZERO`] when the object did not exist before).
    timestamp: Timestamp,
    /// Id of the transaction that produced the entry.
    txn_id: Timestamp,
    /// Command within the producing transaction.
    command_id: CommandId,
    /// Next (older) undo entry on the same object's chain.
    next: UndoPtr<D, T>,
}

/// Weak pointer to an undo entry; chains never keep versions alive on their
/// own — the producing transaction's buffer does.
pub type UndoPtr<D, T> = Weak<UndoEntry<D, T>>;

impl<D, T> UndoEntry<D, T> {
    pub fn new(
        delta: D,
        target: T,
        timestamp: Timestamp,
        txn_id: Timestamp,
        command_id: CommandId,
        next: UndoPtr<D, T>,
    ) -> Self {
        Self {
            delta,
            target,
            timestamp,
            txn_id,
            command_id,
            next,
        }
    }

    /// The delta operation of the undo entry.
    pub fn delta(&self) -> &D {
        &self.delta
    }

    /// Handle of the object this entry undoes.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Commit timestamp of the version this entry restores.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Id of the transaction that produced the entry.
    pub fn txn_id(&self) -> Timestamp {
        self.txn_id
    }

    /// Command within the producing transaction.
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// The next (older) undo entry on the chain.
    pub fn next(&self) -> UndoPtr<D, T> {
        self.next.clone()
    }
}

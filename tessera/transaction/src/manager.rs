//! Transaction manager trait: lifecycle, watermark, garbage collection.

use std::sync::Arc;

use crate::timestamp::Timestamp;
use crate::transaction::{IsolationLevel, Transaction};

/// Trait for per-store transaction managers supporting MVCC.
///
/// Timestamp and transaction-id generation is owned by whoever constructs
/// the manager; implementations receive their clock and id source as
/// explicit dependencies.
pub trait TxnManager {
    /// The transaction type this manager handles.
    type Transaction: Transaction + Send + Sync;
    /// The store context type garbage collection operates on.
    type Context;
    /// The error type for operations.
    type Error;

    /// Open a transaction at `start_ts` (or at the clock's next reading
    /// when `None`). An already-active transaction with the same start
    /// timestamp is reused, so a router can re-enter a transaction after a
    /// shard split.
    fn access(
        &self,
        start_ts: Option<Timestamp>,
        isolation: IsolationLevel,
    ) -> Result<Arc<Self::Transaction>, Self::Error>;

    /// Unregister a transaction when it completes (commits or aborts),
    /// updating the watermark.
    fn finish_transaction(&self, txn: &Self::Transaction) -> Result<(), Self::Error>;

    /// Reclaim version records and deleted objects no longer visible to any
    /// live transaction. `now` tags deferred deletions.
    fn garbage_collect(&self, ctx: &Self::Context, now: Timestamp) -> Result<(), Self::Error>;

    /// The minimum start timestamp of the active transactions, or the
    /// latest commit timestamp when none are active. The GC horizon.
    fn low_watermark(&self) -> Timestamp;
}

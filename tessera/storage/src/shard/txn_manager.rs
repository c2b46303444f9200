//! Per-shard transaction registry: active and committed transactions, the
//! commit latch, the GC watermark, and the garbage collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_skiplist::SkipMap;
use tessera_transaction::{IsolationLevel, Timestamp, Transaction, TxnManager};
use tracing::debug;

use super::Shard;
use super::index::IndexOp;
use super::transaction::ShardTransaction;
use crate::delta::{Delta, DeltaTarget};
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::model::{EdgeKey, PrimaryKey};

/// Reclaim committed transactions eagerly once this many pile up.
const GC_TRIGGER_THRESHOLD: usize = 64;

/// One reclamation postponed until the watermark passes its tag.
#[derive(Debug)]
struct DeferredDelete {
    tag: Timestamp,
    op: DeferredOp,
}

#[derive(Debug)]
enum DeferredOp {
    Vertex(PrimaryKey),
    Edge(EdgeKey),
    LabelEntry(super::index::LabelIndexKey),
    PropEntry(super::index::LabelPropertyIndexKey),
}

/// Manages the transactions of one shard.
pub struct ShardTxnManager {
    /// Weak reference to the shard to avoid a reference cycle.
    shard: Weak<Shard>,
    /// Active transactions, keyed by start timestamp so `access` can reuse
    /// an in-progress transaction and the watermark falls out of the front
    /// entry.
    pub(crate) active_txns: SkipMap<Timestamp, Arc<ShardTransaction>>,
    /// Committed transactions keyed by commit timestamp: the shard's
    /// commit log. Entries are reclaimed by GC once they sink below the
    /// watermark.
    pub(crate) committed_txns: SkipMap<Timestamp, Arc<ShardTransaction>>,
    /// Commit latch enforcing serial commit order.
    commit_lock: Mutex<()>,
    latest_commit_ts: AtomicU64,
    /// Min start ts of the active transactions, else the latest commit ts.
    watermark: AtomicU64,
    last_gc_ts: AtomicU64,
    deferred: Mutex<Vec<DeferredDelete>>,
}

impl TxnManager for ShardTxnManager {
    type Transaction = ShardTransaction;
    type Context = Shard;
    type Error = StorageError;

    fn access(
        &self,
        start_ts: Option<Timestamp>,
        isolation: IsolationLevel,
    ) -> StorageResult<Arc<ShardTransaction>> {
        self.access_inner(start_ts, isolation)
    }

    fn finish_transaction(&self, txn: &ShardTransaction) -> StorageResult<()> {
        self.finish_transaction_inner(txn)
    }

    fn garbage_collect(&self, ctx: &Shard, now: Timestamp) -> StorageResult<()> {
        self.collect_garbage(ctx, now)
    }

    fn low_watermark(&self) -> Timestamp {
        Timestamp::with_ts(self.watermark.load(Ordering::Acquire))
    }
}

impl ShardTxnManager {
    pub(crate) fn new(shard: Weak<Shard>) -> Self {
        Self {
            shard,
            active_txns: SkipMap::new(),
            committed_txns: SkipMap::new(),
            commit_lock: Mutex::new(()),
            latest_commit_ts: AtomicU64::new(0),
            watermark: AtomicU64::new(0),
            last_gc_ts: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn commit_latch(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap()
    }

    /// Opens a transaction at `start_ts`, or at the clock's next reading.
    /// An active transaction with the same start timestamp is reused; this
    /// is how a transaction continues on a split successor.
    fn access_inner(
        &self,
        start_ts: Option<Timestamp>,
        isolation: IsolationLevel,
    ) -> StorageResult<Arc<ShardTransaction>> {
        let shard = self.shard.upgrade().ok_or_else(|| {
            StorageError::Transaction(TransactionError::InvalidState(
                "shard is no longer available".to_string(),
            ))
        })?;
        let start_ts = match start_ts {
            Some(ts) => {
                if let Some(existing) = self.active_txns.get(&ts) {
                    return Ok(existing.value().clone());
                }
                shard.hlc().update_if_greater(ts)?;
                ts
            }
            None => shard.hlc().next()?,
        };

        let txn_id = shard.txn_ids().next()?;
        let txn = Arc::new(ShardTransaction::with_shard(
            Arc::downgrade(&shard),
            txn_id,
            start_ts,
            isolation,
        ));
        self.active_txns.insert(start_ts, txn.clone());
        self.update_watermark();
        Ok(txn)
    }

    /// Registers a transaction rebuilt from split data.
    pub(crate) fn adopt(&self, txn: Arc<ShardTransaction>) {
        self.active_txns.insert(txn.start_ts(), txn);
        self.update_watermark();
    }

    /// Registers a committed transaction carried over by a split, so its
    /// undo entries stay reachable for GC.
    pub(crate) fn adopt_committed(&self, txn: Arc<ShardTransaction>) {
        if let Some(commit_ts) = txn.commit_ts() {
            self.committed_txns.insert(commit_ts, txn);
            self.latest_commit_ts
                .fetch_max(commit_ts.raw(), Ordering::SeqCst);
        }
    }

    /// Removes a finished transaction from the active set; committed
    /// transactions move to the commit log.
    pub(crate) fn finish_transaction_inner(&self, txn: &ShardTransaction) -> StorageResult<()> {
        let entry = self.active_txns.remove(&txn.start_ts());
        let Some(entry) = entry else {
            return Err(StorageError::Transaction(TransactionError::NotFound(
                format!("{:?}", txn.txn_id()),
            )));
        };
        if let Some(commit_ts) = txn.commit_ts() {
            self.committed_txns.insert(commit_ts, entry.value().clone());
        }
        self.update_watermark();

        if self.committed_txns.len() >= GC_TRIGGER_THRESHOLD {
            if let Some(shard) = self.shard.upgrade() {
                let now = shard.hlc().current();
                self.collect_garbage(&shard, now)?;
            }
        }
        Ok(())
    }

    pub(crate) fn record_commit(&self, commit_ts: Timestamp) {
        self.latest_commit_ts
            .fetch_max(commit_ts.raw(), Ordering::SeqCst);
    }

    /// The shard's commit log: commit timestamps still retained, in order.
    pub fn commit_log(&self) -> Vec<Timestamp> {
        self.committed_txns.iter().map(|e| *e.key()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_txns.len()
    }

    pub fn latest_commit_ts(&self) -> Timestamp {
        Timestamp::with_ts(self.latest_commit_ts.load(Ordering::Acquire))
    }

    /// The minimum start timestamp of the active transactions; when none
    /// are active, the latest commit timestamp. Never moves backwards.
    pub fn low_watermark(&self) -> Timestamp {
        Timestamp::with_ts(self.watermark.load(Ordering::Acquire))
    }

    pub(crate) fn update_watermark(&self) {
        let min_ts = self
            .active_txns
            .front()
            .map(|e| e.value().start_ts().raw())
            .unwrap_or_else(|| self.latest_commit_ts.load(Ordering::Acquire))
            .max(self.watermark.load(Ordering::Acquire));
        self.watermark.store(min_ts, Ordering::SeqCst);
    }

    pub(crate) fn defer_vertex_removal(&self, pk: PrimaryKey, tag: Timestamp) {
        self.deferred.lock().unwrap().push(DeferredDelete {
            tag,
            op: DeferredOp::Vertex(pk),
        });
    }

    pub(crate) fn defer_edge_removal(&self, key: EdgeKey, tag: Timestamp) {
        self.deferred.lock().unwrap().push(DeferredDelete {
            tag,
            op: DeferredOp::Edge(key),
        });
    }

    /// Reclaims everything no live transaction can reach:
    ///
    /// 1. Deferred deletions whose tag sank below the watermark are freed.
    /// 2. Committed transactions older than the watermark are scanned:
    ///    objects they tombstoned and index entries they expired join the
    ///    deferred buffer tagged `now`, then the transaction records are
    ///    dropped, releasing their undo buffers (and with them the chain
    ///    tails, which are only weakly linked).
    pub fn collect_garbage(&self, shard: &Shard, now: Timestamp) -> StorageResult<()> {
        let watermark = self.low_watermark();

        // Phase 1: free deferred deletions that every live transaction has
        // moved past.
        let ready: Vec<DeferredDelete> = {
            let mut deferred = self.deferred.lock().unwrap();
            let (ready, pending): (Vec<_>, Vec<_>) =
                deferred.drain(..).partition(|d| d.tag < watermark);
            *deferred = pending;
            ready
        };
        let freed = ready.len();
        for deferred in ready {
            match deferred.op {
                DeferredOp::Vertex(pk) => {
                    let reclaimable = shard.vertices().get(&pk).is_some_and(|slot| {
                        let current = slot.value().chain.current.read().unwrap();
                        current.data.is_tombstone()
                            && current.commit_ts.is_commit_ts()
                            && current.commit_ts < watermark
                    });
                    if reclaimable {
                        shard.vertices().remove(&pk);
                    }
                }
                DeferredOp::Edge(key) => {
                    let reclaimable = shard.edges().get(&key).is_some_and(|slot| {
                        let current = slot.value().chain.current.read().unwrap();
                        current.data.is_tombstone()
                            && current.commit_ts.is_commit_ts()
                            && current.commit_ts < watermark
                    });
                    if reclaimable {
                        shard.edges().remove(&key);
                    }
                }
                DeferredOp::LabelEntry(key) => {
                    let reclaimable = shard.label_index().entries.get(&key).is_some_and(|e| {
                        let (_, expired) = e.value().stamps();
                        expired.is_commit_ts()
                            && expired != Timestamp::ZERO
                            && expired < watermark
                    });
                    if reclaimable {
                        shard.label_index().entries.remove(&key);
                    }
                }
                DeferredOp::PropEntry(key) => {
                    let reclaimable = shard
                        .label_property_index()
                        .entries
                        .get(&key)
                        .is_some_and(|e| {
                            let (_, expired) = e.value().stamps();
                            expired.is_commit_ts()
                                && expired != Timestamp::ZERO
                                && expired < watermark
                        });
                    if reclaimable {
                        shard.label_property_index().entries.remove(&key);
                    }
                }
            }
        }

        // Phase 2: retire committed transactions below the watermark.
        let mut expired_txns = Vec::new();
        for entry in self.committed_txns.iter() {
            if entry.key().raw() >= watermark.raw() {
                break;
            }
            expired_txns.push(entry.value().clone());
        }

        for txn in &expired_txns {
            for undo in txn.undo_buffer.read().unwrap().iter() {
                if matches!(undo.delta(), Delta::RecreateObject(_)) {
                    // The transaction deleted this object; its tombstone is
                    // now committed and below the watermark.
                    match undo.target() {
                        DeltaTarget::Vertex(pk) => {
                            self.defer_vertex_removal(pk.clone(), now);
                        }
                        DeltaTarget::Edge(key) => {
                            self.defer_edge_removal(key.clone(), now);
                        }
                    }
                }
            }
            let mut deferred = self.deferred.lock().unwrap();
            for op in txn.index_log.read().unwrap().iter() {
                match op {
                    IndexOp::LabelExpired(key) => deferred.push(DeferredDelete {
                        tag: now,
                        op: DeferredOp::LabelEntry(key.clone()),
                    }),
                    IndexOp::PropExpired(key) => deferred.push(DeferredDelete {
                        tag: now,
                        op: DeferredOp::PropEntry(key.clone()),
                    }),
                    _ => {}
                }
            }
        }

        let reclaimed = expired_txns.len();
        for txn in expired_txns {
            if let Some(commit_ts) = txn.commit_ts() {
                self.committed_txns.remove(&commit_ts);
            }
        }

        if freed > 0 || reclaimed > 0 {
            debug!(
                shard = %shard.uuid(),
                watermark = watermark.raw(),
                freed,
                reclaimed,
                "garbage collection pass"
            );
        }
        self.last_gc_ts.store(now.raw(), Ordering::SeqCst);
        Ok(())
    }
}

//! Secondary indexes: label index and label-property index.
//!
//! Entries are ordered sets keyed by `(label, pk)` and `(label, property,
//! value, pk)` with per-entry visibility timestamps. Maintenance is
//! synchronous with the mutating operation; the transaction's index-op log
//! lets commit stamp entries with the commit HLC and abort unwind them.
//! Readers treat the vertex itself as authoritative (entries are lazily
//! filtered at read time), so the timestamps only need to be good enough
//! for stamping, unwinding, and GC.

use std::collections::BTreeSet;
use std::sync::RwLock;

use crossbeam_skiplist::SkipMap;
use tessera_common::types::{LabelId, PropertyId};
use tessera_common::value::PropertyValue;
use tessera_transaction::Timestamp;

use crate::model::PrimaryKey;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LabelIndexKey {
    pub label: LabelId,
    pub pk: PrimaryKey,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LabelPropertyIndexKey {
    pub label: LabelId,
    pub property: PropertyId,
    pub value: PropertyValue,
    pub pk: PrimaryKey,
}

/// Visibility stamps of one index entry. `created` starts as the writer's
/// transaction id and is stamped with the commit HLC; `expired` is ZERO
/// while the entry is live.
#[derive(Debug)]
pub(crate) struct IndexEntryMeta {
    pub created: RwLock<Timestamp>,
    pub expired: RwLock<Timestamp>,
}

impl IndexEntryMeta {
    fn new(created: Timestamp) -> Self {
        Self::with_stamps(created, Timestamp::ZERO)
    }

    /// Rebuilds an entry with known stamps (split installation).
    pub(crate) fn with_stamps(created: Timestamp, expired: Timestamp) -> Self {
        Self {
            created: RwLock::new(created),
            expired: RwLock::new(expired),
        }
    }

    pub fn stamps(&self) -> (Timestamp, Timestamp) {
        (
            *self.created.read().unwrap(),
            *self.expired.read().unwrap(),
        )
    }
}

/// One recorded index mutation, kept in the transaction's index-op log.
#[derive(Debug, Clone)]
pub(crate) enum IndexOp {
    LabelCreated(LabelIndexKey),
    LabelExpired(LabelIndexKey),
    /// An existing (expired) entry was brought back by re-adding the label;
    /// abort must restore the previous expiration.
    LabelReinstated {
        key: LabelIndexKey,
        previous_expired: Timestamp,
    },
    PropCreated(LabelPropertyIndexKey),
    PropExpired(LabelPropertyIndexKey),
    PropReinstated {
        key: LabelPropertyIndexKey,
        previous_expired: Timestamp,
    },
}

/// Ordered set of `(label, vertex)` entries.
#[derive(Debug, Default)]
pub(crate) struct LabelIndex {
    pub registered: RwLock<BTreeSet<LabelId>>,
    pub entries: SkipMap<LabelIndexKey, IndexEntryMeta>,
}

/// Ordered set of `(label, property, value, vertex)` entries.
#[derive(Debug, Default)]
pub(crate) struct LabelPropertyIndex {
    pub registered: RwLock<BTreeSet<(LabelId, PropertyId)>>,
    pub entries: SkipMap<LabelPropertyIndexKey, IndexEntryMeta>,
}

impl LabelIndex {
    pub fn is_registered(&self, label: LabelId) -> bool {
        self.registered.read().unwrap().contains(&label)
    }

    pub fn register(&self, label: LabelId) -> bool {
        self.registered.write().unwrap().insert(label)
    }

    pub fn unregister(&self, label: LabelId) -> bool {
        let removed = self.registered.write().unwrap().remove(&label);
        if removed {
            let stale: Vec<_> = self
                .entries
                .iter()
                .filter(|e| e.key().label == label)
                .map(|e| e.key().clone())
                .collect();
            for key in stale {
                self.entries.remove(&key);
            }
        }
        removed
    }

    /// Inserts or reinstates an entry; returns the op to log.
    pub fn insert(&self, key: LabelIndexKey, txn_id: Timestamp) -> IndexOp {
        if let Some(entry) = self.entries.get(&key) {
            let previous = *entry.value().expired.read().unwrap();
            *entry.value().expired.write().unwrap() = Timestamp::ZERO;
            IndexOp::LabelReinstated {
                key,
                previous_expired: previous,
            }
        } else {
            self.entries.insert(key.clone(), IndexEntryMeta::new(txn_id));
            IndexOp::LabelCreated(key)
        }
    }

    /// Marks an entry expired by `txn_id`; returns the op to log, or
    /// `None` when the entry does not exist (index created after the
    /// label was removed).
    pub fn expire(&self, key: LabelIndexKey, txn_id: Timestamp) -> Option<IndexOp> {
        let entry = self.entries.get(&key)?;
        *entry.value().expired.write().unwrap() = txn_id;
        Some(IndexOp::LabelExpired(key))
    }

    /// Installs an entry outside any transaction (index creation backfill,
    /// recovery, split installation).
    pub fn backfill(&self, key: LabelIndexKey, created: Timestamp) {
        self.entries.insert(key, IndexEntryMeta::new(created));
    }
}

impl LabelPropertyIndex {
    pub fn is_registered(&self, label: LabelId, property: PropertyId) -> bool {
        self.registered.read().unwrap().contains(&(label, property))
    }

    pub fn register(&self, label: LabelId, property: PropertyId) -> bool {
        self.registered.write().unwrap().insert((label, property))
    }

    pub fn unregister(&self, label: LabelId, property: PropertyId) -> bool {
        let removed = self.registered.write().unwrap().remove(&(label, property));
        if removed {
            let stale: Vec<_> = self
                .entries
                .iter()
                .filter(|e| e.key().label == label && e.key().property == property)
                .map(|e| e.key().clone())
                .collect();
            for key in stale {
                self.entries.remove(&key);
            }
        }
        removed
    }

    pub fn insert(&self, key: LabelPropertyIndexKey, txn_id: Timestamp) -> IndexOp {
        if let Some(entry) = self.entries.get(&key) {
            let previous = *entry.value().expired.read().unwrap();
            *entry.value().expired.write().unwrap() = Timestamp::ZERO;
            IndexOp::PropReinstated {
                key,
                previous_expired: previous,
            }
        } else {
            self.entries.insert(key.clone(), IndexEntryMeta::new(txn_id));
            IndexOp::PropCreated(key)
        }
    }

    pub fn expire(&self, key: LabelPropertyIndexKey, txn_id: Timestamp) -> Option<IndexOp> {
        let entry = self.entries.get(&key)?;
        *entry.value().expired.write().unwrap() = txn_id;
        Some(IndexOp::PropExpired(key))
    }

    /// Installs an entry outside any transaction (index creation backfill,
    /// recovery, split installation).
    pub fn backfill(&self, key: LabelPropertyIndexKey, created: Timestamp) {
        self.entries.insert(key, IndexEntryMeta::new(created));
    }
}

/// Stamps one logged op with the commit timestamp. Only stamps slots still
/// holding the committing transaction's id, so reinstated entries keep
/// their original creation stamp.
pub(crate) fn commit_index_op(
    labels: &LabelIndex,
    props: &LabelPropertyIndex,
    op: &IndexOp,
    txn_id: Timestamp,
    commit_ts: Timestamp,
) {
    match op {
        IndexOp::LabelCreated(key) => {
            if let Some(entry) = labels.entries.get(key) {
                let mut created = entry.value().created.write().unwrap();
                if *created == txn_id {
                    *created = commit_ts;
                }
            }
        }
        IndexOp::LabelExpired(key) => {
            if let Some(entry) = labels.entries.get(key) {
                let mut expired = entry.value().expired.write().unwrap();
                if *expired == txn_id {
                    *expired = commit_ts;
                }
            }
        }
        IndexOp::LabelReinstated { .. } => {}
        IndexOp::PropCreated(key) => {
            if let Some(entry) = props.entries.get(key) {
                let mut created = entry.value().created.write().unwrap();
                if *created == txn_id {
                    *created = commit_ts;
                }
            }
        }
        IndexOp::PropExpired(key) => {
            if let Some(entry) = props.entries.get(key) {
                let mut expired = entry.value().expired.write().unwrap();
                if *expired == txn_id {
                    *expired = commit_ts;
                }
            }
        }
        IndexOp::PropReinstated { .. } => {}
    }
}

/// Unwinds one logged op on abort: created entries are removed, expired
/// stamps are cleared, reinstated entries get their previous expiration
/// back.
pub(crate) fn abort_index_op(
    labels: &LabelIndex,
    props: &LabelPropertyIndex,
    op: &IndexOp,
    txn_id: Timestamp,
) {
    match op {
        IndexOp::LabelCreated(key) => {
            if let Some(entry) = labels.entries.get(key) {
                if *entry.value().created.read().unwrap() == txn_id {
                    labels.entries.remove(key);
                }
            }
        }
        IndexOp::LabelExpired(key) => {
            if let Some(entry) = labels.entries.get(key) {
                let mut expired = entry.value().expired.write().unwrap();
                if *expired == txn_id {
                    *expired = Timestamp::ZERO;
                }
            }
        }
        IndexOp::LabelReinstated {
            key,
            previous_expired,
        } => {
            if let Some(entry) = labels.entries.get(key) {
                *entry.value().expired.write().unwrap() = *previous_expired;
            }
        }
        IndexOp::PropCreated(key) => {
            if let Some(entry) = props.entries.get(key) {
                if *entry.value().created.read().unwrap() == txn_id {
                    props.entries.remove(key);
                }
            }
        }
        IndexOp::PropExpired(key) => {
            if let Some(entry) = props.entries.get(key) {
                let mut expired = entry.value().expired.write().unwrap();
                if *expired == txn_id {
                    *expired = Timestamp::ZERO;
                }
            }
        }
        IndexOp::PropReinstated {
            key,
            previous_expired,
        } => {
            if let Some(entry) = props.entries.get(key) {
                *entry.value().expired.write().unwrap() = *previous_expired;
            }
        }
    }
}

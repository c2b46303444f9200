//! Visibility-filtered scans over the shard: the full primary-key scan and
//! the index-backed variants.
//!
//! Index entries are candidates, not truth: every hit is verified against
//! the vertex reconstructed under the reader's snapshot, so stale entries
//! (expired, value since changed, writer uncommitted) fall out here.

use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::map::Entry;
use tessera_common::types::{LabelId, PropertyId};
use tessera_common::value::PropertyValue;

use super::Shard;
use super::index::{LabelIndexKey, LabelPropertyIndexKey};
use super::mvcc::{ReadView, VersionedVertex, View};
use super::transaction::ShardTransaction;
use crate::model::{Edge, PrimaryKey, Vertex};

type VertexFilter<'a> = Box<dyn Fn(&Vertex) -> bool + 'a>;

/// Iterator over all vertices visible to a transaction, in primary-key
/// order. Iteration is stable under concurrent inserts: a seen entry
/// remains walkable.
pub struct VertexIter<'a> {
    inner: Box<dyn Iterator<Item = Entry<'a, PrimaryKey, VersionedVertex>> + 'a>,
    rv: ReadView,
    filters: Vec<VertexFilter<'a>>,
}

impl<'a> VertexIter<'a> {
    /// Adds a filtering predicate (supports method chaining).
    pub fn filter_by<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Vertex) -> bool + 'a,
    {
        self.filters.push(Box::new(predicate));
        self
    }
}

impl Iterator for VertexIter<'_> {
    type Item = Vertex;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.inner.by_ref() {
            let Some(vertex) = entry.value().read(&self.rv) else {
                continue;
            };
            if self.filters.iter().all(|f| f(&vertex)) {
                return Some(vertex);
            }
        }
        None
    }
}

impl Shard {
    /// All visible vertices in primary-key order.
    pub fn vertices_iter<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        view: View,
    ) -> VertexIter<'a> {
        VertexIter {
            inner: Box::new(self.vertices.iter()),
            rv: txn.read_view(view),
            filters: Vec::new(),
        }
    }

    /// Visible vertices within a primary-key range, in key order.
    pub fn vertices_in_range<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        lo: Bound<PrimaryKey>,
        hi: Bound<PrimaryKey>,
        view: View,
    ) -> VertexIter<'a> {
        VertexIter {
            inner: Box::new(self.vertices.range((lo, hi))),
            rv: txn.read_view(view),
            filters: Vec::new(),
        }
    }

    /// All visible edges, in `(src, dst, type, gid)` order.
    pub fn edges_iter<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        view: View,
    ) -> impl Iterator<Item = Edge> + 'a {
        let rv = txn.read_view(view);
        self.edges
            .iter()
            .filter_map(move |entry| entry.value().read(&rv))
    }

    /// Vertices bearing a label, served from the label index.
    pub fn vertices_by_label<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        label: LabelId,
        view: View,
    ) -> impl Iterator<Item = Vertex> + 'a {
        let rv = txn.read_view(view);
        let start = LabelIndexKey {
            label,
            pk: Vec::new(),
        };
        self.label_index
            .entries
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(move |entry| entry.key().label == label)
            .filter_map(move |entry| self.verify_label_entry(entry.key(), &rv))
    }

    fn verify_label_entry(&self, key: &LabelIndexKey, rv: &ReadView) -> Option<Vertex> {
        let (created, _) = self.label_index.entries.get(key)?.value().stamps();
        // An entry inserted by another live transaction cannot be visible.
        if created.is_txn_id() && created != rv.txn_id {
            return None;
        }
        let slot = self.vertices.get(&key.pk)?;
        let vertex = slot.value().read(rv)?;
        vertex.has_label(key.label).then_some(vertex)
    }

    /// Vertices bearing a label and carrying a property, in property-value
    /// order, served from the label-property index.
    pub fn vertices_by_label_property<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        label: LabelId,
        property: PropertyId,
        view: View,
    ) -> impl Iterator<Item = Vertex> + 'a {
        self.label_property_scan(txn.read_view(view), label, property, Bound::Unbounded, Bound::Unbounded)
    }

    /// Vertices whose indexed property equals `value`.
    pub fn vertices_by_property_value<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        label: LabelId,
        property: PropertyId,
        value: PropertyValue,
        view: View,
    ) -> impl Iterator<Item = Vertex> + 'a {
        self.label_property_scan(
            txn.read_view(view),
            label,
            property,
            Bound::Included(value.clone()),
            Bound::Included(value),
        )
    }

    /// Vertices whose indexed property falls within `[lo, hi]` bounds,
    /// in property-value order.
    pub fn vertices_by_property_range<'a>(
        &'a self,
        txn: &Arc<ShardTransaction>,
        label: LabelId,
        property: PropertyId,
        lo: Bound<PropertyValue>,
        hi: Bound<PropertyValue>,
        view: View,
    ) -> impl Iterator<Item = Vertex> + 'a {
        self.label_property_scan(txn.read_view(view), label, property, lo, hi)
    }

    fn label_property_scan<'a>(
        &'a self,
        rv: ReadView,
        label: LabelId,
        property: PropertyId,
        lo: Bound<PropertyValue>,
        hi: Bound<PropertyValue>,
    ) -> impl Iterator<Item = Vertex> + 'a {
        // `Null` is the minimum of the value order and never stored, so it
        // doubles as the unbounded start sentinel.
        let start_value = match &lo {
            Bound::Included(v) | Bound::Excluded(v) => v.clone(),
            Bound::Unbounded => PropertyValue::Null,
        };
        let start = LabelPropertyIndexKey {
            label,
            property,
            value: start_value,
            pk: Vec::new(),
        };
        self.label_property_index
            .entries
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(move |entry| {
                let key = entry.key();
                if key.label != label || key.property != property {
                    return false;
                }
                match &hi {
                    Bound::Included(v) => key.value <= *v,
                    Bound::Excluded(v) => key.value < *v,
                    Bound::Unbounded => true,
                }
            })
            .filter_map(move |entry| {
                let key = entry.key();
                let in_lower = match &lo {
                    Bound::Included(v) => key.value >= *v,
                    Bound::Excluded(v) => key.value > *v,
                    Bound::Unbounded => true,
                };
                if !in_lower {
                    return None;
                }
                self.verify_property_entry(key, &rv)
            })
    }

    fn verify_property_entry(&self, key: &LabelPropertyIndexKey, rv: &ReadView) -> Option<Vertex> {
        let (created, _) = self
            .label_property_index
            .entries
            .get(key)?
            .value()
            .stamps();
        if created.is_txn_id() && created != rv.txn_id {
            return None;
        }
        let slot = self.vertices.get(&key.pk)?;
        let vertex = slot.value().read(rv)?;
        if !vertex.has_label(key.label) {
            return None;
        }
        // The entry's value must still be the vertex's visible value,
        // otherwise a newer entry covers this vertex.
        (vertex.properties.get(key.property) == Some(&key.value)).then_some(vertex)
    }
}

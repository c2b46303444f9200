use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tessera_common::types::LabelId;
use tessera_common::value::PropertyValue;

use super::edge::EdgeRef;
use super::properties::PropertyStore;

/// Schema-declared key of a vertex, ordered by the fixed cross-type value
/// order so primary-key range scans and shard-range checks are plain
/// comparisons.
pub type PrimaryKey = Vec<PropertyValue>;

/// Globally unique vertex handle: primary label plus primary key. Used for
/// edge endpoints, which may live on another shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexKey {
    pub label: LabelId,
    pub pk: PrimaryKey,
}

impl VertexKey {
    pub fn new(label: LabelId, pk: PrimaryKey) -> Self {
        Self { label, pk }
    }
}

/// A vertex record: one version of the vertex state. The version chain
/// holding these lives in the shard container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub pk: PrimaryKey,
    pub labels: SmallVec<[LabelId; 4]>,
    pub properties: PropertyStore,
    pub in_edges: Vec<EdgeRef>,
    pub out_edges: Vec<EdgeRef>,
    pub is_tombstone: bool,
}

impl Vertex {
    pub fn new(pk: PrimaryKey, labels: SmallVec<[LabelId; 4]>, properties: PropertyStore) -> Self {
        Vertex {
            pk,
            labels,
            properties,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            is_tombstone: false,
        }
    }

    /// Placeholder occupying a container slot before the creating
    /// transaction fills it in; also the state an aborted create reverts
    /// to.
    pub fn placeholder(pk: PrimaryKey) -> Self {
        Vertex {
            pk,
            labels: SmallVec::new(),
            properties: PropertyStore::default(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            is_tombstone: true,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.is_tombstone
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.contains(&label)
    }

    /// Adds a label; returns false when it was already present.
    pub fn add_label(&mut self, label: LabelId) -> bool {
        if self.has_label(label) {
            return false;
        }
        self.labels.push(label);
        true
    }

    /// Removes a label; returns false when it was not present.
    pub fn remove_label(&mut self, label: LabelId) -> bool {
        match self.labels.iter().position(|l| *l == label) {
            Some(idx) => {
                self.labels.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn add_in_edge(&mut self, edge: EdgeRef) {
        self.in_edges.push(edge);
    }

    pub fn add_out_edge(&mut self, edge: EdgeRef) {
        self.out_edges.push(edge);
    }

    pub fn remove_in_edge(&mut self, edge: &EdgeRef) {
        self.in_edges.retain(|e| e != edge);
    }

    pub fn remove_out_edge(&mut self, edge: &EdgeRef) {
        self.out_edges.retain(|e| e != edge);
    }

    pub fn has_edges(&self) -> bool {
        !self.in_edges.is_empty() || !self.out_edges.is_empty()
    }
}

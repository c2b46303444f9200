//! Undo deltas threaded onto vertex and edge version chains.
//!
//! Every mutation stores the *inverse* of the change it made: applying a
//! delta while walking a chain moves the object one step back in time.
//! Both snapshot visibility and abort-undo are derived from the same
//! entries.

use serde::{Deserialize, Serialize};
use tessera_common::types::{LabelId, PropertyId};
use tessera_common::value::PropertyValue;

use crate::model::{Edge, EdgeKey, EdgeRef, PrimaryKey, Vertex};

/// Pre-delete state restored by [`Delta::RecreateObject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectState {
    Vertex(Vertex),
    Edge(Edge),
}

/// An undo action. The payload is whatever is needed to reverse the
/// original change: the removed label, the overwritten property value, the
/// dropped edge reference, or the full pre-delete record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delta {
    /// Undo of a create: applying it removes the object from view.
    DeleteObject,
    /// Undo of a delete: applying it restores the recorded pre-delete
    /// state.
    RecreateObject(Box<ObjectState>),
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    /// Old value of the property (`Null` when it was absent).
    SetProperty(PropertyId, PropertyValue),
    AddInEdge(EdgeRef),
    AddOutEdge(EdgeRef),
    RemoveInEdge(EdgeRef),
    RemoveOutEdge(EdgeRef),
}

/// Handle of the object a delta undoes. Objects are addressed by container
/// key, never by pointer, so chains stay cycle-free and survive a shard
/// split that moves the container entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeltaTarget {
    Vertex(PrimaryKey),
    Edge(EdgeKey),
}

impl DeltaTarget {
    /// The primary key deciding which split successor the target belongs
    /// to: a vertex's own key, or the source key of an edge.
    pub fn partition_key(&self) -> &PrimaryKey {
        match self {
            DeltaTarget::Vertex(pk) => pk,
            DeltaTarget::Edge(key) => &key.src,
        }
    }
}

impl Delta {
    /// Applies this undo action to a vertex record.
    pub fn apply_to_vertex(&self, vertex: &mut Vertex) {
        match self {
            Delta::DeleteObject => vertex.is_tombstone = true,
            Delta::RecreateObject(state) => {
                if let ObjectState::Vertex(original) = state.as_ref() {
                    *vertex = original.clone();
                }
            }
            Delta::AddLabel(label) => {
                vertex.add_label(*label);
            }
            Delta::RemoveLabel(label) => {
                vertex.remove_label(*label);
            }
            Delta::SetProperty(property, old) => {
                vertex.properties.set(*property, old.clone());
            }
            Delta::AddInEdge(edge) => vertex.add_in_edge(edge.clone()),
            Delta::AddOutEdge(edge) => vertex.add_out_edge(edge.clone()),
            Delta::RemoveInEdge(edge) => vertex.remove_in_edge(edge),
            Delta::RemoveOutEdge(edge) => vertex.remove_out_edge(edge),
        }
    }

    /// Applies this undo action to an edge record.
    pub fn apply_to_edge(&self, edge: &mut Edge) {
        match self {
            Delta::DeleteObject => edge.is_tombstone = true,
            Delta::RecreateObject(state) => {
                if let ObjectState::Edge(original) = state.as_ref() {
                    *edge = original.clone();
                }
            }
            Delta::SetProperty(property, old) => {
                if let Some(properties) = edge.properties.as_mut() {
                    properties.set(*property, old.clone());
                }
            }
            // Label and edge-list actions never target edge records.
            _ => {}
        }
    }
}

/// Storage-specific undo entry: a [`Delta`] plus the [`DeltaTarget`]
/// back-pointer.
pub type UndoEntry = tessera_transaction::UndoEntry<Delta, DeltaTarget>;

/// Weak pointer into a delta chain.
pub type UndoPtr = tessera_transaction::UndoPtr<Delta, DeltaTarget>;

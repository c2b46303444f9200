//! Interning of label, property, and edge-type names to compact ids.
//!
//! One mapper is shared by all shards on a node and passed into each shard
//! at construction. Interning is single-writer/many-readers in practice:
//! ids are handed out under the per-kind counter while lookups go through
//! the concurrent maps.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tessera_common::types::{EdgeTypeId, LabelId, PropertyId};

#[derive(Debug)]
struct Interner {
    name_to_id: DashMap<String, u32>,
    id_to_name: DashMap<u32, String>,
    next_id: AtomicU32,
}

impl Interner {
    fn new(first_id: u32) -> Self {
        Self {
            name_to_id: DashMap::new(),
            id_to_name: DashMap::new(),
            next_id: AtomicU32::new(first_id),
        }
    }

    fn intern(&self, name: &str) -> u32 {
        if let Some(id) = self.name_to_id.get(name) {
            return *id;
        }
        let id = *self
            .name_to_id
            .entry(name.to_owned())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst));
        self.id_to_name.entry(id).or_insert_with(|| name.to_owned());
        id
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).map(|id| *id)
    }

    fn name_of(&self, id: u32) -> Option<String> {
        self.id_to_name.get(&id).map(|name| name.clone())
    }

    fn restore(&self, bindings: &[(u32, String)]) {
        let mut max_id = self.next_id.load(Ordering::SeqCst);
        for (id, name) in bindings {
            self.name_to_id.insert(name.clone(), *id);
            self.id_to_name.insert(*id, name.clone());
            max_id = max_id.max(id + 1);
        }
        self.next_id.store(max_id, Ordering::SeqCst);
    }

    fn dump(&self) -> Vec<(u32, String)> {
        let mut bindings: Vec<_> = self
            .id_to_name
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        bindings.sort();
        bindings
    }
}

/// Interns label, property, and edge-type names within a node.
#[derive(Debug)]
pub struct NameIdMapper {
    labels: Interner,
    properties: Interner,
    edge_types: Interner,
}

/// Serializable form of the mapper contents, carried inside snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameBindings {
    pub labels: Vec<(u32, String)>,
    pub properties: Vec<(u32, String)>,
    pub edge_types: Vec<(u32, String)>,
}

impl NameIdMapper {
    pub fn new() -> Self {
        Self {
            // Label and edge-type ids are NonZeroU32; 0 stays unused.
            labels: Interner::new(1),
            properties: Interner::new(0),
            edge_types: Interner::new(1),
        }
    }

    pub fn intern_label(&self, name: &str) -> LabelId {
        NonZeroU32::new(self.labels.intern(name)).expect("label ids start at 1")
    }

    pub fn intern_property(&self, name: &str) -> PropertyId {
        self.properties.intern(name)
    }

    pub fn intern_edge_type(&self, name: &str) -> EdgeTypeId {
        NonZeroU32::new(self.edge_types.intern(name)).expect("edge type ids start at 1")
    }

    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.labels.lookup(name).and_then(NonZeroU32::new)
    }

    pub fn property_id(&self, name: &str) -> Option<PropertyId> {
        self.properties.lookup(name)
    }

    pub fn edge_type_id(&self, name: &str) -> Option<EdgeTypeId> {
        self.edge_types.lookup(name).and_then(NonZeroU32::new)
    }

    pub fn label_name(&self, id: LabelId) -> Option<String> {
        self.labels.name_of(id.get())
    }

    pub fn property_name(&self, id: PropertyId) -> Option<String> {
        self.properties.name_of(id)
    }

    pub fn edge_type_name(&self, id: EdgeTypeId) -> Option<String> {
        self.edge_types.name_of(id.get())
    }

    /// Dump all bindings for inclusion in a snapshot.
    pub fn dump(&self) -> NameBindings {
        NameBindings {
            labels: self.labels.dump(),
            properties: self.properties.dump(),
            edge_types: self.edge_types.dump(),
        }
    }

    /// Restore bindings from a snapshot, keeping the id counters ahead of
    /// everything restored.
    pub fn restore(&self, bindings: &NameBindings) {
        self.labels.restore(&bindings.labels);
        self.properties.restore(&bindings.properties);
        self.edge_types.restore(&bindings.edge_types);
    }
}

impl Default for NameIdMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mapper = NameIdMapper::new();
        let person = mapper.intern_label("Person");
        assert_eq!(mapper.intern_label("Person"), person);
        assert_ne!(mapper.intern_label("City"), person);
        assert_eq!(mapper.label_name(person).as_deref(), Some("Person"));
    }

    #[test]
    fn kinds_are_independent_namespaces() {
        let mapper = NameIdMapper::new();
        let label = mapper.intern_label("knows");
        let edge_type = mapper.intern_edge_type("knows");
        assert_eq!(label.get(), edge_type.get());
        assert_eq!(mapper.property_id("knows"), None);
    }

    #[test]
    fn dump_restore_round_trip() {
        let mapper = NameIdMapper::new();
        mapper.intern_label("Person");
        mapper.intern_property("name");
        mapper.intern_property("age");
        mapper.intern_edge_type("KNOWS");

        let restored = NameIdMapper::new();
        restored.restore(&mapper.dump());
        assert_eq!(restored.label_id("Person"), mapper.label_id("Person"));
        assert_eq!(restored.property_id("age"), mapper.property_id("age"));
        // New interning continues past the restored ids.
        let fresh = restored.intern_property("city");
        assert!(fresh > restored.property_id("age").unwrap());
    }
}

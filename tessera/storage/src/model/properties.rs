use serde::{Deserialize, Serialize};
use tessera_common::types::PropertyId;
use tessera_common::value::PropertyValue;

/// Property map of a vertex or edge, kept as a vector sorted by property
/// id. An entry with a `Null` value is equivalent to an absent entry, so
/// setting `Null` removes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyStore(Vec<(PropertyId, PropertyValue)>);

impl PropertyStore {
    pub fn new(mut properties: Vec<(PropertyId, PropertyValue)>) -> Self {
        properties.retain(|(_, value)| !value.is_null());
        properties.sort_by_key(|(id, _)| *id);
        properties.dedup_by_key(|(id, _)| *id);
        PropertyStore(properties)
    }

    pub fn get(&self, property: PropertyId) -> Option<&PropertyValue> {
        self.0
            .binary_search_by_key(&property, |(id, _)| *id)
            .ok()
            .map(|idx| &self.0[idx].1)
    }

    pub fn contains(&self, property: PropertyId) -> bool {
        self.get(property).is_some()
    }

    /// Sets a property, returning the previous value (`Null` when absent).
    /// Setting `Null` removes the entry.
    pub fn set(&mut self, property: PropertyId, value: PropertyValue) -> PropertyValue {
        match self.0.binary_search_by_key(&property, |(id, _)| *id) {
            Ok(idx) => {
                if value.is_null() {
                    self.0.remove(idx).1
                } else {
                    std::mem::replace(&mut self.0[idx].1, value)
                }
            }
            Err(idx) => {
                if !value.is_null() {
                    self.0.insert(idx, (property, value));
                }
                PropertyValue::Null
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> {
        self.0.iter().map(|(id, value)| (*id, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(PropertyId, PropertyValue)> for PropertyStore {
    fn from_iter<I: IntoIterator<Item = (PropertyId, PropertyValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

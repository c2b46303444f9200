use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tessera_common::types::{LabelId, PropertyId};
use tessera_common::value::{PropertyDataType, PropertyValue};

use super::properties::PropertyStore;
use crate::error::{SchemaViolation, StorageError, StorageResult};

/// One declared primary-key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub property_id: PropertyId,
    pub data_type: PropertyDataType,
}

impl SchemaProperty {
    pub fn new(property_id: PropertyId, data_type: PropertyDataType) -> Self {
        Self {
            property_id,
            data_type,
        }
    }
}

/// The primary-key schema of one label: which properties form the key and
/// their declared types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeySchema {
    pub primary_label: LabelId,
    pub properties: Vec<SchemaProperty>,
}

impl PrimaryKeySchema {
    pub fn new(primary_label: LabelId, properties: Vec<SchemaProperty>) -> Self {
        Self {
            primary_label,
            properties,
        }
    }

    /// Validates a vertex create against this schema. On failure no deltas
    /// may be produced by the caller.
    pub fn validate_create(
        &self,
        labels: &[LabelId],
        pk: &[PropertyValue],
        properties: &PropertyStore,
    ) -> Result<(), SchemaViolation> {
        if !labels.contains(&self.primary_label) {
            return Err(SchemaViolation::MissingPrimaryLabel);
        }
        if pk.len() != self.properties.len() {
            return Err(SchemaViolation::KeyArityMismatch {
                expected: self.properties.len(),
                actual: pk.len(),
            });
        }
        for (declared, value) in self.properties.iter().zip(pk) {
            if value.data_type() != Some(declared.data_type) {
                return Err(SchemaViolation::KeyTypeMismatch {
                    property: declared.property_id,
                    expected: declared.data_type,
                    actual: value.data_type(),
                });
            }
        }
        for declared in &self.properties {
            if properties.contains(declared.property_id) {
                return Err(SchemaViolation::KeyPropertyOverlap {
                    property: declared.property_id,
                });
            }
        }
        Ok(())
    }
}

/// Registry of primary-key schemas held by a shard.
#[derive(Debug, Default)]
pub struct Schemas {
    inner: RwLock<HashMap<LabelId, Arc<PrimaryKeySchema>>>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, schema: PrimaryKeySchema) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&schema.primary_label) {
            return Err(StorageError::SchemaViolation(
                SchemaViolation::SchemaAlreadyExists {
                    label: schema.primary_label.get(),
                },
            ));
        }
        inner.insert(schema.primary_label, Arc::new(schema));
        Ok(())
    }

    pub fn drop(&self, label: LabelId) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .remove(&label)
            .map(|_| ())
            .ok_or(StorageError::SchemaViolation(
                SchemaViolation::SchemaNotFound { label: label.get() },
            ))
    }

    pub fn get(&self, label: LabelId) -> StorageResult<Arc<PrimaryKeySchema>> {
        self.inner
            .read()
            .unwrap()
            .get(&label)
            .cloned()
            .ok_or(StorageError::SchemaViolation(
                SchemaViolation::SchemaNotFound { label: label.get() },
            ))
    }

    pub fn dump(&self) -> Vec<PrimaryKeySchema> {
        let mut schemas: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .values()
            .map(|s| (**s).clone())
            .collect();
        schemas.sort_by_key(|s| s.primary_label);
        schemas
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn person() -> LabelId {
        NonZeroU32::new(1).unwrap()
    }

    fn schema() -> PrimaryKeySchema {
        PrimaryKeySchema::new(person(), vec![SchemaProperty::new(0, PropertyDataType::Int)])
    }

    #[test]
    fn accepts_matching_create() {
        let result = schema().validate_create(
            &[person()],
            &[PropertyValue::Int(1)],
            &PropertyStore::new(vec![(1, PropertyValue::String("a".into()))]),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_missing_primary_label() {
        let err = schema()
            .validate_create(&[], &[PropertyValue::Int(1)], &PropertyStore::default())
            .unwrap_err();
        assert_eq!(err, SchemaViolation::MissingPrimaryLabel);
    }

    #[test]
    fn rejects_arity_and_type_mismatches() {
        let err = schema()
            .validate_create(&[person()], &[], &PropertyStore::default())
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::KeyArityMismatch { .. }));

        let err = schema()
            .validate_create(
                &[person()],
                &[PropertyValue::String("1".into())],
                &PropertyStore::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::KeyTypeMismatch { .. }));
    }

    #[test]
    fn rejects_key_property_overlap() {
        let err = schema()
            .validate_create(
                &[person()],
                &[PropertyValue::Int(1)],
                &PropertyStore::new(vec![(0, PropertyValue::Int(2))]),
            )
            .unwrap_err();
        assert_eq!(err, SchemaViolation::KeyPropertyOverlap { property: 0 });
    }

    #[test]
    fn registry_rejects_duplicates() {
        let schemas = Schemas::new();
        schemas.create(schema()).unwrap();
        assert!(schemas.create(schema()).is_err());
        schemas.drop(person()).unwrap();
        assert!(schemas.get(person()).is_err());
    }
}

//! Shared fixtures for the storage integration suites.

use std::sync::Arc;

use tessera_common::types::{EdgeTypeId, LabelId, PropertyId};
use tessera_common::value::{PropertyDataType, PropertyValue};
use tessera_storage::{
    KeyRange, NodeContext, PrimaryKey, PropertyStore, SchemaProperty, Shard, ShardConfig,
    ShardOptions, Timestamp,
};
use uuid::Uuid;

pub struct TestShard {
    pub shard: Arc<Shard>,
    pub person: LabelId,
    pub knows: EdgeTypeId,
    pub id_prop: PropertyId,
    pub name_prop: PropertyId,
    pub age_prop: PropertyId,
}

pub fn pk(n: i64) -> PrimaryKey {
    vec![PropertyValue::Int(n)]
}

pub fn props(entries: Vec<(PropertyId, PropertyValue)>) -> PropertyStore {
    PropertyStore::new(entries)
}

/// A fresh unbounded shard for the `Person` label with an `id: INT`
/// primary key.
pub fn test_shard() -> TestShard {
    test_shard_with_config(ShardConfig::default())
}

pub fn test_shard_with_config(config: ShardConfig) -> TestShard {
    let ctx = NodeContext::new();
    let person = ctx.name_mapper.intern_label("Person");
    let knows = ctx.name_mapper.intern_edge_type("KNOWS");
    let id_prop = ctx.name_mapper.intern_property("id");
    let name_prop = ctx.name_mapper.intern_property("name");
    let age_prop = ctx.name_mapper.intern_property("age");

    let shard = Shard::new(
        ShardOptions {
            uuid: Uuid::new_v4(),
            primary_label: person,
            key_range: KeyRange::unbounded(),
            version: Timestamp::with_ts(1),
            config,
        },
        ctx,
    )
    .unwrap();
    shard
        .create_schema(
            person,
            vec![SchemaProperty::new(id_prop, PropertyDataType::Int)],
        )
        .unwrap();

    TestShard {
        shard,
        person,
        knows,
        id_prop,
        name_prop,
        age_prop,
    }
}

mod common;

use common::*;
use tessera_common::value::PropertyValue;
use tessera_storage::{PropertyStore, StorageError, Transaction, View};

// ========== DIRTY READ ==========

#[test]
fn snapshot_prevents_dirty_read_of_property_write() {
    let t = test_shard();
    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &setup,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(25))]),
        )
        .unwrap();
    setup.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    let writer = t.shard.access(None).unwrap();
    t.shard
        .set_vertex_property(&writer, &pk(1), t.age_prop, PropertyValue::Int(26))
        .unwrap();

    // The uncommitted write stays invisible.
    let vertex = t.shard.find_vertex(&reader, &pk(1), View::New).unwrap();
    assert_eq!(
        vertex.properties.get(t.age_prop),
        Some(&PropertyValue::Int(25))
    );
    writer.commit().unwrap();
    reader.commit().unwrap();
}

#[test]
fn snapshot_prevents_non_repeatable_read() {
    let t = test_shard();
    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &setup,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(25))]),
        )
        .unwrap();
    setup.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    let first = t.shard.find_vertex(&reader, &pk(1), View::New).unwrap();

    let writer = t.shard.access(None).unwrap();
    t.shard
        .set_vertex_property(&writer, &pk(1), t.age_prop, PropertyValue::Int(26))
        .unwrap();
    writer.commit().unwrap();

    // Same transaction, same answer.
    let second = t.shard.find_vertex(&reader, &pk(1), View::New).unwrap();
    assert_eq!(
        first.properties.get(t.age_prop),
        second.properties.get(t.age_prop)
    );
}

// ========== WRITE-WRITE CONFLICTS ==========

#[test]
fn concurrent_property_writes_conflict() {
    let t = test_shard();
    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(&setup, &[t.person], pk(1), PropertyStore::default())
        .unwrap();
    setup.commit().unwrap();

    let t1 = t.shard.access(None).unwrap();
    let t2 = t.shard.access(None).unwrap();
    t.shard
        .set_vertex_property(&t1, &pk(1), t.age_prop, PropertyValue::Int(1))
        .unwrap();
    let err = t
        .shard
        .set_vertex_property(&t2, &pk(1), t.age_prop, PropertyValue::Int(2))
        .unwrap_err();
    assert!(matches!(err, StorageError::Serialization(_)));
}

#[test]
fn write_after_newer_commit_conflicts() {
    let t = test_shard();
    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(&setup, &[t.person], pk(1), PropertyStore::default())
        .unwrap();
    setup.commit().unwrap();

    // The old transaction's snapshot predates the winner's commit.
    let old = t.shard.access(None).unwrap();
    let winner = t.shard.access(None).unwrap();
    t.shard
        .set_vertex_property(&winner, &pk(1), t.age_prop, PropertyValue::Int(1))
        .unwrap();
    winner.commit().unwrap();

    let err = t
        .shard
        .set_vertex_property(&old, &pk(1), t.age_prop, PropertyValue::Int(2))
        .unwrap_err();
    assert!(matches!(err, StorageError::Serialization(_)));
}

// ========== COMMIT / REOPEN ==========

#[test]
fn committed_state_is_read_back_by_a_fresh_accessor() {
    let t = test_shard();
    let writer = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &writer,
            &[t.person],
            pk(7),
            props(vec![(t.name_prop, PropertyValue::String("a".into()))]),
        )
        .unwrap();
    writer.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    let vertex = t.shard.find_vertex(&reader, &pk(7), View::Old).unwrap();
    assert_eq!(vertex.labels.as_slice(), &[t.person]);
    assert_eq!(
        vertex.properties.get(t.name_prop),
        Some(&PropertyValue::String("a".into()))
    );
}

#[test]
fn drop_without_commit_aborts() {
    let t = test_shard();
    {
        let writer = t.shard.access(None).unwrap();
        t.shard
            .create_vertex(&writer, &[t.person], pk(1), PropertyStore::default())
            .unwrap();
        writer.abort().unwrap();
    }
    let reader = t.shard.access(None).unwrap();
    assert!(t.shard.find_vertex(&reader, &pk(1), View::New).is_none());
}

// ========== INTERLEAVINGS ON DISJOINT KEYS ==========

#[test]
fn disjoint_writers_serialize_cleanly() {
    let t = test_shard();
    let t1 = t.shard.access(None).unwrap();
    let t2 = t.shard.access(None).unwrap();

    t.shard
        .create_vertex(&t1, &[t.person], pk(1), PropertyStore::default())
        .unwrap();
    t.shard
        .create_vertex(&t2, &[t.person], pk(2), PropertyStore::default())
        .unwrap();

    let c1 = t1.commit().unwrap();
    let c2 = t2.commit().unwrap();
    assert!(c2 > c1);

    let reader = t.shard.access(None).unwrap();
    assert!(t.shard.find_vertex(&reader, &pk(1), View::New).is_some());
    assert!(t.shard.find_vertex(&reader, &pk(2), View::New).is_some());
    // Full scan sees both, in key order.
    let keys: Vec<_> = t
        .shard
        .vertices_iter(&reader, View::New)
        .map(|v| v.pk.clone())
        .collect();
    assert_eq!(keys, vec![pk(1), pk(2)]);
}

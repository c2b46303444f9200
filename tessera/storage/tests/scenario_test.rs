mod common;

use std::ops::Bound;

use common::*;
use tessera_common::value::PropertyValue;
use tessera_storage::{PropertyStore, StorageError, Transaction, VertexKey, View};

#[test]
fn single_shard_create_then_read() {
    let t = test_shard();

    let t1 = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &t1,
            &[t.person],
            pk(1),
            props(vec![(t.name_prop, PropertyValue::String("a".into()))]),
        )
        .unwrap();
    t1.commit().unwrap();

    let t2 = t.shard.access(None).unwrap();
    let vertex = t.shard.find_vertex(&t2, &pk(1), View::Old).unwrap();
    assert_eq!(vertex.labels.as_slice(), &[t.person]);
    assert_eq!(
        vertex.properties.get(t.name_prop),
        Some(&PropertyValue::String("a".into()))
    );
}

#[test]
fn concurrent_creates_of_one_key_conflict() {
    let t = test_shard();
    let t1 = t.shard.access(None).unwrap();
    let t2 = t.shard.access(None).unwrap();

    t.shard
        .create_vertex(
            &t1,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(1))]),
        )
        .unwrap();
    let err = t
        .shard
        .create_vertex(
            &t2,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(2))]),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::Serialization(_)));
}

#[test]
fn detach_delete_removes_vertex_and_incident_edges() {
    let t = test_shard();

    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(&setup, &[t.person], pk(1), PropertyStore::default())
        .unwrap();
    t.shard
        .create_vertex(&setup, &[t.person], pk(2), PropertyStore::default())
        .unwrap();
    setup.advance_command();
    let edge = t
        .shard
        .create_edge(&setup, &pk(1), VertexKey::new(t.person, pk(2)), t.knows, 1)
        .unwrap();
    setup.commit().unwrap();

    let txn = t.shard.access(None).unwrap();
    let err = t.shard.delete_vertex(&txn, &pk(1)).unwrap_err();
    assert!(matches!(err, StorageError::VertexHasEdges(_)));

    let (removed, removed_edges) = t.shard.detach_delete_vertex(&txn, &pk(1)).unwrap();
    assert_eq!(removed.pk, pk(1));
    assert_eq!(removed_edges.len(), 1);
    assert_eq!(removed_edges[0].gid, edge.gid);

    // A second delete in the same transaction hits the tombstone.
    txn.advance_command();
    let err = t.shard.delete_vertex(&txn, &pk(1)).unwrap_err();
    assert!(matches!(err, StorageError::DeletedObject(_)));
    txn.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    assert!(t.shard.find_vertex(&reader, &pk(1), View::New).is_none());
    assert!(t.shard.find_edge(&reader, &edge.key(), View::New).is_none());
    let v2 = t.shard.find_vertex(&reader, &pk(2), View::New).unwrap();
    assert!(v2.in_edges.is_empty());
}

#[test]
fn edge_reciprocity_holds_after_commit() {
    let t = test_shard();
    let setup = t.shard.access(None).unwrap();
    for n in 1..=3 {
        t.shard
            .create_vertex(&setup, &[t.person], pk(n), PropertyStore::default())
            .unwrap();
    }
    setup.advance_command();
    t.shard
        .create_edge(&setup, &pk(1), VertexKey::new(t.person, pk(2)), t.knows, 1)
        .unwrap();
    t.shard
        .create_edge(&setup, &pk(1), VertexKey::new(t.person, pk(3)), t.knows, 2)
        .unwrap();
    t.shard
        .create_edge(&setup, &pk(3), VertexKey::new(t.person, pk(1)), t.knows, 3)
        .unwrap();
    setup.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    for edge in t.shard.edges_iter(&reader, View::New) {
        let src = t
            .shard
            .find_vertex(&reader, &edge.src.pk, View::New)
            .unwrap();
        let dst = t
            .shard
            .find_vertex(&reader, &edge.dst.pk, View::New)
            .unwrap();
        assert!(src.out_edges.contains(&edge.out_ref()), "missing out-ref");
        assert!(dst.in_edges.contains(&edge.in_ref()), "missing in-ref");
    }
}

#[test]
fn label_property_index_range_scan() {
    let t = test_shard();
    t.shard.create_index(t.person, Some(t.age_prop)).unwrap();

    let setup = t.shard.access(None).unwrap();
    for (n, age) in [(1, 10), (2, 20), (3, 30)] {
        t.shard
            .create_vertex(
                &setup,
                &[t.person],
                pk(n),
                props(vec![(t.age_prop, PropertyValue::Int(age))]),
            )
            .unwrap();
    }
    setup.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    let hits: Vec<_> = t
        .shard
        .vertices_by_property_range(
            &reader,
            t.person,
            t.age_prop,
            Bound::Included(PropertyValue::Int(15)),
            Bound::Excluded(PropertyValue::Int(30)),
            View::New,
        )
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].properties.get(t.age_prop), Some(&PropertyValue::Int(20)));
}

#[test]
fn index_scans_reflect_updates_and_deletes() {
    let t = test_shard();
    t.shard.create_index(t.person, None).unwrap();
    t.shard.create_index(t.person, Some(t.age_prop)).unwrap();

    let setup = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &setup,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(10))]),
        )
        .unwrap();
    t.shard
        .create_vertex(
            &setup,
            &[t.person],
            pk(2),
            props(vec![(t.age_prop, PropertyValue::Int(20))]),
        )
        .unwrap();
    setup.commit().unwrap();

    // Move one vertex's age; the old entry must stop matching.
    let txn = t.shard.access(None).unwrap();
    t.shard
        .set_vertex_property(&txn, &pk(1), t.age_prop, PropertyValue::Int(99))
        .unwrap();
    txn.commit().unwrap();

    let reader = t.shard.access(None).unwrap();
    let by_label: Vec<_> = t
        .shard
        .vertices_by_label(&reader, t.person, View::New)
        .collect();
    assert_eq!(by_label.len(), 2);

    let at_10: Vec<_> = t
        .shard
        .vertices_by_property_value(&reader, t.person, t.age_prop, PropertyValue::Int(10), View::New)
        .collect();
    assert!(at_10.is_empty());
    let at_99: Vec<_> = t
        .shard
        .vertices_by_property_value(&reader, t.person, t.age_prop, PropertyValue::Int(99), View::New)
        .collect();
    assert_eq!(at_99.len(), 1);

    // Deleting expires the label entry for new readers.
    let txn = t.shard.access(None).unwrap();
    t.shard.delete_vertex(&txn, &pk(2)).unwrap();
    txn.commit().unwrap();
    let reader = t.shard.access(None).unwrap();
    let by_label: Vec<_> = t
        .shard
        .vertices_by_label(&reader, t.person, View::New)
        .collect();
    assert_eq!(by_label.len(), 1);
    assert_eq!(by_label[0].pk, pk(1));
}

#[test]
fn uncommitted_index_entries_stay_private() {
    let t = test_shard();
    t.shard.create_index(t.person, Some(t.age_prop)).unwrap();

    let writer = t.shard.access(None).unwrap();
    t.shard
        .create_vertex(
            &writer,
            &[t.person],
            pk(1),
            props(vec![(t.age_prop, PropertyValue::Int(10))]),
        )
        .unwrap();
    writer.advance_command();

    // The writer sees its own pending entry, a concurrent reader does not.
    let own: Vec<_> = t
        .shard
        .vertices_by_property_value(&writer, t.person, t.age_prop, PropertyValue::Int(10), View::New)
        .collect();
    assert_eq!(own.len(), 1);

    let reader = t.shard.access(None).unwrap();
    let foreign: Vec<_> = t
        .shard
        .vertices_by_property_value(&reader, t.person, t.age_prop, PropertyValue::Int(10), View::New)
        .collect();
    assert!(foreign.is_empty());

    // Abort unwinds the entry entirely.
    writer.abort().unwrap();
    let reader = t.shard.access(None).unwrap();
    let after: Vec<_> = t
        .shard
        .vertices_by_label_property(&reader, t.person, t.age_prop, View::New)
        .collect();
    assert!(after.is_empty());
}

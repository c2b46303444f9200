mod common;

use common::*;
use tessera_common::value::PropertyValue;
use tessera_storage::{
    KeyRange, NodeContext, PropertyStore, Shard, ShardConfig, ShardOptions, SnapshotConfig,
    SnapshotManager, Timestamp, Transaction, VertexKey, View,
};
use uuid::Uuid;

struct DurableFixture {
    options: ShardOptions,
    _wal_dir: temp_dir::TempDir,
    snapshot_dir: temp_dir::TempDir,
}

fn durable_options(with_snapshots: bool) -> DurableFixture {
    let wal_dir = temp_dir::TempDir::with_prefix("tessera_wal_").unwrap();
    let snapshot_dir = temp_dir::TempDir::with_prefix("tessera_snap_").unwrap();
    let config = ShardConfig {
        wal_path: Some(wal_dir.path().join("shard.wal")),
        snapshot: with_snapshots.then(|| SnapshotConfig {
            directory: snapshot_dir.path().to_owned(),
            ..SnapshotConfig::default()
        }),
        ..ShardConfig::default()
    };
    DurableFixture {
        options: ShardOptions {
            uuid: Uuid::new_v4(),
            primary_label: tessera_common::types::LabelId::new(1).unwrap(),
            key_range: KeyRange::unbounded(),
            version: Timestamp::with_ts(1),
            config,
        },
        _wal_dir: wal_dir,
        snapshot_dir,
    }
}

fn populate(ctx: &NodeContext, options: &ShardOptions) -> (std::sync::Arc<Shard>, u32, u32) {
    let person = ctx.name_mapper.intern_label("Person");
    assert_eq!(person, options.primary_label);
    let id_prop = ctx.name_mapper.intern_property("id");
    let age_prop = ctx.name_mapper.intern_property("age");
    let knows = ctx.name_mapper.intern_edge_type("KNOWS");

    let shard = Shard::new(options.clone(), ctx.clone()).unwrap();
    shard
        .create_schema(
            person,
            vec![tessera_storage::SchemaProperty::new(
                id_prop,
                tessera_common::value::PropertyDataType::Int,
            )],
        )
        .unwrap();
    shard.create_index(person, Some(age_prop)).unwrap();

    let txn = shard.access(None).unwrap();
    shard
        .create_vertex(
            &txn,
            &[person],
            pk(1),
            props(vec![(age_prop, PropertyValue::Int(30))]),
        )
        .unwrap();
    shard
        .create_vertex(&txn, &[person], pk(2), PropertyStore::default())
        .unwrap();
    txn.advance_command();
    shard
        .create_edge(&txn, &pk(1), VertexKey::new(person, pk(2)), knows, 1)
        .unwrap();
    txn.commit().unwrap();

    // An aborted transaction must leave no trace after replay.
    let aborted = shard.access(None).unwrap();
    shard
        .create_vertex(&aborted, &[person], pk(9), PropertyStore::default())
        .unwrap();
    aborted.abort().unwrap();

    (shard, id_prop, age_prop)
}

#[test]
fn wal_replay_restores_committed_state() {
    let fixture = durable_options(false);
    let ctx = NodeContext::new();
    let (shard, _, age_prop) = populate(&ctx, &fixture.options);
    let person = fixture.options.primary_label;
    drop(shard);

    let recovered = Shard::recover(fixture.options.clone(), NodeContext::new()).unwrap();
    let reader = recovered.access(None).unwrap();

    let v1 = recovered.find_vertex(&reader, &pk(1), View::New).unwrap();
    assert_eq!(v1.properties.get(age_prop), Some(&PropertyValue::Int(30)));
    assert_eq!(v1.out_edges.len(), 1);
    let v2 = recovered.find_vertex(&reader, &pk(2), View::New).unwrap();
    assert_eq!(v2.in_edges.len(), 1);
    assert!(recovered.find_vertex(&reader, &pk(9), View::New).is_none());

    // Index definitions and entries came back through the admin records.
    let hits: Vec<_> = recovered
        .vertices_by_property_value(&reader, person, age_prop, PropertyValue::Int(30), View::New)
        .collect();
    assert_eq!(hits.len(), 1);
}

#[test]
fn recovery_continues_accepting_writes() {
    let fixture = durable_options(false);
    let ctx = NodeContext::new();
    let (shard, _, _) = populate(&ctx, &fixture.options);
    let person = fixture.options.primary_label;
    drop(shard);

    let recovered = Shard::recover(fixture.options.clone(), NodeContext::new()).unwrap();
    let txn = recovered.access(None).unwrap();
    recovered
        .create_vertex(&txn, &[person], pk(3), PropertyStore::default())
        .unwrap();
    txn.commit().unwrap();
    drop(recovered);

    // A second recovery replays both generations of the log.
    let recovered = Shard::recover(fixture.options, NodeContext::new()).unwrap();
    let reader = recovered.access(None).unwrap();
    assert!(recovered.find_vertex(&reader, &pk(1), View::New).is_some());
    assert!(recovered.find_vertex(&reader, &pk(3), View::New).is_some());
}

#[test]
fn snapshot_then_wal_recovery() {
    let fixture = durable_options(true);
    let ctx = NodeContext::new();
    let (shard, _, age_prop) = populate(&ctx, &fixture.options);
    let person = fixture.options.primary_label;

    let manager = SnapshotManager::new(SnapshotConfig {
        directory: fixture.snapshot_dir.path().to_owned(),
        ..SnapshotConfig::default()
    });
    manager.create(&shard).unwrap();

    // Post-snapshot traffic lands only in the WAL.
    let txn = shard.access(None).unwrap();
    shard
        .create_vertex(&txn, &[person], pk(5), PropertyStore::default())
        .unwrap();
    txn.commit().unwrap();
    drop(shard);

    let recovered = Shard::recover(fixture.options, NodeContext::new()).unwrap();
    let reader = recovered.access(None).unwrap();
    // From the snapshot:
    let v1 = recovered.find_vertex(&reader, &pk(1), View::New).unwrap();
    assert_eq!(v1.properties.get(age_prop), Some(&PropertyValue::Int(30)));
    // From the WAL tail:
    assert!(recovered.find_vertex(&reader, &pk(5), View::New).is_some());
    // Names survived inside the snapshot.
    assert_eq!(
        recovered.name_mapper().label_name(person).as_deref(),
        Some("Person")
    );
}

#[test]
fn snapshot_requires_quiesced_shard() {
    let fixture = durable_options(true);
    let ctx = NodeContext::new();
    let (shard, _, _) = populate(&ctx, &fixture.options);

    let manager = SnapshotManager::new(SnapshotConfig {
        directory: fixture.snapshot_dir.path().to_owned(),
        txn_drain_timeout: std::time::Duration::from_millis(50),
        ..SnapshotConfig::default()
    });

    let open = shard.access(None).unwrap();
    let err = manager.create(&shard).unwrap_err();
    assert!(matches!(
        err,
        tessera_storage::StorageError::Snapshot(tessera_storage::error::SnapshotError::Timeout)
    ));
    open.abort().unwrap();
    assert!(manager.create(&shard).is_ok());
}

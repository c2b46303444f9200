use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_cluster::{
    Address, ClusterError, HeartbeatResponse, LocalTransport, Message, PlacementStatus,
    RouteMessage, ShardManager, ShardManagerConfig, ShardMap, ShardPlacement, ShardToInitialize,
    ShardToSplit, UuidMapping,
};
use tessera_common::value::{PropertyDataType, PropertyValue};
use tessera_storage::{
    KeyRange, NodeContext, PrimaryKey, PropertyStore, SchemaProperty, Shard, ShardConfig,
    ShardOptions, Timestamp, Transaction, View,
};
use uuid::Uuid;

fn address(n: u128) -> Address {
    Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000, Uuid::from_u128(n))
}

fn pk(n: i64) -> PrimaryKey {
    vec![PropertyValue::Int(n)]
}

fn manager_fixture(
    coordinator: Address,
    transport: Arc<LocalTransport>,
) -> (Arc<ShardManager>, NodeContext) {
    let ctx = NodeContext::new();
    let config = ShardManagerConfig {
        cron_interval_min: Duration::from_millis(5),
        cron_interval_max: Duration::from_millis(10),
        ..ShardManagerConfig::new(address(100), coordinator)
    };
    let manager = ShardManager::new(
        config,
        ctx.clone(),
        transport,
        Arc::new(ShardMap::new()),
        None,
    );
    (manager, ctx)
}

fn seeded_shard(ctx: &NodeContext, uuid: Uuid, keys: &[i64]) -> Arc<Shard> {
    let person = ctx.name_mapper.intern_label("Person");
    let id_prop = ctx.name_mapper.intern_property("id");
    let shard = Shard::new(
        ShardOptions {
            uuid,
            primary_label: person,
            key_range: KeyRange::unbounded(),
            version: Timestamp::with_ts(1),
            config: ShardConfig::default(),
        },
        ctx.clone(),
    )
    .unwrap();
    shard
        .create_schema(person, vec![SchemaProperty::new(id_prop, PropertyDataType::Int)])
        .unwrap();
    let txn = shard.access(None).unwrap();
    for &n in keys {
        shard
            .create_vertex(&txn, &[person], pk(n), PropertyStore::default())
            .unwrap();
    }
    txn.commit().unwrap();
    shard
}

/// Drives cron ticks until `done` holds or the deadline passes.
fn drive_until(manager: &Arc<ShardManager>, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        manager.run_cron_once();
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn heartbeat_initializes_assigned_shards() {
    let coordinator = address(1);
    let shard_uuid = Uuid::from_u128(42);
    let assigned = AtomicBool::new(false);
    let transport = Arc::new(LocalTransport::new());
    transport.register(coordinator, move |message| {
        let Message::HeartbeatRequest(_) = message else {
            return None;
        };
        let mut response = HeartbeatResponse {
            success: true,
            ..Default::default()
        };
        if !assigned.swap(true, Ordering::AcqRel) {
            response.shards_to_initialize.push(ShardToInitialize {
                uuid: shard_uuid,
                label_id: tessera_common::types::LabelId::new(1).unwrap(),
                min_key: Vec::new(),
            });
        }
        Some(Message::HeartbeatResponse(response))
    });

    let (manager, _ctx) = manager_fixture(coordinator, transport);
    drive_until(&manager, || manager.shard_count() == 1);
    let shard = manager.shard(shard_uuid).unwrap();
    assert_eq!(shard.uuid(), shard_uuid);
    manager.shut_down();
}

#[test]
fn heartbeat_follows_leader_redirect() {
    let old_leader = address(1);
    let new_leader = address(2);
    let reached_new = Arc::new(AtomicBool::new(false));

    let transport = Arc::new(LocalTransport::new());
    transport.register(old_leader, move |_| {
        Some(Message::HeartbeatResponse(HeartbeatResponse {
            retry_leader: Some(new_leader),
            success: false,
            ..Default::default()
        }))
    });
    {
        let reached_new = reached_new.clone();
        transport.register(new_leader, move |_| {
            reached_new.store(true, Ordering::Release);
            Some(Message::HeartbeatResponse(HeartbeatResponse {
                success: true,
                ..Default::default()
            }))
        });
    }

    let (manager, _ctx) = manager_fixture(old_leader, transport);
    drive_until(&manager, || reached_new.load(Ordering::Acquire));
    manager.shut_down();
}

#[test]
fn heartbeat_timeout_is_swallowed_and_retried() {
    // Nothing listens at the coordinator address: every heartbeat times
    // out, and the manager keeps ticking regardless.
    let transport = Arc::new(LocalTransport::new());
    let (manager, _ctx) = manager_fixture(address(1), transport);
    for _ in 0..5 {
        manager.run_cron_once();
        std::thread::sleep(Duration::from_millis(12));
    }
    manager.shut_down();
}

#[test]
fn routes_messages_to_hosted_shards() {
    let transport = Arc::new(LocalTransport::new());
    let received: Arc<Mutex<Vec<RouteMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let ctx = NodeContext::new();
    let config = ShardManagerConfig {
        cron_interval_min: Duration::from_millis(5),
        cron_interval_max: Duration::from_millis(10),
        ..ShardManagerConfig::new(address(100), address(1))
    };
    let sink = received.clone();
    let manager = ShardManager::new(
        config,
        ctx.clone(),
        transport,
        Arc::new(ShardMap::new()),
        Some(Arc::new(move |_shard, message| {
            sink.lock().unwrap().push(message);
        })),
    );

    let shard_uuid = Uuid::from_u128(7);
    let shard = seeded_shard(&ctx, shard_uuid, &[1]);
    manager.register_shard(shard);

    let message = RouteMessage {
        message: b"scan".to_vec(),
        request_id: 1,
        to: address(0).with_uuid(shard_uuid),
        from: address(100),
    };
    manager.route(message.clone()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while received.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(received.lock().unwrap()[0], message);

    let unknown = RouteMessage {
        message: Vec::new(),
        request_id: 2,
        to: address(0).with_uuid(Uuid::from_u128(99)),
        from: address(100),
    };
    assert!(matches!(
        manager.route(unknown),
        Err(ClusterError::UnknownShard(_))
    ));
    manager.shut_down();
}

#[test]
fn coordinator_decided_split_installs_successor() {
    let coordinator = address(1);
    let parent_uuid = Uuid::from_u128(10);
    let rhs_uuid = Uuid::from_u128(11);

    let split_sent = AtomicBool::new(false);
    let transport = Arc::new(LocalTransport::new());
    transport.register(coordinator, move |message| {
        let Message::HeartbeatRequest(_) = message else {
            return None;
        };
        let mut response = HeartbeatResponse {
            success: true,
            ..Default::default()
        };
        if !split_sent.swap(true, Ordering::AcqRel) {
            response.shards_to_split.push(ShardToSplit {
                uuid_mapping: UuidMapping {
                    parent: parent_uuid,
                    rhs: rhs_uuid,
                },
                split_key: pk(4),
                old_shard_version: Timestamp::with_ts(1),
                new_lhs_shard_version: Timestamp::with_ts(2),
                new_rhs_shard_version: Timestamp::with_ts(3),
            });
        }
        Some(Message::HeartbeatResponse(response))
    });

    let (manager, ctx) = manager_fixture(coordinator, transport);
    let person = ctx.name_mapper.intern_label("Person");
    let shard = seeded_shard(&ctx, parent_uuid, &[1, 2, 3, 4, 5, 6]);
    manager.register_shard(shard.clone());
    manager.shard_map().initialize_label(
        person,
        Vec::new(),
        vec![ShardPlacement {
            uuid: parent_uuid,
            address: address(100),
            status: PlacementStatus::Ready,
        }],
    );

    drive_until(&manager, || manager.shard_count() == 2);

    let rhs = manager.shard(rhs_uuid).unwrap();
    assert_eq!(rhs.key_range().min, pk(4));
    assert_eq!(shard.key_range().max, Some(pk(4)));
    assert_eq!(shard.version(), Timestamp::with_ts(2));
    assert_eq!(rhs.version(), Timestamp::with_ts(3));

    let reader = rhs.access(None).unwrap();
    assert_eq!(rhs.vertices_iter(&reader, View::New).count(), 3);

    // The local routing table now resolves split-side keys to the
    // successor.
    let placement = manager
        .shard_map()
        .get_shard_for_key(person, &pk(5))
        .unwrap();
    assert_eq!(placement.uuid, rhs_uuid);
    let placement = manager
        .shard_map()
        .get_shard_for_key(person, &pk(2))
        .unwrap();
    assert_eq!(placement.uuid, parent_uuid);
    manager.shut_down();
}

//! The shard manager: hosts many shard instances on one node, dispatches
//! incoming messages to the right shard worker, reconciles membership with
//! the coordinator via heartbeats, and drives shard splits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tessera_storage::shard::SplitData;
use tessera_storage::{KeyRange, NodeContext, PrimaryKey, Shard, ShardConfig, ShardOptions};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};
use crate::messages::{
    Address, HeartbeatRequest, HeartbeatResponse, Message, RouteMessage, ShardToInitialize,
    ShardToSplit, SplitRequest, SuggestedSplitInfo, UuidMapping,
};
use crate::shard_map::{PlacementStatus, ShardMap, ShardPlacement};
use crate::transport::{PollOutcome, ResponseFuture, Transport};

/// Hook through which the (out-of-scope) query layer consumes routed
/// messages on the owning worker.
pub type RouteHandler = Arc<dyn Fn(&Arc<Shard>, RouteMessage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    pub address: Address,
    pub coordinator: Address,
    pub workers: usize,
    /// Cron fires at a jittered interval within `[min, max]`.
    pub cron_interval_min: Duration,
    pub cron_interval_max: Duration,
    /// Template configuration for shards initialized on this node.
    pub shard_config: ShardConfig,
}

impl ShardManagerConfig {
    pub fn new(address: Address, coordinator: Address) -> Self {
        Self {
            address,
            coordinator,
            workers: 4,
            cron_interval_min: Duration::from_millis(100),
            cron_interval_max: Duration::from_millis(200),
            shard_config: ShardConfig::default(),
        }
    }
}

enum WorkerMsg {
    Route(Arc<Shard>, RouteMessage),
    Cron(Arc<Shard>),
    Split(Arc<Shard>, SplitRequest),
    ShutDown,
}

enum ManagerEvent {
    SplitPerformed {
        mapping: UuidMapping,
        split_key: PrimaryKey,
        data: SplitData,
    },
    SplitFailed {
        mapping: UuidMapping,
        error: String,
    },
}

struct WorkerHandle {
    sender: Sender<WorkerMsg>,
    load: AtomicUsize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ShardSlot {
    worker: usize,
    shard: Arc<Shard>,
}

pub struct ShardManager {
    config: ShardManagerConfig,
    ctx: NodeContext,
    transport: Arc<dyn Transport>,
    shard_map: Arc<ShardMap>,
    workers: Vec<WorkerHandle>,
    shards: DashMap<Uuid, ShardSlot>,
    /// Shards initialized locally but not yet confirmed by the
    /// coordinator; reported in every heartbeat until acknowledged.
    initialized_unconfirmed: Mutex<Vec<Uuid>>,
    suggested_splits: Mutex<Vec<SuggestedSplitInfo>>,
    /// Best-effort leader guess; replaced when a response redirects us.
    coordinator: RwLock<Address>,
    pending_heartbeat: Mutex<Option<ResponseFuture>>,
    events_rx: Mutex<Receiver<ManagerEvent>>,
    shutdown: AtomicBool,
    cron_handle: Mutex<Option<JoinHandle<()>>>,
}

fn run_worker(
    index: usize,
    rx: Receiver<WorkerMsg>,
    events: Sender<ManagerEvent>,
    route_handler: RouteHandler,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Route(shard, message) => {
                route_handler(&shard, message);
            }
            WorkerMsg::Cron(shard) => {
                let now = shard.hlc().current();
                if let Err(e) = shard.collect_garbage(now) {
                    warn!(worker = index, shard = %shard.uuid(), error = %e, "gc failed");
                }
            }
            WorkerMsg::Split(shard, request) => {
                match shard.perform_split(
                    &request.split_key,
                    request.old_shard_version,
                    request.new_lhs_shard_version,
                    request.new_rhs_shard_version,
                ) {
                    Ok(data) => {
                        let _ = events.send(ManagerEvent::SplitPerformed {
                            mapping: request.uuid_mapping,
                            split_key: request.split_key,
                            data,
                        });
                    }
                    Err(e) => {
                        warn!(worker = index, shard = %shard.uuid(), error = %e, "split failed");
                        let _ = events.send(ManagerEvent::SplitFailed {
                            mapping: request.uuid_mapping,
                            error: e.to_string(),
                        });
                    }
                }
            }
            WorkerMsg::ShutDown => break,
        }
    }
}

impl ShardManager {
    pub fn new(
        config: ShardManagerConfig,
        ctx: NodeContext,
        transport: Arc<dyn Transport>,
        shard_map: Arc<ShardMap>,
        route_handler: Option<RouteHandler>,
    ) -> Arc<Self> {
        let route_handler: RouteHandler =
            route_handler.unwrap_or_else(|| Arc::new(|_shard, _msg| {}));
        let (events_tx, events_rx) = channel();
        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = channel();
            let events = events_tx.clone();
            let handler = route_handler.clone();
            let handle = std::thread::Builder::new()
                .name(format!("shard-worker-{index}"))
                .spawn(move || run_worker(index, rx, events, handler))
                .expect("failed to spawn shard worker");
            workers.push(WorkerHandle {
                sender: tx,
                load: AtomicUsize::new(0),
                handle: Mutex::new(Some(handle)),
            });
        }

        let coordinator = config.coordinator;
        Arc::new(Self {
            config,
            ctx,
            transport,
            shard_map,
            workers,
            shards: DashMap::new(),
            initialized_unconfirmed: Mutex::new(Vec::new()),
            suggested_splits: Mutex::new(Vec::new()),
            coordinator: RwLock::new(coordinator),
            pending_heartbeat: Mutex::new(None),
            events_rx: Mutex::new(events_rx),
            shutdown: AtomicBool::new(false),
            cron_handle: Mutex::new(None),
        })
    }

    pub fn node_context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn shard_map(&self) -> &Arc<ShardMap> {
        &self.shard_map
    }

    /// The shard hosted under `uuid`, if any.
    pub fn shard(&self, uuid: Uuid) -> Option<Arc<Shard>> {
        self.shards.get(&uuid).map(|slot| slot.shard.clone())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Hosts a shard, assigning it to the least-loaded worker on first
    /// contact.
    pub fn register_shard(&self, shard: Arc<Shard>) {
        let worker = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.load.load(Ordering::Acquire))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.workers[worker].load.fetch_add(1, Ordering::AcqRel);
        let uuid = shard.uuid();
        self.shards.insert(uuid, ShardSlot { worker, shard });
        self.initialized_unconfirmed.lock().unwrap().push(uuid);
        info!(shard = %uuid, worker, "shard registered");
    }

    /// Creates and hosts an empty shard as instructed by the coordinator.
    pub fn initialize_shard(&self, spec: ShardToInitialize) -> ClusterResult<Arc<Shard>> {
        let version = self.ctx.hlc.next().map_err(tessera_storage::StorageError::from)?;
        let shard = Shard::new(
            ShardOptions {
                uuid: spec.uuid,
                primary_label: spec.label_id,
                key_range: KeyRange::new(spec.min_key, None),
                version,
                config: self.config.shard_config.clone(),
            },
            self.ctx.clone(),
        )?;
        self.register_shard(shard.clone());
        Ok(shard)
    }

    /// Hands an inbound message to the worker owning the target shard.
    pub fn route(&self, message: RouteMessage) -> ClusterResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ClusterError::ShuttingDown);
        }
        let (worker, shard) = {
            let slot = self
                .shards
                .get(&message.to.uuid)
                .ok_or(ClusterError::UnknownShard(message.to.uuid))?;
            (slot.worker, slot.shard.clone())
        };
        self.workers[worker]
            .sender
            .send(WorkerMsg::Route(shard, message))
            .map_err(|_| ClusterError::ShuttingDown)
    }

    fn jittered_interval(&self) -> Duration {
        let min = self.config.cron_interval_min;
        let max = self.config.cron_interval_max.max(min);
        if max == min {
            return min;
        }
        let spread = (max - min).as_millis() as u64;
        min + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// One cron tick: install finished splits, poll the outstanding
    /// heartbeat, gather split suggestions, send the next heartbeat, and
    /// dispatch per-shard maintenance. Returns the delay until the next
    /// tick.
    pub fn run_cron_once(&self) -> Duration {
        let interval = self.jittered_interval();

        self.drain_events();
        self.poll_heartbeat();
        self.gather_split_suggestions();

        let send_new = self.pending_heartbeat.lock().unwrap().is_none();
        if send_new {
            self.send_heartbeat(Instant::now() + interval);
        }

        for entry in self.shards.iter() {
            let _ = self.workers[entry.value().worker]
                .sender
                .send(WorkerMsg::Cron(entry.value().shard.clone()));
        }

        interval
    }

    fn gather_split_suggestions(&self) {
        let mut suggestions = self.suggested_splits.lock().unwrap();
        for entry in self.shards.iter() {
            let shard = &entry.value().shard;
            if suggestions.iter().any(|s| s.uuid == shard.uuid()) {
                continue;
            }
            if let Some(split_key) = shard.should_split() {
                suggestions.push(SuggestedSplitInfo {
                    uuid: shard.uuid(),
                    shard_version: shard.version(),
                    split_key,
                });
            }
        }
    }

    fn send_heartbeat(&self, deadline: Instant) {
        let request = HeartbeatRequest {
            from: self.config.address,
            initialized_shards: self.initialized_unconfirmed.lock().unwrap().clone(),
            suggested_splits: std::mem::take(&mut *self.suggested_splits.lock().unwrap()),
        };
        let coordinator = *self.coordinator.read().unwrap();
        let future =
            self.transport
                .request(coordinator, Message::HeartbeatRequest(request), deadline);
        *self.pending_heartbeat.lock().unwrap() = Some(future);
    }

    fn poll_heartbeat(&self) {
        let future = self.pending_heartbeat.lock().unwrap().take();
        let Some(future) = future else {
            return;
        };
        match future.poll() {
            PollOutcome::Ready(Message::HeartbeatResponse(response)) => {
                self.apply_heartbeat_response(response);
            }
            PollOutcome::Ready(other) => {
                warn!(?other, "unexpected heartbeat reply");
            }
            PollOutcome::Pending => {
                *self.pending_heartbeat.lock().unwrap() = Some(future);
            }
            PollOutcome::TimedOut => {
                // Transient; retry against the current leader guess on the
                // next tick.
                warn!("heartbeat timed out");
            }
        }
    }

    fn apply_heartbeat_response(&self, response: HeartbeatResponse) {
        if let Some(leader) = response.retry_leader {
            info!(%leader, "redirected to coordinator leader");
            *self.coordinator.write().unwrap() = leader;
            return;
        }
        if !response.success {
            return;
        }
        {
            let mut unconfirmed = self.initialized_unconfirmed.lock().unwrap();
            unconfirmed.retain(|uuid| !response.acknowledged_initialized.contains(uuid));
        }
        for spec in response.shards_to_initialize {
            if self.shards.contains_key(&spec.uuid) {
                continue;
            }
            if let Err(e) = self.initialize_shard(spec.clone()) {
                warn!(shard = %spec.uuid, error = %e, "failed to initialize shard");
            }
        }
        for split in response.shards_to_split {
            self.dispatch_split(split);
        }
    }

    /// Forwards a coordinator-decided split to the source shard's worker.
    /// Best-effort: a missing shard or a failed send is retried by the
    /// coordinator re-issuing the instruction.
    fn dispatch_split(&self, split: ShardToSplit) {
        let Some(slot) = self.shards.get(&split.uuid_mapping.parent) else {
            warn!(shard = %split.uuid_mapping.parent, "split target not hosted here");
            return;
        };
        let request = SplitRequest {
            split_key: split.split_key,
            old_shard_version: split.old_shard_version,
            new_lhs_shard_version: split.new_lhs_shard_version,
            new_rhs_shard_version: split.new_rhs_shard_version,
            uuid_mapping: split.uuid_mapping,
        };
        let _ = self.workers[slot.worker]
            .sender
            .send(WorkerMsg::Split(slot.shard.clone(), request));
    }

    /// Installs successors of completed splits and updates the local
    /// routing table.
    fn drain_events(&self) {
        loop {
            let event = match self.events_rx.lock().unwrap().try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            match event {
                ManagerEvent::SplitPerformed {
                    mapping,
                    split_key,
                    data,
                } => {
                    let label = data.primary_label;
                    match Shard::from_split_data(
                        mapping.rhs,
                        self.config.shard_config.clone(),
                        data,
                        self.ctx.clone(),
                    ) {
                        Ok(rhs) => {
                            self.register_shard(rhs);
                            let placement = ShardPlacement {
                                uuid: mapping.rhs,
                                address: Address::new(
                                    self.config.address.ip,
                                    self.config.address.port,
                                    mapping.rhs,
                                ),
                                status: PlacementStatus::Ready,
                            };
                            if let Err(e) = self.shard_map.split_shard(
                                self.shard_map.version(),
                                label,
                                split_key,
                                vec![placement],
                            ) {
                                warn!(error = %e, "local shard map update lost a race");
                            }
                        }
                        Err(e) => {
                            warn!(parent = %mapping.parent, error = %e, "failed to install split successor");
                        }
                    }
                }
                ManagerEvent::SplitFailed { mapping, error } => {
                    warn!(parent = %mapping.parent, error, "split request failed");
                }
            }
        }
    }

    /// Spawns the periodic cron loop.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("shard-manager-cron".to_string())
            .spawn(move || {
                while !manager.shutdown.load(Ordering::Acquire) {
                    let interval = manager.run_cron_once();
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn shard manager cron");
        *self.cron_handle.lock().unwrap() = Some(handle);
    }

    /// Stops the cron loop and drains the workers.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            let _ = worker.sender.send(WorkerMsg::ShutDown);
        }
        if let Some(handle) = self.cron_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        for worker in &self.workers {
            if let Some(handle) = worker.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        info!("shard manager shut down");
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            self.shut_down();
        }
    }
}

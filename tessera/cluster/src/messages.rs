//! Messages exchanged between shard managers and the coordinator.
//!
//! Wire framing is a transport concern; these types only define the
//! payloads. Routed application messages stay opaque bytes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tessera_common::types::LabelId;
use tessera_storage::PrimaryKey;
use tessera_transaction::Timestamp;
use uuid::Uuid;

/// A network endpoint plus the shard (or service) the message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    pub uuid: Uuid,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16, uuid: Uuid) -> Self {
        Self { ip, port, uuid }
    }

    /// The same endpoint, targeting a different shard.
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.uuid)
    }
}

/// A shard's proposal to split itself, carried in heartbeats until the
/// coordinator decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedSplitInfo {
    pub uuid: Uuid,
    pub shard_version: Timestamp,
    pub split_key: PrimaryKey,
}

/// Parent-to-successor uuid assignment for one split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidMapping {
    pub parent: Uuid,
    pub rhs: Uuid,
}

/// Coordinator's instruction to host a new (empty) shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardToInitialize {
    pub uuid: Uuid,
    pub label_id: LabelId,
    pub min_key: PrimaryKey,
}

/// Coordinator's instruction to split a hosted shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardToSplit {
    pub uuid_mapping: UuidMapping,
    pub split_key: PrimaryKey,
    pub old_shard_version: Timestamp,
    pub new_lhs_shard_version: Timestamp,
    pub new_rhs_shard_version: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub from: Address,
    /// Shards this node initialized but the coordinator has not yet
    /// confirmed.
    pub initialized_shards: Vec<Uuid>,
    pub suggested_splits: Vec<SuggestedSplitInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// The receiver is not the leader; retry against this address.
    pub retry_leader: Option<Address>,
    pub success: bool,
    pub acknowledged_initialized: Vec<Uuid>,
    pub shards_to_initialize: Vec<ShardToInitialize>,
    pub shards_to_split: Vec<ShardToSplit>,
}

/// The split instruction as written to the source shard's worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub split_key: PrimaryKey,
    pub old_shard_version: Timestamp,
    pub new_lhs_shard_version: Timestamp,
    pub new_rhs_shard_version: Timestamp,
    pub uuid_mapping: UuidMapping,
}

/// An application message routed to a shard. The payload is opaque to the
/// coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMessage {
    pub message: Vec<u8>,
    pub request_id: u64,
    pub to: Address,
    pub from: Address,
}

/// Top-level message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    SplitRequest(SplitRequest),
    Route(RouteMessage),
    ShutDown,
    Cron,
}

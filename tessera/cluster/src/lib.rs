//! Cluster coordination for the tessera storage engine: the versioned
//! shard map, the request/response transport seam, and the per-node shard
//! manager that multiplexes shards over a worker pool and drives online
//! splits.

pub mod error;
pub mod manager;
pub mod messages;
pub mod shard_map;
pub mod transport;

pub use error::{ClusterError, ClusterResult};
pub use manager::{RouteHandler, ShardManager, ShardManagerConfig};
pub use messages::{
    Address, HeartbeatRequest, HeartbeatResponse, Message, RouteMessage, ShardToInitialize,
    ShardToSplit, SplitRequest, SuggestedSplitInfo, UuidMapping,
};
pub use shard_map::{PlacementStatus, ShardMap, ShardPlacement};
pub use transport::{LocalTransport, PollOutcome, ResponseFuture, Transport};

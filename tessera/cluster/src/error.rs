use tessera_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Error, Debug)]
pub enum ClusterError {
    /// A routing decision was made against an older shard-map version than
    /// the current one.
    #[error("stale shard map: decision at version {acted_on}, current {current}")]
    StaleShardMap { acted_on: u64, current: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("no shard {0} on this node")]
    UnknownShard(Uuid),

    #[error("shard manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

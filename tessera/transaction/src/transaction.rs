//! Transaction trait and related types.

use serde::{Deserialize, Serialize};
use tessera_common::types::CommandId;

use crate::timestamp::Timestamp;

/// Isolation level for transactions. Snapshot isolation is the only
/// supported variant; the visibility logic honors exactly what exists here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see the consistent snapshot taken at the start timestamp.
    #[default]
    Snapshot,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Core operations every transaction supports, independent of the backing
/// store.
pub trait Transaction: Send + Sync {
    /// The error type for transaction operations.
    type Error;

    /// Get the transaction ID.
    fn txn_id(&self) -> Timestamp;

    /// Get the start timestamp of the transaction.
    fn start_ts(&self) -> Timestamp;

    /// Get the commit timestamp, if the transaction has committed.
    fn commit_ts(&self) -> Option<Timestamp>;

    /// Current command id; commands within one transaction are totally
    /// ordered.
    fn command_id(&self) -> CommandId;

    /// Get the isolation level of the transaction.
    fn isolation_level(&self) -> IsolationLevel;

    /// Commit the transaction, returning the commit timestamp on success.
    fn commit(&self) -> Result<Timestamp, Self::Error>;

    /// Abort the transaction and roll back all changes.
    fn abort(&self) -> Result<(), Self::Error>;
}

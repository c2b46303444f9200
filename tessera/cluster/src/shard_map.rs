//! Process-global mapping from `(label, primary key)` to responsible
//! shards.
//!
//! The map is versioned; every structural change (split, reassignment)
//! bumps the version, and routing decisions made against a strictly older
//! version are rejected by the shards they reach.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tessera_common::types::LabelId;
use tessera_storage::PrimaryKey;
use uuid::Uuid;

use crate::error::{ClusterError, ClusterResult};
use crate::messages::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStatus {
    /// Assigned but not yet confirmed up.
    Pending,
    Ready,
}

/// One replica placement of a shard range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub uuid: Uuid,
    pub address: Address,
    pub status: PlacementStatus,
}

/// Versioned `(label, min key) → placements` routing table. Range entries
/// are keyed by their inclusive minimum primary key; a key routes to the
/// greatest entry at or below it.
#[derive(Debug, Default)]
pub struct ShardMap {
    version: AtomicU64,
    ranges: RwLock<HashMap<LabelId, BTreeMap<PrimaryKey, Vec<ShardPlacement>>>>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Installs a label's initial range entry (its whole keyspace).
    pub fn initialize_label(
        &self,
        label: LabelId,
        min_key: PrimaryKey,
        placements: Vec<ShardPlacement>,
    ) -> u64 {
        let mut ranges = self.ranges.write().unwrap();
        ranges.entry(label).or_default().insert(min_key, placements);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The placements responsible for `key`, by lower-bound lookup on the
    /// label's ordered map.
    pub fn get_shard_for_key(&self, label: LabelId, key: &PrimaryKey) -> Option<ShardPlacement> {
        let ranges = self.ranges.read().unwrap();
        let label_ranges = ranges.get(&label)?;
        label_ranges
            .range::<PrimaryKey, _>(..=key.clone())
            .next_back()
            .and_then(|(_, placements)| placements.first().cloned())
    }

    /// Every placement whose range intersects `[lo, hi)`.
    pub fn get_shards_for_range(
        &self,
        label: LabelId,
        lo: &PrimaryKey,
        hi: &PrimaryKey,
    ) -> Vec<ShardPlacement> {
        let ranges = self.ranges.read().unwrap();
        let Some(label_ranges) = ranges.get(&label) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        // The entry covering `lo` starts at or below it.
        if let Some((_, placements)) = label_ranges.range::<PrimaryKey, _>(..=lo.clone()).next_back()
        {
            result.extend(placements.iter().cloned());
        }
        for (min_key, placements) in label_ranges.range::<PrimaryKey, _>(lo.clone()..) {
            if min_key == lo {
                continue; // already covered above
            }
            if *min_key >= *hi {
                break;
            }
            result.extend(placements.iter().cloned());
        }
        result
    }

    /// Atomically replaces the range entry covering `split_key` with two
    /// entries iff `prev_version` matches the current version. The new
    /// right-hand entry starts at `split_key` and points at `rhs`.
    pub fn split_shard(
        &self,
        prev_version: u64,
        label: LabelId,
        split_key: PrimaryKey,
        rhs: Vec<ShardPlacement>,
    ) -> ClusterResult<u64> {
        let mut ranges = self.ranges.write().unwrap();
        let current = self.version.load(Ordering::Acquire);
        if current != prev_version {
            return Err(ClusterError::StaleShardMap {
                acted_on: prev_version,
                current,
            });
        }
        let label_ranges = ranges
            .get_mut(&label)
            .ok_or(ClusterError::StaleShardMap {
                acted_on: prev_version,
                current,
            })?;
        label_ranges.insert(split_key, rhs);
        let new_version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::num::NonZeroU32;

    use tessera_common::value::PropertyValue;

    use super::*;

    fn label() -> LabelId {
        NonZeroU32::new(1).unwrap()
    }

    fn placement(n: u8) -> ShardPlacement {
        ShardPlacement {
            uuid: Uuid::from_u128(n as u128),
            address: Address::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                7000 + n as u16,
                Uuid::from_u128(n as u128),
            ),
            status: PlacementStatus::Ready,
        }
    }

    fn key(n: i64) -> PrimaryKey {
        vec![PropertyValue::Int(n)]
    }

    #[test]
    fn routes_by_lower_bound() {
        let map = ShardMap::new();
        map.initialize_label(label(), Vec::new(), vec![placement(1)]);
        let v = map.version();
        map.split_shard(v, label(), key(10), vec![placement(2)]).unwrap();

        assert_eq!(map.get_shard_for_key(label(), &key(5)).unwrap().uuid.as_u128(), 1);
        assert_eq!(map.get_shard_for_key(label(), &key(10)).unwrap().uuid.as_u128(), 2);
        assert_eq!(map.get_shard_for_key(label(), &key(99)).unwrap().uuid.as_u128(), 2);
    }

    #[test]
    fn version_gates_splits() {
        let map = ShardMap::new();
        map.initialize_label(label(), Vec::new(), vec![placement(1)]);
        let v = map.version();
        map.split_shard(v, label(), key(10), vec![placement(2)]).unwrap();
        // A second split against the old version is rejected.
        let err = map
            .split_shard(v, label(), key(20), vec![placement(3)])
            .unwrap_err();
        assert!(matches!(err, ClusterError::StaleShardMap { .. }));
    }

    #[test]
    fn range_lookup_spans_entries() {
        let map = ShardMap::new();
        map.initialize_label(label(), Vec::new(), vec![placement(1)]);
        map.split_shard(map.version(), label(), key(10), vec![placement(2)])
            .unwrap();
        map.split_shard(map.version(), label(), key(20), vec![placement(3)])
            .unwrap();

        let hits = map.get_shards_for_range(label(), &key(5), &key(15));
        let uuids: Vec<u128> = hits.iter().map(|p| p.uuid.as_u128()).collect();
        assert_eq!(uuids, vec![1, 2]);

        let all = map.get_shards_for_range(label(), &key(0), &key(100));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn version_increases_monotonically() {
        let map = ShardMap::new();
        let v1 = map.initialize_label(label(), Vec::new(), vec![placement(1)]);
        let v2 = map
            .split_shard(v1, label(), key(10), vec![placement(2)])
            .unwrap();
        assert!(v2 > v1);
    }
}

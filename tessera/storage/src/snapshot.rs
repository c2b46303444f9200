//! Point-in-time shard snapshots.
//!
//! A snapshot is a dump of all live vertex/edge state plus the name-id
//! mapper, schemas, and index definitions, tagged with an upper timestamp
//! and the WAL position it covers. Recovery is
//! replay-from-snapshot-then-apply-WAL; WAL entries at or before the
//! snapshot's cut are skipped.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tessera_common::types::{LabelId, PropertyId};
use tessera_transaction::Timestamp;
use tracing::{debug, info};

use crate::error::{SnapshotError, StorageError, StorageResult};
use crate::model::{Edge, PrimaryKeySchema, Vertex};
use crate::name_mapper::NameBindings;
use crate::shard::index::{LabelIndexKey, LabelPropertyIndexKey};
use crate::shard::mvcc::{VersionedEdge, VersionedVertex};
use crate::shard::{KeyRange, Shard};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

/// Serialized snapshot contents.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub primary_label: LabelId,
    pub key_range: KeyRange,
    pub version: Timestamp,
    /// Latest commit timestamp covered by this snapshot. Restored objects
    /// are stamped with it; the recovered clock starts past it.
    pub upper_ts: Timestamp,
    /// WAL records with `lsn <= wal_upto_lsn` are contained in the
    /// snapshot and skipped on replay.
    pub wal_upto_lsn: u64,
    pub names: NameBindings,
    pub schemas: Vec<PrimaryKeySchema>,
    pub label_indexes: Vec<LabelId>,
    pub label_property_indexes: Vec<(LabelId, PropertyId)>,
    pub vertices: Vec<Vertex>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub max_snapshots: usize,
    /// How long `create` waits for active transactions to drain before
    /// giving up with `SnapshotError::Timeout`.
    pub txn_drain_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("snapshots"),
            prefix: "shard".to_string(),
            max_snapshots: 3,
            txn_drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SnapshotManager {
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    fn snapshot_path(&self, upper_ts: Timestamp) -> PathBuf {
        self.config
            .directory
            .join(format!("{}_{:020}.snapshot", self.config.prefix, upper_ts.raw()))
    }

    /// Dumps the shard's committed state. Requires the shard to quiesce:
    /// waits for active transactions to drain, then freezes commits for
    /// the duration of the dump.
    pub fn create(&self, shard: &Shard) -> StorageResult<PathBuf> {
        let deadline = Instant::now() + self.config.txn_drain_timeout;
        while shard.txn_manager().active_count() > 0 {
            if Instant::now() >= deadline {
                return Err(StorageError::Snapshot(SnapshotError::Timeout));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _commit_guard = shard.txn_manager().commit_latch();

        let mut upper_ts = shard.txn_manager().latest_commit_ts();
        if upper_ts == Timestamp::ZERO {
            upper_ts = shard.hlc().current();
        }

        let mut vertices = Vec::with_capacity(shard.vertex_count());
        for slot in shard.vertices.iter() {
            let current = slot.value().chain.current.read().unwrap();
            if current.commit_ts.is_commit_ts() && !current.data.is_tombstone() {
                vertices.push(current.data.clone());
            }
        }
        let mut edges = Vec::new();
        for slot in shard.edges.iter() {
            let current = slot.value().chain.current.read().unwrap();
            if current.commit_ts.is_commit_ts() && !current.data.is_tombstone() {
                edges.push(current.data.clone());
            }
        }

        let snapshot = ShardSnapshot {
            primary_label: shard.primary_label(),
            key_range: shard.key_range(),
            version: shard.version(),
            upper_ts,
            wal_upto_lsn: shard.wal_manager().map(|w| w.last_lsn()).unwrap_or(0),
            names: shard.name_mapper().dump(),
            schemas: shard.schemas.dump(),
            label_indexes: shard
                .label_index
                .registered
                .read()
                .unwrap()
                .iter()
                .copied()
                .collect(),
            label_property_indexes: shard
                .label_property_index
                .registered
                .read()
                .unwrap()
                .iter()
                .copied()
                .collect(),
            vertices,
            edges,
        };

        fs::create_dir_all(&self.config.directory)
            .map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
        let path = self.snapshot_path(upper_ts);
        let payload = postcard::to_allocvec(&snapshot)
            .map_err(|e| StorageError::Snapshot(SnapshotError::SerializationFailed(e.to_string())))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        let mut file =
            fs::File::create(&path).map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
        file.write_all(&data)
            .map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
        file.sync_data()
            .map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;

        self.prune()?;
        info!(path = %path.display(), upper_ts = upper_ts.raw(), "snapshot created");
        Ok(path)
    }

    fn list_snapshots(&self) -> StorageResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let dir = match fs::read_dir(&self.config.directory) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(StorageError::Snapshot(SnapshotError::Io(e))),
        };
        for entry in dir {
            let entry = entry.map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&self.config.prefix) && name.ends_with(".snapshot") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn prune(&self) -> StorageResult<()> {
        let paths = self.list_snapshots()?;
        if paths.len() > self.config.max_snapshots {
            for stale in &paths[..paths.len() - self.config.max_snapshots] {
                debug!(path = %stale.display(), "pruning old snapshot");
                let _ = fs::remove_file(stale);
            }
        }
        Ok(())
    }

    /// Loads the newest snapshot, verifying its checksum. Corruption is
    /// fatal, not silently skipped.
    pub fn load_latest(&self) -> StorageResult<Option<ShardSnapshot>> {
        let Some(path) = self.list_snapshots()?.pop() else {
            return Ok(None);
        };
        Ok(Some(read_snapshot(&path)?))
    }
}

fn read_snapshot(path: &Path) -> StorageResult<ShardSnapshot> {
    let mut file = fs::File::open(path).map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)
        .map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)
        .map_err(|e| StorageError::Snapshot(SnapshotError::Io(e)))?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != checksum {
        return Err(StorageError::Snapshot(SnapshotError::ChecksumMismatch));
    }
    postcard::from_bytes(&payload)
        .map_err(|e| StorageError::Snapshot(SnapshotError::DeserializationFailed(e.to_string())))
}

/// Installs snapshot contents into a fresh shard. Returns the WAL cut:
/// records at or before it are already reflected.
pub(crate) fn apply_snapshot(shard: &Arc<Shard>, snapshot: ShardSnapshot) -> StorageResult<u64> {
    shard.name_mapper().restore(&snapshot.names);
    for schema in snapshot.schemas {
        shard.schemas.create(schema)?;
    }
    for label in &snapshot.label_indexes {
        shard.label_index.register(*label);
    }
    for (label, property) in &snapshot.label_property_indexes {
        shard.label_property_index.register(*label, *property);
    }

    let upper_ts = snapshot.upper_ts;
    for vertex in snapshot.vertices {
        // Rebuild index entries from the restored state rather than
        // persisting them.
        for label in vertex.labels.clone() {
            if shard.label_index.is_registered(label) {
                shard.label_index.backfill(
                    LabelIndexKey {
                        label,
                        pk: vertex.pk.clone(),
                    },
                    upper_ts,
                );
            }
            for (property, value) in vertex.properties.iter() {
                if shard.label_property_index.is_registered(label, property) {
                    shard.label_property_index.backfill(
                        LabelPropertyIndexKey {
                            label,
                            property,
                            value: value.clone(),
                            pk: vertex.pk.clone(),
                        },
                        upper_ts,
                    );
                }
            }
        }
        shard
            .vertices
            .insert(vertex.pk.clone(), VersionedVertex::committed(vertex, upper_ts));
    }
    for edge in snapshot.edges {
        shard
            .edges
            .insert(edge.key(), VersionedEdge::committed(edge, upper_ts));
    }

    *shard.key_range.write().unwrap() = snapshot.key_range;
    *shard.version.write().unwrap() = snapshot.version;
    shard.hlc().update_if_greater(upper_ts)?;
    shard.txn_manager().record_commit(upper_ts);
    Ok(snapshot.wal_upto_lsn)
}

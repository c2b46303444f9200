//! Append-only write-ahead log for one shard.
//!
//! Log record layout (little-endian):
//! ┌────────────┬────────────┬───────────┐
//! │ u32 len    │ u32 crc32  │ payload…  │
//! └────────────┴────────────┴───────────┘
//! - `len`    : number of bytes in payload
//! - `crc32`  : checksum of payload for corruption detection

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tessera_common::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use tessera_common::value::PropertyValue;
use tessera_transaction::Timestamp;

use super::{LogRecord, ShardWal};
use crate::error::{StorageError, StorageResult, WalError};
use crate::model::{EdgeKey, PrimaryKey, SchemaProperty, VertexKey};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

/// One WAL record. Transaction-scoped operations carry the owning
/// transaction id; admin operations (index/schema) carry
/// [`Timestamp::ZERO`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedoEntry {
    pub lsn: u64,
    pub txn_id: Timestamp,
    pub op: Operation,
}

/// Forward operations, replayed through the normal shard methods on
/// recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Begin {
        start_ts: Timestamp,
    },
    Commit {
        commit_ts: Timestamp,
    },
    CreateVertex {
        labels: Vec<LabelId>,
        pk: PrimaryKey,
        properties: Vec<(PropertyId, PropertyValue)>,
    },
    DeleteVertex {
        pk: PrimaryKey,
    },
    AddLabel {
        pk: PrimaryKey,
        label: LabelId,
    },
    RemoveLabel {
        pk: PrimaryKey,
        label: LabelId,
    },
    SetVertexProperty {
        pk: PrimaryKey,
        property: PropertyId,
        value: PropertyValue,
    },
    CreateEdge {
        src: PrimaryKey,
        dst: VertexKey,
        edge_type: EdgeTypeId,
        gid: Gid,
    },
    DeleteEdge {
        key: EdgeKey,
    },
    SetEdgeProperty {
        key: EdgeKey,
        property: PropertyId,
        value: PropertyValue,
    },
    CreateIndex {
        label: LabelId,
        property: Option<PropertyId>,
    },
    DropIndex {
        label: LabelId,
        property: Option<PropertyId>,
    },
    CreateSchema {
        label: LabelId,
        properties: Vec<SchemaProperty>,
    },
    DropSchema {
        label: LabelId,
    },
}

impl Operation {
    /// The primary key deciding which split successor a buffered record
    /// follows; `None` for markers and admin records, which stay put.
    pub(crate) fn partition_key(&self) -> Option<&PrimaryKey> {
        match self {
            Operation::CreateVertex { pk, .. }
            | Operation::DeleteVertex { pk }
            | Operation::AddLabel { pk, .. }
            | Operation::RemoveLabel { pk, .. }
            | Operation::SetVertexProperty { pk, .. } => Some(pk),
            Operation::CreateEdge { src, .. } => Some(src),
            Operation::DeleteEdge { key } | Operation::SetEdgeProperty { key, .. } => {
                Some(&key.src)
            }
            _ => None,
        }
    }
}

impl LogRecord for RedoEntry {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| StorageError::Wal(WalError::SerializationFailed(e.to_string())))
    }

    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| StorageError::Wal(WalError::DeserializationFailed(e.to_string())))
    }
}

/// Write-ahead log in append-only mode.
pub struct FileWal {
    file: BufWriter<File>,
    path: PathBuf,
}

impl FileWal {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ShardWal for FileWal {
    type Record = RedoEntry;

    /// Open existing log or create a new one at `path`.
    fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&path)
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        file.seek(SeekFrom::End(0))
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        Ok(Self {
            file: BufWriter::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Append a record and buffer it. Call `flush` to fsync.
    ///
    /// The record is written in a single operation; if the write fails the
    /// file is truncated back to its previous length so a partial record
    /// never survives.
    fn append(&mut self, record: &Self::Record) -> StorageResult<()> {
        let payload = record.to_bytes()?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        let len = payload.len() as u32;

        let original_pos = self
            .file
            .stream_position()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        match self.file.write_all(&data) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.file
                    .seek(SeekFrom::Start(original_pos))
                    .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
                self.file
                    .get_ref()
                    .set_len(original_pos)
                    .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
                Err(StorageError::Wal(WalError::Io(e)))
            }
        }
    }

    /// Flush internal buffer and fsync to guarantee durability.
    fn flush(&mut self) -> StorageResult<()> {
        self.file
            .flush()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))
    }

    /// Read every record from the start of the file, verifying checksums.
    fn read_all(&self) -> StorageResult<Vec<RedoEntry>> {
        let mut reader = self
            .file
            .get_ref()
            .try_clone()
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

        let mut records = Vec::new();
        let mut header = [0u8; HEADER_SIZE];
        loop {
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StorageError::Wal(WalError::Io(e))),
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let mut payload = vec![0u8; len];
            reader
                .read_exact(&mut payload)
                .map_err(|e| StorageError::Wal(WalError::Io(e)))?;

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != checksum {
                return Err(StorageError::Wal(WalError::ChecksumMismatch));
            }
            records.push(RedoEntry::from_bytes(&payload)?);
        }
        Ok(records)
    }
}

/// Owns the shard's WAL file plus the log-sequence-number counter.
pub struct WalManager {
    wal: RwLock<FileWal>,
    next_lsn: AtomicU64,
}

impl WalManager {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Ok(Self {
            wal: RwLock::new(FileWal::open(path)?),
            next_lsn: AtomicU64::new(1),
        })
    }

    pub fn wal(&self) -> &RwLock<FileWal> {
        &self.wal
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn.fetch_add(1, Ordering::SeqCst)
    }

    /// Bump the counter past a recovered record's lsn.
    pub fn observe_lsn(&self, lsn: u64) {
        self.next_lsn.fetch_max(lsn + 1, Ordering::SeqCst);
    }

    /// The last lsn handed out, 0 when the log is empty.
    pub fn last_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }
}

//! C2 — content-addressed stream store (§4.2).
//!
//! Blobs are stored as files under `<database-dir>/Streams/<hex-hash>`
//! rather than inside the embedded store; only the small `binary_content`
//! row (refcount, codec, raw size, hash) lives in the store (§6).

pub mod codec;

use crate::core::{Result, SettingsError};
use crate::store::{Snapshot, Table, TransactionId};
use codec::{Codec, choose_codec, codec_for};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub type StreamId = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRow {
    pub stream_id: StreamId,
    pub refcount: u32,
    pub delta_from_id: Option<StreamId>,
    pub codec: Codec,
    pub raw_size: u32,
    pub hash: [u8; 32],
}

/// Content-addressed blob table. `write` is idempotent per hash (§4.2):
/// a second write of the same bytes increments the existing row's
/// refcount rather than storing a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStore {
    table: Table<StreamRow>,
    by_hash: OrdMap<[u8; 32], StreamId>,
    streams_dir: PathBuf,
    #[serde(skip)]
    pending_deletes: Vec<StreamId>,
}

impl StreamStore {
    pub fn new(streams_dir: impl Into<PathBuf>) -> Self {
        StreamStore {
            table: Table::new(),
            by_hash: OrdMap::new(),
            streams_dir: streams_dir.into(),
            pending_deletes: Vec::new(),
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.streams_dir)?;
        Ok(())
    }

    fn file_path(&self, hash: &[u8; 32]) -> PathBuf {
        self.streams_dir.join(hex_encode(hash))
    }

    /// Writes `bytes`, returning the stream id. If a stream with the same
    /// content hash already exists, its refcount is incremented instead.
    pub fn write(
        &mut self,
        bytes: &[u8],
        codec_threshold: usize,
        snapshot: &Snapshot,
    ) -> Result<StreamId> {
        let hash = *blake3::hash(bytes).as_bytes();

        if let Some(&existing_id) = self.by_hash.get(&hash) {
            self.bump_refcount(existing_id, 1, snapshot)?;
            return Ok(existing_id);
        }

        self.ensure_dir()?;
        let codec = choose_codec(bytes.len(), codec_threshold);
        let encoded = codec_for(codec).encode(bytes)?;

        let tmp_path = self.file_path(&hash).with_extension("tmp");
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, self.file_path(&hash))?;

        let row_id = self.table.insert(
            StreamRow {
                stream_id: 0,
                refcount: 1,
                delta_from_id: None,
                codec,
                raw_size: bytes.len() as u32,
                hash,
            },
            snapshot,
        );
        let stream_id = row_id as StreamId;
        // Back-patch the row with its own assigned id (row id is only known
        // after insert).
        self.table.update(
            row_id,
            StreamRow {
                stream_id,
                refcount: 1,
                delta_from_id: None,
                codec,
                raw_size: bytes.len() as u32,
                hash,
            },
            snapshot,
        );
        self.by_hash.insert(hash, stream_id);
        Ok(stream_id)
    }

    pub fn read(&self, stream_id: StreamId, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let row = self
            .table
            .get_visible(stream_id as u64, snapshot)
            .ok_or_else(|| SettingsError::NotFound(format!("stream {stream_id}")))?;
        let stored = fs::read(self.file_path(&row.hash))?;
        codec_for(row.codec).decode(&stored)
    }

    pub fn find_row(&self, stream_id: StreamId, snapshot: &Snapshot) -> Option<StreamRow> {
        self.table.get_visible(stream_id as u64, snapshot)
    }

    /// Increments a stream's refcount (used when a second value starts
    /// referencing an already-known blob).
    pub fn incr_refcount(&mut self, stream_id: StreamId, snapshot: &Snapshot) -> Result<u32> {
        self.bump_refcount(stream_id, 1, snapshot)
    }

    /// Decrements a stream's refcount; when it reaches zero the stream id
    /// is queued on `pending_deletes` for the handle to drain on unlock
    /// (§4.2 garbage collection — best-effort, never raises).
    pub fn decr_refcount(&mut self, stream_id: StreamId, snapshot: &Snapshot) -> Result<u32> {
        let new_count = self.bump_refcount(stream_id, -1, snapshot)?;
        if new_count == 0 {
            self.pending_deletes.push(stream_id);
        }
        Ok(new_count)
    }

    fn bump_refcount(&mut self, stream_id: StreamId, delta: i64, snapshot: &Snapshot) -> Result<u32> {
        let row = self
            .table
            .get_visible(stream_id as u64, snapshot)
            .ok_or_else(|| SettingsError::NotFound(format!("stream {stream_id}")))?;
        let new_count = (row.refcount as i64 + delta).max(0) as u32;
        let mut updated = row;
        updated.refcount = new_count;
        self.table.update(stream_id as u64, updated, snapshot);
        Ok(new_count)
    }

    /// Drains and deletes any stream files whose refcount reached zero.
    /// Individual failures are logged, not propagated (§4.2).
    pub fn drain_pending_deletes(&mut self, snapshot: &Snapshot) {
        for stream_id in self.pending_deletes.drain(..) {
            if let Some(row) = self.table.get_visible(stream_id as u64, snapshot) {
                if row.refcount == 0 {
                    let path = self.file_path(&row.hash);
                    if let Err(err) = fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(%stream_id, %err, "failed to delete stream payload");
                        }
                    }
                    self.by_hash.remove(&row.hash);
                }
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snap(tx_id: u64) -> Snapshot {
        Snapshot {
            tx_id,
            active: Arc::new(im::HashSet::new()),
            aborted: Arc::new(im::HashSet::new()),
            max_tx_id: tx_id + 1,
        }
    }

    #[test]
    fn write_is_idempotent_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StreamStore::new(dir.path().join("Streams"));
        let s1 = snap(1);
        let id1 = store.write(b"hello", 1024, &s1).unwrap();
        let s2 = snap(2);
        let id2 = store.write(b"hello", 1024, &s2).unwrap();
        assert_eq!(id1, id2);
        let row = store.find_row(id1, &s2).unwrap();
        assert_eq!(row.refcount, 2);
    }

    #[test]
    fn read_returns_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StreamStore::new(dir.path().join("Streams"));
        let s1 = snap(1);
        let id = store.write(b"hello world", 1024, &s1).unwrap();
        let read_back = store.read(id, &s1).unwrap();
        assert_eq!(read_back, b"hello world");
    }

    #[test]
    fn refcount_zero_queues_file_for_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StreamStore::new(dir.path().join("Streams"));
        let s1 = snap(1);
        let id = store.write(b"zeros", 1024, &s1).unwrap();
        let new_count = store.decr_refcount(id, &s1).unwrap();
        assert_eq!(new_count, 0);
        store.drain_pending_deletes(&s1);
        assert!(store.find_row(id, &s1).unwrap().refcount == 0);
    }
}

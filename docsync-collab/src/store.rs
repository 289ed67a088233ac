//! RocksDB-backed room store.
//!
//! Column families:
//! - `snapshots`: full room state, `encode_state_as_update_v1` (LZ4 compressed)
//! - `updates`  : incremental updates, keyed by `room \0 seq` (LZ4 compressed)
//! - `rooms`    : room metadata (bincode): initialized marker, counters, timestamps
//!
//! The relay appends every accepted update and folds them into a snapshot when
//! the last peer leaves. A room is restored as snapshot + pending updates.
//!
//! Appends go through a `WriteBatch` (update plus metadata counter) and are
//! only fsynced with `sync_writes`; a crash can lose the tail of the log,
//! which the next client handshake re-delivers. Compaction deletes the folded
//! updates in one batch, walking the room's key prefix in sequence order.
//!
//! Performance target: append <50µs, restore of 100 pending updates <5ms.
//! Reference: O'Neil et al., *The Log-Structured Merge-Tree* (1996).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::error::StoreError;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches in the given directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Set once a client has seeded the room (or it received any content).
    pub initialized: bool,
    /// Updates stored since the last compaction.
    pub update_count: u64,
    /// Sequence number the next appended update receives.
    pub next_seq: u64,
    /// Uncompressed size of the latest snapshot.
    pub snapshot_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = unix_now();
        Self {
            room: room.to_string(),
            initialized: false,
            update_count: 0,
            next_seq: 0,
            snapshot_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = unix_now();
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable storage for relay rooms.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RoomStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::info!("Room store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        // Values are already LZ4-compressed by us.
        match name {
            CF_SNAPSHOTS | CF_UPDATES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the room snapshot.
    pub fn save_snapshot(&self, room: &str, snapshot: &[u8]) -> Result<RoomMetadata, StoreError> {
        let _guard = self.write_guard();
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self.metadata(room)?.unwrap_or_else(|| RoomMetadata::new(room));
        meta.snapshot_size = snapshot.len() as u64;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, room.as_bytes(), &compressed);
        batch.put_cf(cf_rooms, room.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!("Saved snapshot for room {room}: {} -> {} bytes", snapshot.len(), compressed.len());
        Ok(meta)
    }

    pub fn load_snapshot(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, room.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append an update; returns its sequence number.
    pub fn append_update(&self, room: &str, update: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.write_guard();
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let mut meta = self.metadata(room)?.unwrap_or_else(|| RoomMetadata::new(room));
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.update_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, update_key(room, seq), lz4_flex::compress_prepend_size(update));
        batch.put_cf(cf_rooms, room.as_bytes(), meta.encode()?);
        self.write(batch)?;
        Ok(seq)
    }

    /// All stored updates of a room, in sequence order.
    pub fn load_updates(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(room);
        let mut updates = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            let Some(seq) = seq_from_key(&key, &prefix) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }
        Ok(updates)
    }

    /// Delete updates with a sequence number below `before_seq`.
    ///
    /// Call after a snapshot covering them has been saved.
    pub fn compact_updates(&self, room: &str, before_seq: u64) -> Result<u64, StoreError> {
        let _guard = self.write_guard();
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_rooms = self.cf(CF_ROOMS)?;
        let prefix = update_prefix(room);

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for item in self.db.iterator_cf(cf_updates, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            match seq_from_key(&key, &prefix) {
                Some(seq) if seq < before_seq => {
                    batch.delete_cf(cf_updates, &key);
                    removed += 1;
                }
                _ => break,
            }
        }

        if removed > 0 {
            if let Some(mut meta) = self.metadata(room)? {
                meta.update_count = meta.update_count.saturating_sub(removed);
                meta.touch();
                batch.put_cf(cf_rooms, room.as_bytes(), meta.encode()?);
            }
            self.write(batch)?;
            log::debug!("Compacted {removed} updates of room {room}");
        }
        Ok(removed)
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub fn metadata(&self, room: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .get_cf(cf, room.as_bytes())?
            .map(|bytes| RoomMetadata::decode(&bytes))
            .transpose()
    }

    /// Set the initialized marker. Idempotent.
    pub fn mark_initialized(&self, room: &str) -> Result<(), StoreError> {
        let _guard = self.write_guard();
        let cf = self.cf(CF_ROOMS)?;
        let mut meta = self.metadata(room)?.unwrap_or_else(|| RoomMetadata::new(room));
        if meta.initialized {
            return Ok(());
        }
        meta.initialized = true;
        meta.touch();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, room.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    pub fn is_initialized(&self, room: &str) -> Result<bool, StoreError> {
        Ok(self.metadata(room)?.is_some_and(|m| m.initialized))
    }

    /// Every room with metadata.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Rebuild a room document from its snapshot and pending updates.
    ///
    /// Returns `None` if nothing was ever stored for the room.
    pub fn load_room_state(&self, room: &str) -> Result<Option<Doc>, StoreError> {
        let snapshot = self.load_snapshot(room)?;
        let updates = self.load_updates(room)?;
        if snapshot.is_none() && updates.is_empty() {
            return Ok(None);
        }

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let stored = snapshot.into_iter().chain(updates.into_iter().map(|(_, u)| u));
            for bytes in stored {
                let corrupt = |reason: String| StoreError::Corrupt { room: room.to_string(), reason };
                let update = Update::decode_v1(&bytes).map_err(|e| corrupt(e.to_string()))?;
                txn.apply_update(update).map_err(|e| corrupt(e.to_string()))?;
            }
        }
        Ok(Some(doc))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RoomStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomStore").field("path", &self.config.path).finish()
    }
}

/// `room \0`; room ids never contain NUL.
fn update_prefix(room: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(room.len() + 1);
    prefix.extend_from_slice(room.as_bytes());
    prefix.push(0);
    prefix
}

fn update_key(room: &str, seq: u64) -> Vec<u8> {
    let mut key = update_prefix(room);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

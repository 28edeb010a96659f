//! RocksDB-backed fragment and snapshot store.
//!
//! Column families:
//! - `fragments`  : one record per fragment, LZ4-compressed payload
//! - `completions`: completion claim markers (value: expiry, u64 BE)
//! - `snapshots`  : latest complete messages per session (LZ4 + bincode)
//!
//! Keys are length-prefixed so that a session prefix and a message prefix
//! are both unambiguous range scans:
//! ```text
//! ┌─────┬─────────┬─────┬────────┬─────┬─────────┬─────────┐
//! │ len │ session │ len │ sender │ len │ message │ seq BE  │
//! │ u32 │  bytes  │ u32 │ bytes  │ u32 │  bytes  │ u32     │
//! └─────┴─────────┴─────┴────────┴─────┴─────────┴─────────┘
//! ```
//!
//! The database is opened by a single process; conditional writes are
//! serialized by the store's claim lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{FragmentStore, SnapshotStore, StoreError, StoredFragment};
use crate::clock::Clock;
use crate::protocol::{LogicalMessage, MessageKey};

const CF_FRAGMENTS: &str = "fragments";
const CF_COMPLETIONS: &str = "completions";
const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_FRAGMENTS, CF_COMPLETIONS, CF_SNAPSHOTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk fragment value. The sequence number lives in the key.
#[derive(Debug, Serialize, Deserialize)]
struct FragmentRecord {
    expected_count: Option<u32>,
    expires_at: u64,
    compressed: Vec<u8>,
}

impl FragmentRecord {
    fn encode(fragment: &StoredFragment) -> Result<Vec<u8>, StoreError> {
        let record = FragmentRecord {
            expected_count: fragment.expected_count,
            expires_at: fragment.expires_at,
            compressed: lz4_flex::compress_prepend_size(&fragment.payload),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn into_fragment(self, seq: u32) -> Result<StoredFragment, StoreError> {
        let payload = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(StoredFragment {
            seq,
            expected_count: self.expected_count,
            payload,
            expires_at: self.expires_at,
        })
    }
}

/// RocksDB-backed store implementing both [`FragmentStore`] and [`SnapshotStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    claim_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened relay store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            clock,
            claim_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_FRAGMENTS => {
                // Payloads are already LZ4-compressed per record
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_COMPLETIONS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Live records under `prefix` in the fragments column family.
    fn scan_fragments(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, FragmentRecord)>, StoreError> {
        let cf = self.cf(CF_FRAGMENTS)?;
        let now = self.clock.now_secs();
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let record = FragmentRecord::decode(&value)?;
            if now <= record.expires_at {
                out.push((key, record));
            }
        }
        Ok(out)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl FragmentStore for RocksStore {
    async fn put(&self, key: &MessageKey, fragment: StoredFragment) -> Result<(), StoreError> {
        let cf = self.cf(CF_FRAGMENTS)?;
        let value = FragmentRecord::encode(&fragment)?;
        self.db
            .put_cf_opt(&cf, fragment_key(key, fragment.seq), value, &self.write_opts())?;
        Ok(())
    }

    async fn get(&self, key: &MessageKey, seq: u32) -> Result<Option<StoredFragment>, StoreError> {
        let cf = self.cf(CF_FRAGMENTS)?;
        let Some(bytes) = self.db.get_cf(&cf, fragment_key(key, seq))? else {
            return Ok(None);
        };
        let record = FragmentRecord::decode(&bytes)?;
        if self.clock.now_secs() > record.expires_at {
            return Ok(None);
        }
        record.into_fragment(seq).map(Some)
    }

    async fn count_data(&self, key: &MessageKey) -> Result<usize, StoreError> {
        let prefix = set_prefix(key);
        let records = self.scan_fragments(&prefix)?;
        Ok(records
            .iter()
            .filter(|(k, _)| seq_of(k, prefix.len()).is_some_and(|seq| seq >= 1))
            .count())
    }

    async fn query_data(&self, key: &MessageKey) -> Result<Vec<StoredFragment>, StoreError> {
        let prefix = set_prefix(key);
        let mut fragments = Vec::new();
        for (k, record) in self.scan_fragments(&prefix)? {
            match seq_of(&k, prefix.len()) {
                Some(seq) if seq >= 1 => fragments.push(record.into_fragment(seq)?),
                _ => {}
            }
        }
        // Big-endian sequence suffix keeps the scan ordered already
        Ok(fragments)
    }

    async fn query_by_session(&self, session_id: &str) -> Result<Vec<MessageKey>, StoreError> {
        let cf = self.cf(CF_FRAGMENTS)?;
        let prefix = session_prefix(session_id);
        let mut keys: Vec<MessageKey> = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some((message_key, _)) = decode_fragment_key(&key) else {
                continue;
            };
            if keys.last() != Some(&message_key) {
                keys.push(message_key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn claim_completion(&self, key: &MessageKey, expires_at: u64) -> Result<bool, StoreError> {
        let cf = self.cf(CF_COMPLETIONS)?;
        let marker_key = set_prefix(key);
        let _guard = self
            .claim_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("claim lock poisoned".into()))?;

        if let Some(bytes) = self.db.get_cf(&cf, &marker_key)? {
            if decode_u64(&bytes).is_some_and(|marker| self.clock.now_secs() <= marker) {
                return Ok(false);
            }
        }
        self.db
            .put_cf_opt(&cf, &marker_key, expires_at.to_be_bytes(), &self.write_opts())?;
        Ok(true)
    }

    async fn delete_set(&self, key: &MessageKey) -> Result<usize, StoreError> {
        let cf = self.cf(CF_FRAGMENTS)?;
        let prefix = set_prefix(key);
        let mut batch = WriteBatch::default();
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !k.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf, &k);
            count += 1;
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_secs();
        let cf_fragments = self.cf(CF_FRAGMENTS)?;
        let cf_completions = self.cf(CF_COMPLETIONS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0;

        for item in self.db.iterator_cf(&cf_fragments, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let expired = FragmentRecord::decode(&value).map_or(true, |r| now > r.expires_at);
            if expired {
                batch.delete_cf(&cf_fragments, &key);
                count += 1;
            }
        }

        for item in self.db.iterator_cf(&cf_completions, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if decode_u64(&value).map_or(true, |marker| now > marker) {
                batch.delete_cf(&cf_completions, &key);
                count += 1;
            }
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }
}

#[async_trait]
impl SnapshotStore for RocksStore {
    async fn get(&self, session_id: &str) -> Result<Vec<LogicalMessage>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, session_id.as_bytes())? else {
            return Ok(Vec::new());
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (messages, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(messages)
    }

    async fn put(&self, session_id: &str, messages: Vec<LogicalMessage>) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        if messages.is_empty() {
            self.db.delete_cf_opt(&cf, session_id.as_bytes(), &self.write_opts())?;
            return Ok(());
        }
        let bytes = bincode::serde::encode_to_vec(&messages, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);
        self.db
            .put_cf_opt(&cf, session_id.as_bytes(), compressed, &self.write_opts())?;
        Ok(())
    }
}

// ─── Key encoding ─────────────────────────────────────────────────────

fn push_part(buf: &mut Vec<u8>, part: &str) {
    buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
    buf.extend_from_slice(part.as_bytes());
}

fn session_prefix(session_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + session_id.len());
    push_part(&mut key, session_id);
    key
}

fn set_prefix(key: &MessageKey) -> Vec<u8> {
    let mut buf = session_prefix(&key.session_id);
    push_part(&mut buf, &key.sender_id);
    push_part(&mut buf, &key.message_id);
    buf
}

fn fragment_key(key: &MessageKey, seq: u32) -> Vec<u8> {
    let mut buf = set_prefix(key);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf
}

fn read_part(bytes: &[u8], pos: &mut usize) -> Option<String> {
    let len_bytes: [u8; 4] = bytes.get(*pos..*pos + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = *pos + 4;
    let part = bytes.get(start..start + len)?;
    *pos = start + len;
    String::from_utf8(part.to_vec()).ok()
}

fn decode_fragment_key(bytes: &[u8]) -> Option<(MessageKey, u32)> {
    let mut pos = 0;
    let session_id = read_part(bytes, &mut pos)?;
    let sender_id = read_part(bytes, &mut pos)?;
    let message_id = read_part(bytes, &mut pos)?;
    let seq = seq_of(bytes, pos)?;
    Some((MessageKey::new(session_id, sender_id, message_id), seq))
}

fn seq_of(key: &[u8], prefix_len: usize) -> Option<u32> {
    let seq_bytes: [u8; 4] = key.get(prefix_len..)?.try_into().ok()?;
    Some(u32::from_be_bytes(seq_bytes))
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

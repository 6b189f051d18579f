//! Content-addressed result cache on RocksDB.
//!
//! Keys are `"{sha256(sql)}.{kind}"`; values are bincode-encoded
//! [`CacheEntry`] records compressed with LZ4. Without a configured
//! directory the store lives in a temporary directory that is removed when
//! the cache is dropped.

use rocksdb::{BlockBasedOptions, Cache, DBCompressionType, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tempfile::TempDir;

use crate::error::EngineError;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory (None = temporary directory)
    pub path: Option<PathBuf>,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every write (default: false)
    pub sync_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl CacheConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

/// A cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Wire kind the payload was produced for (`arrow`, `json`)
    pub kind: String,
    /// `None` for results without data
    pub payload: Option<Vec<u8>>,
    /// Seconds since epoch
    pub stored_at: u64,
}

impl CacheEntry {
    pub fn new(kind: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            stored_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::Cache(format!("encode: {e}")))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| EngineError::Cache(format!("decompress: {e}")))?;
        let (entry, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| EngineError::Cache(format!("decode: {e}")))?;
        Ok(entry)
    }
}

/// Cache key for a statement and result kind.
pub fn cache_key(sql: &str, kind: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    let mut key = String::with_capacity(digest.len() * 2 + kind.len() + 1);
    for byte in digest.iter() {
        key.push_str(&format!("{byte:02x}"));
    }
    key.push('.');
    key.push_str(kind);
    key
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

pub struct ResultCache {
    db: DB,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    /// Keeps a temporary directory alive for the cache lifetime
    _temp_dir: Option<TempDir>,
}

impl ResultCache {
    pub fn open(config: CacheConfig) -> Result<Self, EngineError> {
        let (path, temp_dir) = match &config.path {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                (path.clone(), None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("sqlroom-cache-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_keep_log_file_num(2);
        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DB::open(&opts, &path)?;
        log::info!("Result cache opened at {}", path.display());

        Ok(Self {
            db,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            _temp_dir: temp_dir,
        })
    }

    /// Cache in a fresh temporary directory.
    pub fn open_temporary() -> Result<Self, EngineError> {
        Self::open(CacheConfig::default())
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheEntry::decode(&bytes)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), EngineError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_opt(key.as_bytes(), entry.encode()?, &write_opts)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), EngineError> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

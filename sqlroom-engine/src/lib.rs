//! # sqlroom-engine: concurrent query runtime over an embedded database
//!
//! ```text
//!  ┌───────────────┐   execute(QueryRequest)   ┌──────────────────┐
//!  │ QueryExecutor │ ────────────────────────► │ SessionRegistry  │
//!  │ cache + retry │                           │ cursors, cancel  │
//!  └──────┬────────┘                           └────────┬─────────┘
//!         │                                             │
//!         ▼                                             ▼
//!  ┌─────────────┐                              ┌──────────────┐
//!  │ ResultCache │                              │ WorkerPool   │
//!  │ (RocksDB)   │                              │ (N threads)  │
//!  └─────────────┘                              └──────┬───────┘
//!                                                      ▼
//!                                               ┌──────────────┐
//!                                               │ Database     │
//!                                               │ (SQLite)     │
//!                                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: submit/cancel/shutdown bookkeeping
//! - [`executor`]: request dispatch, single-flight caching, conflict retry
//! - [`database`]: root connection and per-query cursors
//! - [`pool`]: bounded blocking worker pool
//! - [`retry`]: backoff policy
//! - [`cache`]: content-addressed result cache
//! - [`results`]: Arrow IPC and JSON encodings
//! - [`meta`]: server metadata tables

pub mod cache;
pub mod database;
pub mod error;
pub mod executor;
pub mod meta;
pub mod pool;
pub mod registry;
pub mod results;
pub mod retry;

pub use cache::{cache_key, CacheConfig, CacheEntry, CacheStats, ResultCache};
pub use database::{
    sqlite_version, Attachment, CancelHandle, Cursor, Database, DatabaseConfig, MEMORY_PATH,
};
pub use error::EngineError;
pub use executor::{QueryExecutor, QueryKind, QueryOutcome, QueryRequest};
pub use meta::{MetaConfig, MetaStorage, DEFAULT_NAMESPACE};
pub use pool::{PoolConfig, WorkerPool};
pub use registry::{generate_query_id, RegistryConfig, SessionRegistry};
pub use results::ResultSet;
pub use retry::RetryPolicy;

use std::sync::Arc;

/// Everything needed to bring the engine up.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub meta: MetaConfig,
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// The assembled engine: registry, executor and metadata layout.
pub struct Engine {
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<QueryExecutor>,
    pub meta: Arc<MetaStorage>,
}

impl Engine {
    /// Open the database, attach the meta database if configured, create
    /// the metadata tables and start the workers.
    pub fn open(mut config: EngineConfig) -> Result<Self, EngineError> {
        if let Some(attachment) = config.meta.attachment() {
            if !config.registry.database.attachments.contains(&attachment) {
                config.registry.database.attachments.push(attachment);
            }
        }

        let registry = SessionRegistry::open(config.registry)?;
        let meta = Arc::new(MetaStorage::new(&config.meta));
        registry
            .database()
            .with_root(|conn| meta.ensure_schema(conn))?;

        let cache = Arc::new(ResultCache::open(config.cache)?);
        let executor = Arc::new(QueryExecutor::new(registry.clone(), cache, config.retry));

        Ok(Self {
            registry,
            executor,
            meta,
        })
    }
}

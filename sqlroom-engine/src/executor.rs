//! Query executor: one client request to one database operation.
//!
//! ```text
//! QueryRequest ──► cache hit? (persist only) ──► QueryOutcome
//!        │ miss
//!        ▼
//!   SessionRegistry::submit(id)            (worker thread)
//!        │  single-flight lock(cache key)
//!        │  re-check cache (persist only)
//!        │  RetryPolicy::run(execute)      conflict → backoff → retry
//!        │  store if persist
//!        ▼
//!   QueryOutcome
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{cache_key, CacheEntry, ResultCache};
use crate::database::Cursor;
use crate::error::EngineError;
use crate::registry::SessionRegistry;
use crate::results::ResultSet;
use crate::retry::RetryPolicy;

/// Statement text longer than this is truncated in log lines.
const LOG_SQL_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Columnar result as an Arrow IPC stream
    Arrow,
    /// Row-oriented result as JSON records
    Json,
    /// Statement without a result payload
    Exec,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Arrow => "arrow",
            QueryKind::Json => "json",
            QueryKind::Exec => "exec",
        }
    }

    fn is_cacheable(&self) -> bool {
        !matches!(self, QueryKind::Exec)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arrow" => Ok(QueryKind::Arrow),
            "json" => Ok(QueryKind::Json),
            "exec" => Ok(QueryKind::Exec),
            other => Err(format!("unknown query kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub id: String,
    pub kind: QueryKind,
    pub sql: String,
    /// Consult and populate the result cache
    pub persist: bool,
}

impl QueryRequest {
    pub fn new(id: impl Into<String>, kind: QueryKind, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            sql: sql.into(),
            persist: false,
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.sql, self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Arrow IPC stream bytes
    Arrow(Vec<u8>),
    /// The statement produced no result columns
    NoData,
    /// JSON array of row objects
    Json(String),
    /// Statement executed
    Ok,
}

impl QueryOutcome {
    fn from_cache(kind: QueryKind, entry: CacheEntry) -> Result<Self, EngineError> {
        match (kind, entry.payload) {
            (QueryKind::Arrow, Some(bytes)) => Ok(QueryOutcome::Arrow(bytes)),
            (QueryKind::Arrow, None) => Ok(QueryOutcome::NoData),
            (QueryKind::Json, Some(bytes)) => String::from_utf8(bytes)
                .map(QueryOutcome::Json)
                .map_err(|e| EngineError::Cache(format!("cached json: {e}"))),
            (QueryKind::Json, None) => Ok(QueryOutcome::Json("[]".to_string())),
            (QueryKind::Exec, _) => Ok(QueryOutcome::Ok),
        }
    }

    fn to_cache_entry(&self, kind: QueryKind) -> Option<CacheEntry> {
        match self {
            QueryOutcome::Arrow(bytes) => Some(CacheEntry::new(kind.as_str(), Some(bytes.clone()))),
            QueryOutcome::NoData => Some(CacheEntry::new(kind.as_str(), None)),
            QueryOutcome::Json(text) => {
                Some(CacheEntry::new(kind.as_str(), Some(text.clone().into_bytes())))
            }
            QueryOutcome::Ok => None,
        }
    }
}

/// One mutex per cache key; entries are dropped once nobody holds them.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct QueryExecutor {
    registry: Arc<SessionRegistry>,
    cache: Arc<ResultCache>,
    locks: Arc<KeyedLocks>,
    retry: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(registry: Arc<SessionRegistry>, cache: Arc<ResultCache>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            cache,
            locks: Arc::new(KeyedLocks::default()),
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute one request end to end.
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryOutcome, EngineError> {
        log::debug!(
            "Query {} ({}): {}",
            request.id,
            request.kind,
            truncate_sql(&request.sql)
        );

        if request.persist && request.kind.is_cacheable() {
            let cache = self.cache.clone();
            let key = request.cache_key();
            let cached = tokio::task::spawn_blocking(move || cache.get(&key))
                .await
                .map_err(|_| EngineError::WorkerLost)??;
            if let Some(entry) = cached {
                log::debug!("Cache hit for query {}", request.id);
                return QueryOutcome::from_cache(request.kind, entry);
            }
        }

        let cache = self.cache.clone();
        let locks = self.locks.clone();
        let retry = self.retry.clone();
        let id = request.id.clone();
        let kind = request.kind;
        let sql = request.sql.clone();

        let result = self
            .registry
            .submit(Some(request.id.clone()), move |cursor| {
                run_request(cursor, &request, &cache, &locks, &retry)
            })
            .await;

        if let Err(e) = &result {
            match e {
                EngineError::Cancelled => log::info!("Query {id} cancelled"),
                _ => log::warn!("Query {id} ({kind}) failed: {e} [{}]", truncate_sql(&sql)),
            }
        }
        result
    }

    /// Number of cache keys currently being computed.
    pub fn in_flight_keys(&self) -> usize {
        self.locks.len()
    }
}

fn run_request(
    cursor: &mut Cursor,
    request: &QueryRequest,
    cache: &ResultCache,
    locks: &KeyedLocks,
    retry: &RetryPolicy,
) -> Result<QueryOutcome, EngineError> {
    let key = request.cache_key();
    let lock = locks.lock_for(&key);
    let outcome = {
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        compute_cached(cursor, request, &key, cache, retry)
    };
    locks.release(&key, lock);
    outcome
}

fn compute_cached(
    cursor: &Cursor,
    request: &QueryRequest,
    key: &str,
    cache: &ResultCache,
    retry: &RetryPolicy,
) -> Result<QueryOutcome, EngineError> {
    let cacheable = request.persist && request.kind.is_cacheable();
    if cacheable {
        if let Some(entry) = cache.get(key)? {
            return QueryOutcome::from_cache(request.kind, entry);
        }
    }
    let outcome = retry.run(|| execute_once(cursor, request), std::thread::sleep)?;
    if cacheable {
        if let Some(entry) = outcome.to_cache_entry(request.kind) {
            cache.put(key, &entry)?;
        }
    }
    Ok(outcome)
}

fn execute_once(cursor: &Cursor, request: &QueryRequest) -> Result<QueryOutcome, EngineError> {
    let conn = cursor.connection();
    if request.sql.trim().is_empty() {
        return Ok(match request.kind {
            QueryKind::Arrow => QueryOutcome::NoData,
            QueryKind::Json => QueryOutcome::Json("[]".to_string()),
            QueryKind::Exec => QueryOutcome::Ok,
        });
    }
    match request.kind {
        QueryKind::Exec => {
            conn.execute_batch(&request.sql)?;
            Ok(QueryOutcome::Ok)
        }
        QueryKind::Arrow => {
            let mut stmt = conn.prepare(&request.sql)?;
            let results = ResultSet::collect(&mut stmt)?;
            Ok(match results.to_arrow_ipc()? {
                Some(bytes) => QueryOutcome::Arrow(bytes),
                None => QueryOutcome::NoData,
            })
        }
        QueryKind::Json => {
            let mut stmt = conn.prepare(&request.sql)?;
            let results = ResultSet::collect(&mut stmt)?;
            Ok(QueryOutcome::Json(results.to_json_records()?))
        }
    }
}

/// Shorten statement text for log lines.
pub fn truncate_sql(sql: &str) -> String {
    let trimmed = sql.trim();
    match trimmed.char_indices().nth(LOG_SQL_LIMIT) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

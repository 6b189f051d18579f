//! Session registry: database access, worker pool and in-flight queries.
//!
//! ```text
//!   submit(id, work)
//!        │
//!        ├── active[id] = CancelHandle
//!        ├── WorkerPool::execute ── Database::cursor_with(handle), work(cursor)
//!        │        │
//!        │        └── oneshot ──► awaiting task
//!        └── guard drop: active.remove(id)
//! ```
//!
//! `cancel(id)` interrupts one cursor; `cancel_all()` interrupts every cursor
//! and resolves every waiter with [`EngineError::Cancelled`] right away.
//! Shutdown is split so that the owner can flush its own state between
//! cancelling queries and closing the database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::database::{CancelHandle, Cursor, Database, DatabaseConfig};
use crate::error::EngineError;
use crate::pool::{PoolConfig, WorkerPool};

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
}

impl RegistryConfig {
    pub fn for_testing() -> Self {
        Self {
            database: DatabaseConfig::for_testing(),
            pool: PoolConfig {
                threads: Some(4),
                queue_capacity: 64,
            },
        }
    }
}

struct ActiveQuery {
    token: u64,
    cancel: CancelHandle,
    abort: Option<oneshot::Sender<()>>,
}

/// Generate an id for a query that arrived without one.
pub fn generate_query_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct SessionRegistry {
    database: Arc<Database>,
    pool: WorkerPool,
    active: Mutex<HashMap<String, ActiveQuery>>,
    next_token: AtomicU64,
    shutting_down: AtomicBool,
    finished: AtomicBool,
}

impl SessionRegistry {
    pub fn open(config: RegistryConfig) -> Result<Arc<Self>, EngineError> {
        let database = Arc::new(Database::open(config.database)?);
        let pool = WorkerPool::new(&config.pool)?;
        log::info!("Session registry ready with {} workers", pool.threads());
        Ok(Arc::new(Self {
            database,
            pool,
            active: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Database open and not draining.
    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst) && self.database.is_open()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run `work` on a worker with its own cursor, tracked under `query_id`.
    pub async fn submit<T, F>(&self, query_id: Option<String>, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cursor) -> Result<T, EngineError> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }
        let id = query_id.unwrap_or_else(generate_query_id);
        self.dispatch(id, work).await
    }

    /// Like [`submit`](Self::submit) but still accepted while shutdown is in
    /// progress. Used for final state flushes; fails once the database is
    /// closed.
    pub async fn submit_maintenance<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cursor) -> Result<T, EngineError> + Send + 'static,
    {
        self.dispatch(format!("maintenance-{}", generate_query_id()), work)
            .await
    }

    async fn dispatch<T, F>(&self, id: String, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Cursor) -> Result<T, EngineError> + Send + 'static,
    {
        if !self.database.is_open() {
            return Err(EngineError::ConnectionNotInitialized);
        }
        let cancel = CancelHandle::new();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (abort_tx, mut abort_rx) = oneshot::channel();

        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(&id) {
                return Err(EngineError::DuplicateQueryId(id));
            }
            active.insert(
                id.clone(),
                ActiveQuery {
                    token,
                    cancel: cancel.clone(),
                    abort: Some(abort_tx),
                },
            );
        }
        let mut guard = ActiveGuard {
            registry: self,
            id,
            token,
            cancel: cancel.clone(),
            completed: false,
        };

        let (result_tx, result_rx) = oneshot::channel();
        let database = self.database.clone();
        self.pool.execute(move || {
            let result = if cancel.is_cancelled() {
                Err(EngineError::Cancelled)
            } else {
                database
                    .cursor_with(cancel.clone())
                    .and_then(|mut cursor| work(&mut cursor))
            };
            let result = match result {
                Err(e) if cancel.is_cancelled() || e.is_interrupt() => Err(EngineError::Cancelled),
                other => other,
            };
            let _ = result_tx.send(result);
        })?;

        let outcome = tokio::select! {
            result = result_rx => result.unwrap_or(Err(EngineError::WorkerLost)),
            Ok(()) = &mut abort_rx => Err(EngineError::Cancelled),
        };
        guard.completed = true;
        drop(guard);
        outcome
    }

    /// Interrupt the query registered under `id`. False when unknown.
    pub fn cancel(&self, id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(id) {
            Some(query) => {
                log::info!("Cancelling query {id}");
                query.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Interrupt every query and release every waiter. Returns how many
    /// queries were active.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, ActiveQuery)> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = drained.len();
        for (id, mut query) in drained {
            log::debug!("Cancelling query {id} (cancel all)");
            query.cancel.cancel();
            if let Some(abort) = query.abort.take() {
                let _ = abort.send(());
            }
        }
        if count > 0 {
            log::info!("Cancelled {count} active queries");
        }
        count
    }

    /// Stop accepting new submissions. True on the first call.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.shutting_down.swap(true, Ordering::SeqCst);
        if first {
            log::info!("Session registry shutting down");
        }
        first
    }

    /// Checkpoint and close the database, then stop the worker pool without
    /// waiting for running jobs. Runs once.
    pub fn finish_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.database.checkpoint_and_close();
        self.pool.shutdown();
    }

    /// Full ordered shutdown for owners with no state of their own to flush.
    pub fn shutdown(&self) {
        self.begin_shutdown();
        self.cancel_all();
        self.finish_shutdown();
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Unregisters a query on every exit path, including the awaiting task
/// being dropped mid-flight (in which case the query is also interrupted).
struct ActiveGuard<'a> {
    registry: &'a SessionRegistry,
    id: String,
    token: u64,
    cancel: CancelHandle,
    completed: bool,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.cancel.cancel();
        }
        let mut active = self
            .registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.get(&self.id).is_some_and(|q| q.token == self.token) {
            active.remove(&self.id);
        }
    }
}

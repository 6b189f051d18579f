//! Durable snapshot storage for rooms.

use async_trait::async_trait;
use sqlroom_engine::{EngineError, MetaStorage, RetryPolicy, SessionRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Snapshot storage failed: {0}")]
    Engine(#[from] EngineError),
}

/// Where room snapshots live between process runs.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot for `room_id`, if one was ever saved.
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot for `room_id`.
    async fn save(&self, room_id: &str, snapshot: Vec<u8>) -> Result<(), StoreError>;
}

/// Snapshots in the server's metadata table, written through the session
/// registry so they share the worker pool with queries.
pub struct SqlSnapshotStore {
    registry: Arc<SessionRegistry>,
    meta: Arc<MetaStorage>,
    retry: RetryPolicy,
}

impl SqlSnapshotStore {
    pub fn new(registry: Arc<SessionRegistry>, meta: Arc<MetaStorage>) -> Self {
        Self {
            registry,
            meta,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl SnapshotStore for SqlSnapshotStore {
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let meta = self.meta.clone();
        let retry = self.retry.clone();
        let room_id = room_id.to_string();
        let snapshot = self
            .registry
            .submit_maintenance(move |cursor| {
                retry.run(
                    || meta.load_room_snapshot(cursor.connection(), &room_id),
                    std::thread::sleep,
                )
            })
            .await?;
        Ok(snapshot)
    }

    async fn save(&self, room_id: &str, snapshot: Vec<u8>) -> Result<(), StoreError> {
        let meta = self.meta.clone();
        let retry = self.retry.clone();
        let room_id = room_id.to_string();
        self.registry
            .submit_maintenance(move |cursor| {
                retry.run(
                    || meta.save_room_snapshot(cursor.connection(), &room_id, &snapshot),
                    std::thread::sleep,
                )
            })
            .await?;
        Ok(())
    }
}

/// In-process snapshot store that counts writes.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot as if it had been saved by an earlier run.
    pub fn insert(&self, room_id: &str, snapshot: Vec<u8>) {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string(), snapshot);
    }

    pub fn get(&self, room_id: &str) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(room_id))
    }

    async fn save(&self, room_id: &str, snapshot: Vec<u8>) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(room_id, snapshot);
        Ok(())
    }
}

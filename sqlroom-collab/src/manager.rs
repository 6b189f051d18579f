//! Room state manager: one resident [`Room`] per room id.
//!
//! Rooms are created on first reference, loaded lazily from the snapshot
//! store, and stay in memory for the life of the process. Updates to the
//! same room are serialized by the room lock; different rooms never block
//! each other. After [`RoomStateManager::close`] every room, including one
//! created later, is sealed against writes.

use base64::Engine as _;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::error::RoomError;
use crate::room::Room;
use crate::store::SnapshotStore;

/// Room manager configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Quiet period before a dirty room is written
    pub save_debounce: Duration,
    /// Accept full snapshots pushed by clients into empty rooms
    pub allow_client_snapshots: bool,
    /// Bytes above the empty-document size a room may hold and still accept
    /// a client snapshot
    pub snapshot_tolerance: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(500),
            allow_client_snapshots: false,
            snapshot_tolerance: 64,
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(50),
            allow_client_snapshots: true,
            snapshot_tolerance: 64,
        }
    }
}

/// Size of a snapshot exported from a document that was never written to.
pub fn empty_snapshot_len() -> usize {
    Doc::new()
        .transact()
        .encode_state_as_update_v1(&StateVector::default())
        .len()
}

pub struct RoomStateManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    empty_snapshot_len: usize,
    closed: AtomicBool,
}

impl RoomStateManager {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
            empty_snapshot_len: empty_snapshot_len(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn empty_snapshot_len(&self) -> usize {
        self.empty_snapshot_len
    }

    /// Get the room for `room_id`, creating it unloaded if needed.
    pub async fn room(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Room::new(room_id, self.store.clone());
        if self.is_closed() {
            room.seal();
        }
        rooms.insert(room_id.to_string(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }

    async fn existing(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn ensure_loaded(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        let room = self.room(room_id).await;
        room.ensure_loaded(self.store.as_ref()).await?;
        Ok(room)
    }

    /// Import `update` and debounce a save.
    pub async fn apply_update(&self, room_id: &str, update: &[u8]) -> Result<(), RoomError> {
        let room = self.ensure_loaded(room_id).await?;
        room.apply(update).await?;
        room.schedule_save(self.config.save_debounce);
        Ok(())
    }

    /// Debounce a save of `room_id` by `delay`. False if the room was never
    /// referenced.
    pub async fn schedule_save(&self, room_id: &str, delay: Duration) -> bool {
        match self.existing(room_id).await {
            Some(room) => {
                room.schedule_save(delay);
                true
            }
            None => false,
        }
    }

    /// Persist `room_id` now if it is dirty. Returns whether a write happened.
    pub async fn flush(&self, room_id: &str) -> Result<bool, RoomError> {
        match self.existing(room_id).await {
            Some(room) => room.flush(self.store.as_ref()).await,
            None => Ok(false),
        }
    }

    /// Persist every dirty room concurrently. Failures are logged; returns
    /// the number of rooms written.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let results = join_all(rooms.iter().map(|room| room.flush(self.store.as_ref()))).await;
        tally_flushes(&rooms, results)
    }

    /// Seal every room and write its final state. Returns the number of
    /// rooms written.
    pub async fn close(&self) -> usize {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.write().await;
            self.closed.store(true, Ordering::SeqCst);
            rooms.values().cloned().collect()
        };
        let results = join_all(rooms.iter().map(|room| room.close(self.store.as_ref()))).await;
        tally_flushes(&rooms, results)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn export_snapshot(&self, room_id: &str) -> Result<Vec<u8>, RoomError> {
        let room = self.ensure_loaded(room_id).await?;
        Ok(room.export_snapshot().await)
    }

    pub async fn export_updates_since(
        &self,
        room_id: &str,
        state_vector: &[u8],
    ) -> Result<Vec<u8>, RoomError> {
        let room = self.ensure_loaded(room_id).await?;
        room.export_updates_since(state_vector).await
    }

    pub async fn state_vector(&self, room_id: &str) -> Result<Vec<u8>, RoomError> {
        let room = self.ensure_loaded(room_id).await?;
        Ok(room.state_vector().await)
    }

    /// Accept a full snapshot pushed by a client, but only into a room that
    /// is still (nearly) empty. Returns the decoded snapshot bytes for
    /// broadcasting.
    pub async fn accept_client_snapshot(
        &self,
        room_id: &str,
        data_base64: &str,
    ) -> Result<Vec<u8>, RoomError> {
        if !self.config.allow_client_snapshots {
            return Err(RoomError::ClientSnapshotsDisabled);
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data_base64)
            .map_err(|e| RoomError::InvalidSnapshot(e.to_string()))?;

        let room = self.ensure_loaded(room_id).await?;
        let limit = self.empty_snapshot_len + self.config.snapshot_tolerance;
        room.with_state(|state| {
            if room.is_sealed() {
                return Err(RoomError::Closed);
            }
            let current = state.export().len();
            if current > limit {
                log::warn!(
                    "Rejected client snapshot for room {room_id}: room holds {current} bytes"
                );
                return Err(RoomError::SnapshotRejected);
            }
            state.import(&bytes)
        })
        .await?;
        room.schedule_save(self.config.save_debounce);
        Ok(bytes)
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn dirty_rooms(&self) -> Vec<String> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut dirty = Vec::new();
        for room in rooms {
            if room.is_dirty().await {
                dirty.push(room.id().to_string());
            }
        }
        dirty.sort();
        dirty
    }
}

fn tally_flushes(rooms: &[Arc<Room>], results: Vec<Result<bool, RoomError>>) -> usize {
    let mut written = 0;
    for (room, result) in rooms.iter().zip(results) {
        match result {
            Ok(true) => written += 1,
            Ok(false) => {}
            Err(e) => log::error!("Flushing room {} failed: {e}", room.id()),
        }
    }
    if written > 0 {
        log::info!("Flushed {written} rooms");
    }
    written
}

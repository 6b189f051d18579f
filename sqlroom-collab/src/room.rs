//! A single collaborative room: one authoritative Yrs document.
//!
//! ```text
//!            ensure_loaded (once)
//!  Unloaded ───────────────► Loading ───────► Loaded
//!                                               │
//!                    apply ┌────────────────────┤
//!                          ▼                    │
//!                       Dirty ── save ──► Clean ┘
//! ```
//!
//! Dirty tracking uses two counters: every applied update bumps `revision`;
//! a save records the revision it exported in `persisted_revision`.
//!
//! [`Room::close`] takes a final snapshot and seals the room; a sealed room
//! rejects every later write.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::RoomError;
use crate::store::SnapshotStore;
use crate::writeback::{CoalescingWriteBack, FlushFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Unloaded,
    Loading,
    Loaded,
}

impl LoadPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadPhase::Loading,
            2 => LoadPhase::Loaded,
            _ => LoadPhase::Unloaded,
        }
    }
}

pub(crate) struct RoomState {
    doc: Doc,
    revision: u64,
    persisted_revision: u64,
}

impl RoomState {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            revision: 0,
            persisted_revision: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.revision > self.persisted_revision
    }

    pub(crate) fn import(&mut self, bytes: &[u8]) -> Result<(), RoomError> {
        let update = Update::decode_v1(bytes).map_err(|e| RoomError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| RoomError::InvalidUpdate(e.to_string()))?;
        drop(txn);
        self.revision += 1;
        Ok(())
    }

    pub(crate) fn export(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn export_since(&self, state_vector: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(state_vector)
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }
}

pub struct Room {
    id: String,
    state: Mutex<RoomState>,
    loaded: OnceCell<()>,
    phase: AtomicU8,
    /// Set under the state lock by `close`
    sealed: AtomicBool,
    write_back: CoalescingWriteBack,
}

impl Room {
    /// Create an unloaded room whose debounced saves go to `store`.
    pub fn new(id: impl Into<String>, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|weak: &Weak<Room>| {
            let weak = weak.clone();
            let flush: FlushFn = Arc::new(move || {
                let weak = weak.clone();
                let store = store.clone();
                Box::pin(async move {
                    if let Some(room) = weak.upgrade() {
                        if let Err(e) = room.save(store.as_ref()).await {
                            log::error!("Debounced save of room {} failed: {e}", room.id);
                        }
                    }
                })
            });
            Room {
                id,
                state: Mutex::new(RoomState::new()),
                loaded: OnceCell::new(),
                phase: AtomicU8::new(LoadPhase::Unloaded as u8),
                sealed: AtomicBool::new(false),
                write_back: CoalescingWriteBack::new(flush),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> LoadPhase {
        LoadPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Load the persisted snapshot exactly once. Concurrent callers wait for
    /// the first load; a failed load leaves the room unloaded for a retry.
    pub async fn ensure_loaded(&self, store: &dyn SnapshotStore) -> Result<(), RoomError> {
        self.loaded
            .get_or_try_init(|| async {
                self.phase.store(LoadPhase::Loading as u8, Ordering::SeqCst);
                let snapshot = match store.load(&self.id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.phase.store(LoadPhase::Unloaded as u8, Ordering::SeqCst);
                        return Err(RoomError::from(e));
                    }
                };

                let mut state = self.state.lock().await;
                if let Some(bytes) = snapshot {
                    match state.import(&bytes) {
                        Ok(()) => log::info!("Loaded room {} ({} bytes)", self.id, bytes.len()),
                        Err(e) => log::error!("Ignoring unreadable snapshot for room {}: {e}", self.id),
                    }
                    // Loaded state is what storage already holds.
                    state.persisted_revision = state.revision;
                }
                self.phase.store(LoadPhase::Loaded as u8, Ordering::SeqCst);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Import an update under the room lock and mark the room dirty.
    pub async fn apply(&self, update: &[u8]) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        if self.is_sealed() {
            return Err(RoomError::Closed);
        }
        state.import(update)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Seal a room that nobody else can reach yet.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Run `f` with exclusive access to the document state.
    pub(crate) async fn with_state<T>(&self, f: impl FnOnce(&mut RoomState) -> T) -> T {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    pub async fn export_snapshot(&self) -> Vec<u8> {
        self.state.lock().await.export()
    }

    pub async fn export_updates_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, RoomError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| RoomError::InvalidStateVector(e.to_string()))?;
        Ok(self.state.lock().await.export_since(&sv))
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.state_vector()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.is_dirty()
    }

    /// Debounce a save `delay` from now.
    pub fn schedule_save(&self, delay: Duration) {
        self.write_back.arm(delay);
    }

    pub fn save_pending(&self) -> bool {
        self.write_back.is_pending()
    }

    pub fn debounced_saves(&self) -> u64 {
        self.write_back.fire_count()
    }

    /// Write the document to `store` if it is dirty. The room lock is held
    /// for the whole export and write. Returns whether anything was written.
    pub async fn save(&self, store: &dyn SnapshotStore) -> Result<bool, RoomError> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state, store).await
    }

    async fn save_locked(
        &self,
        state: &mut RoomState,
        store: &dyn SnapshotStore,
    ) -> Result<bool, RoomError> {
        if !state.is_dirty() {
            return Ok(false);
        }
        let revision = state.revision;
        let snapshot = state.export();
        let size = snapshot.len();
        store.save(&self.id, snapshot).await?;
        state.persisted_revision = revision;
        log::debug!("Saved room {} ({size} bytes, revision {revision})", self.id);
        Ok(true)
    }

    /// Save immediately, dropping any pending debounced save.
    pub async fn flush(&self, store: &dyn SnapshotStore) -> Result<bool, RoomError> {
        self.write_back.cancel();
        self.save(store).await
    }

    /// Seal the room and write its final state. Updates already holding the
    /// room lock land in this write; later ones fail with [`RoomError::Closed`].
    pub async fn close(&self, store: &dyn SnapshotStore) -> Result<bool, RoomError> {
        self.write_back.cancel();
        let mut state = self.state.lock().await;
        self.sealed.store(true, Ordering::SeqCst);
        self.save_locked(&mut state, store).await
    }
}

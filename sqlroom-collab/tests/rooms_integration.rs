//! Room state manager tests: loading, merging, debounced persistence and
//! the client snapshot guard.

use async_trait::async_trait;
use base64::Engine as _;
use sqlroom_collab::{
    LoadPhase, MemorySnapshotStore, RoomConfig, RoomError, RoomStateManager, SnapshotStore,
    SqlSnapshotStore, StoreError,
};
use sqlroom_engine::{DatabaseConfig, Engine, EngineConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Insert `text` at the end of the shared "content" text and return the delta.
fn edit(doc: &Doc, text: &str) -> Vec<u8> {
    let sv = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let content = txn.get_or_insert_text("content");
        let len = content.get_string(&txn).len() as u32;
        content.insert(&mut txn, len, text);
    }
    doc.transact().encode_state_as_update_v1(&sv)
}

fn content_of(snapshot: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(snapshot).unwrap()).unwrap();
    }
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn memory_manager(config: RoomConfig) -> (RoomStateManager, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    (RoomStateManager::new(store.clone(), config), store)
}

/// Store that counts loads and delays them, to widen load races.
struct SlowStore {
    inner: MemorySnapshotStore,
    loads: AtomicUsize,
}

#[async_trait]
impl SnapshotStore for SlowStore {
    async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.load(room_id).await
    }

    async fn save(&self, room_id: &str, snapshot: Vec<u8>) -> Result<(), StoreError> {
        self.inner.save(room_id, snapshot).await
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_room_exports_empty_baseline() {
    let (manager, store) = memory_manager(RoomConfig::default());
    let snapshot = manager.export_snapshot("r1").await.unwrap();
    assert_eq!(snapshot.len(), manager.empty_snapshot_len());
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn test_concurrent_ensure_loaded_loads_once() {
    let client = Doc::new();
    let store = Arc::new(SlowStore {
        inner: MemorySnapshotStore::new(),
        loads: AtomicUsize::new(0),
    });
    edit(&client, "persisted");
    store.inner.insert(
        "r1",
        client.transact().encode_state_as_update_v1(&StateVector::default()),
    );
    let manager = Arc::new(RoomStateManager::new(store.clone(), RoomConfig::default()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.ensure_loaded("r1").await.map(|_| ()) }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    let room = manager.room("r1").await;
    assert_eq!(room.phase(), LoadPhase::Loaded);
    assert!(!room.is_dirty().await);
    assert_eq!(content_of(&manager.export_snapshot("r1").await.unwrap()), "persisted");
}

#[tokio::test]
async fn test_unreadable_snapshot_loads_empty_room() {
    let (manager, store) = memory_manager(RoomConfig::default());
    store.insert("broken", vec![0xff, 0xff, 0xff]);
    let snapshot = manager.export_snapshot("broken").await.unwrap();
    assert_eq!(snapshot.len(), manager.empty_snapshot_len());
}

// ─── Merging ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_importing_same_update_twice_is_idempotent() {
    let (manager, _) = memory_manager(RoomConfig::default());
    let client = Doc::new();
    let update = edit(&client, "hello");

    manager.apply_update("r1", &update).await.unwrap();
    let once = manager.export_snapshot("r1").await.unwrap();
    manager.apply_update("r1", &update).await.unwrap();
    let twice = manager.export_snapshot("r1").await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(content_of(&twice), "hello");
}

#[tokio::test]
async fn test_updates_in_any_order_converge() {
    let alice = Doc::with_client_id(1);
    let bob = Doc::with_client_id(2);
    let from_alice = edit(&alice, "alice");
    let from_bob = edit(&bob, "bob");

    let (first, _) = memory_manager(RoomConfig::default());
    first.apply_update("r1", &from_alice).await.unwrap();
    first.apply_update("r1", &from_bob).await.unwrap();

    let (second, _) = memory_manager(RoomConfig::default());
    second.apply_update("r1", &from_bob).await.unwrap();
    second.apply_update("r1", &from_alice).await.unwrap();

    let a = content_of(&first.export_snapshot("r1").await.unwrap());
    let b = content_of(&second.export_snapshot("r1").await.unwrap());
    assert_eq!(a, b);
    assert_eq!(a.len(), "alicebob".len());
}

#[tokio::test]
async fn test_garbage_update_is_rejected() {
    let (manager, _) = memory_manager(RoomConfig::default());
    let err = manager.apply_update("r1", &[0xde, 0xad, 0xbe, 0xef]).await.unwrap_err();
    assert!(matches!(err, RoomError::InvalidUpdate(_)));
    assert!(!manager.room("r1").await.is_dirty().await);
}

#[tokio::test]
async fn test_export_updates_since_state_vector() {
    let (manager, _) = memory_manager(RoomConfig::default());
    let client = Doc::new();
    manager.apply_update("r1", &edit(&client, "one")).await.unwrap();
    let sv = manager.state_vector("r1").await.unwrap();
    let before = manager.export_snapshot("r1").await.unwrap();
    manager.apply_update("r1", &edit(&client, "two")).await.unwrap();

    let diff = manager.export_updates_since("r1", &sv).await.unwrap();
    let full = manager.export_snapshot("r1").await.unwrap();
    assert!(diff.len() < full.len());

    // A replica that saw only the first edit catches up from the diff.
    let replica = Doc::new();
    {
        let mut txn = replica.transact_mut();
        txn.apply_update(Update::decode_v1(&before).unwrap()).unwrap();
        txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
    }
    let txn = replica.transact();
    let text = txn.get_text("content").unwrap().get_string(&txn);
    assert_eq!(text, "onetwo");

    assert!(matches!(
        manager.export_updates_since("r1", &[0xff]).await,
        Err(RoomError::InvalidStateVector(_))
    ));
}

// ─── Debounced persistence ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_burst_of_updates_persists_once() {
    let (manager, store) = memory_manager(RoomConfig {
        save_debounce: Duration::from_millis(500),
        ..RoomConfig::default()
    });
    let client = Doc::new();
    for i in 0..10 {
        manager.apply_update("r1", &edit(&client, &format!("{i}"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(store.save_count(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.save_count(), 1);
    assert_eq!(content_of(&store.get("r1").unwrap()), "0123456789");
    assert!(manager.dirty_rooms().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flush_writes_immediately_and_once() {
    let (manager, store) = memory_manager(RoomConfig::default());
    let client = Doc::new();
    manager.apply_update("r1", &edit(&client, "x")).await.unwrap();
    assert_eq!(manager.dirty_rooms().await, vec!["r1".to_string()]);

    assert!(manager.flush("r1").await.unwrap());
    assert!(!manager.flush("r1").await.unwrap());
    assert!(!manager.flush("never-seen").await.unwrap());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn test_flush_all_writes_every_dirty_room() {
    let (manager, store) = memory_manager(RoomConfig {
        save_debounce: Duration::from_secs(60),
        ..RoomConfig::default()
    });
    let client = Doc::new();
    manager.apply_update("a", &edit(&client, "a")).await.unwrap();
    manager.apply_update("b", &edit(&client, "b")).await.unwrap();
    manager.ensure_loaded("clean").await.unwrap();

    assert_eq!(manager.flush_all().await, 2);
    assert_eq!(store.save_count(), 2);
    assert_eq!(manager.flush_all().await, 0);
    assert_eq!(manager.room_ids().await, vec!["a", "b", "clean"]);
}

#[tokio::test]
async fn test_close_writes_final_state_and_seals_rooms() {
    let (manager, store) = memory_manager(RoomConfig {
        save_debounce: Duration::from_secs(60),
        ..RoomConfig::for_testing()
    });
    let client = Doc::new();
    manager.apply_update("r1", &edit(&client, "last")).await.unwrap();

    assert_eq!(manager.close().await, 1);
    assert!(manager.is_closed());
    assert_eq!(content_of(&store.load("r1").await.unwrap().unwrap()), "last");

    let err = manager
        .apply_update("r1", &edit(&client, " lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Closed));

    // Rooms first referenced after close are sealed too.
    let err = manager
        .apply_update("r2", &edit(&Doc::new(), "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Closed));
    let err = manager
        .accept_client_snapshot("r3", &encoded_snapshot("seed"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Closed));

    assert!(manager.dirty_rooms().await.is_empty());
    assert_eq!(store.save_count(), 1);
    assert_eq!(content_of(&manager.export_snapshot("r1").await.unwrap()), "last");
}

#[tokio::test]
async fn test_schedule_save_for_unknown_room() {
    let (manager, _) = memory_manager(RoomConfig::default());
    assert!(!manager.schedule_save("nope", Duration::from_millis(1)).await);
    manager.ensure_loaded("yes").await.unwrap();
    assert!(manager.schedule_save("yes", Duration::from_millis(1)).await);
}

// ─── Client snapshot guard ───────────────────────────────────────────────────

fn encoded_snapshot(text: &str) -> String {
    let doc = Doc::new();
    edit(&doc, text);
    let bytes = doc.transact().encode_state_as_update_v1(&StateVector::default());
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn test_client_snapshot_accepted_into_empty_room() {
    let (manager, _) = memory_manager(RoomConfig::for_testing());
    let bytes = manager
        .accept_client_snapshot("r1", &encoded_snapshot("seed"))
        .await
        .unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(content_of(&manager.export_snapshot("r1").await.unwrap()), "seed");
}

#[tokio::test]
async fn test_client_snapshot_rejected_when_room_has_state() {
    let (manager, _) = memory_manager(RoomConfig::for_testing());
    let client = Doc::new();
    let long = "shared state that must not be wiped ".repeat(8);
    manager.apply_update("r1", &edit(&client, &long)).await.unwrap();

    let err = manager
        .accept_client_snapshot("r1", &encoded_snapshot(""))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::SnapshotRejected));
    assert_eq!(err.to_string(), "room already has state; snapshot rejected");
    assert_eq!(content_of(&manager.export_snapshot("r1").await.unwrap()), long);
}

#[tokio::test]
async fn test_client_snapshot_errors() {
    let (disabled, _) = memory_manager(RoomConfig::default());
    let err = disabled
        .accept_client_snapshot("r1", &encoded_snapshot("x"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "client snapshots disabled");

    let (enabled, _) = memory_manager(RoomConfig::for_testing());
    let err = enabled.accept_client_snapshot("r1", "%%%").await.unwrap_err();
    assert!(err.to_string().starts_with("invalid snapshot: "));
}

// ─── SQL-backed persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_sql_store_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rooms.db").to_string_lossy().to_string();
    let config = || {
        let mut config = EngineConfig::for_testing();
        config.registry.database = DatabaseConfig::with_path(path.clone());
        config
    };

    {
        let engine = Engine::open(config()).unwrap();
        let store = Arc::new(SqlSnapshotStore::new(engine.registry.clone(), engine.meta.clone()));
        let manager = RoomStateManager::new(store, RoomConfig::default());
        let client = Doc::new();
        manager.apply_update("r1", &edit(&client, "durable")).await.unwrap();
        assert_eq!(manager.flush_all().await, 1);
        engine.registry.shutdown();
    }

    let engine = Engine::open(config()).unwrap();
    let store = Arc::new(SqlSnapshotStore::new(engine.registry.clone(), engine.meta.clone()));
    let manager = RoomStateManager::new(store, RoomConfig::default());
    let snapshot = manager.export_snapshot("r1").await.unwrap();
    assert_eq!(content_of(&snapshot), "durable");
    engine.registry.shutdown();
}

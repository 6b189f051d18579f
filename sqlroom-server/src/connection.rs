//! Per-connection outbound handles and the connection table.
//!
//! Each connection gets a server-assigned [`ConnectionId`] at accept time.
//! All routing (rooms, channels, auth) is keyed by that id, never by the
//! socket object.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Routing state the gateway keeps for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub room_id: Option<String>,
    pub client_id: Option<String>,
    pub authenticated: bool,
}

/// Sending side of one connection's outbound queue.
///
/// Sends never block: frames go to an unbounded queue drained by the
/// connection's writer task. `queued` counts frames not yet written; above
/// the threshold each send logs a backpressure warning.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Message>,
    queued: Arc<AtomicUsize>,
    backpressure_events: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    threshold: usize,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its writer task drains.
    pub fn new(
        id: ConnectionId,
        threshold: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            sender,
            queued: Arc::new(AtomicUsize::new(0)),
            backpressure_events: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            threshold,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a raw frame. False if the connection is gone.
    pub fn send(&self, message: Message) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.threshold {
            self.backpressure_events.fetch_add(1, Ordering::Relaxed);
            log::warn!("Backpressure on {}: {depth} frames queued", self.id);
        }
        if self.sender.send(message).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(text) => self.send(Message::text(text)),
            Err(e) => {
                log::error!("Failed to encode message for {}: {e}", self.id);
                false
            }
        }
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.send(Message::binary(bytes))
    }

    /// Called by the writer task after each frame leaves the queue.
    pub fn mark_written(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Stop accepting frames; late query results are dropped silently.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }
}

struct Entry {
    handle: ConnectionHandle,
    state: ConnectionState,
}

/// Live connections keyed by id.
#[derive(Default)]
pub struct ConnectionTable {
    entries: RwLock<HashMap<ConnectionId, Entry>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: ConnectionHandle) {
        let entry = Entry {
            handle: handle.clone(),
            state: ConnectionState::default(),
        };
        self.entries.write().await.insert(handle.id(), entry);
    }

    /// Remove a connection, returning its last state.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.entries.write().await.remove(&id).map(|entry| {
            entry.handle.close();
            entry.state
        })
    }

    pub async fn handle(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.entries.read().await.get(&id).map(|e| e.handle.clone())
    }

    pub async fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.entries.read().await.get(&id).map(|e| e.state.clone())
    }

    /// Mutate the state of `id` in place. None if the connection is gone.
    pub async fn update<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> T,
    ) -> Option<T> {
        self.entries.write().await.get_mut(&id).map(|e| f(&mut e.state))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.entries.read().await.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_counts_until_written() {
        let (handle, mut rx) = ConnectionHandle::new(ConnectionId(1), 8);
        assert!(handle.send_message(&ServerMessage::AuthAck));
        assert!(handle.send_binary(vec![1, 2, 3]));
        assert_eq!(handle.queued(), 2);

        let first = rx.recv().await.unwrap();
        assert!(first.is_text());
        handle.mark_written();
        assert_eq!(handle.queued(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_flagged_without_blocking() {
        let (handle, _rx) = ConnectionHandle::new(ConnectionId(1), 2);
        for _ in 0..5 {
            assert!(handle.send(Message::text("x")));
        }
        assert_eq!(handle.queued(), 5);
        assert_eq!(handle.backpressure_events(), 3);
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (handle, rx) = ConnectionHandle::new(ConnectionId(1), 8);
        drop(rx);
        assert!(!handle.send(Message::text("late")));
        assert!(handle.is_closed());
        assert_eq!(handle.queued(), 0);

        let (handle, _rx) = ConnectionHandle::new(ConnectionId(2), 8);
        handle.close();
        assert!(!handle.send(Message::text("late")));
    }

    #[tokio::test]
    async fn test_table_tracks_state_by_id() {
        let table = ConnectionTable::new();
        let (a, _rx_a) = ConnectionHandle::new(ConnectionId(1), 8);
        let (b, _rx_b) = ConnectionHandle::new(ConnectionId(2), 8);
        table.insert(a).await;
        table.insert(b).await;

        table
            .update(ConnectionId(1), |s| s.room_id = Some("r1".into()))
            .await
            .unwrap();
        assert_eq!(
            table.state(ConnectionId(1)).await.unwrap().room_id.as_deref(),
            Some("r1")
        );
        assert_eq!(table.state(ConnectionId(2)).await.unwrap(), ConnectionState::default());

        let last = table.remove(ConnectionId(1)).await.unwrap();
        assert_eq!(last.room_id.as_deref(), Some("r1"));
        assert!(table.update(ConnectionId(1), |_| ()).await.is_none());
        assert_eq!(table.ids().await, vec![ConnectionId(2)]);
    }
}

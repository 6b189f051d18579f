//! Topic fan-out for pub/sub channels and room groups.
//!
//! Channels and rooms live in separate namespaces so a channel named "r1"
//! never receives updates for room "r1". Publishing hands the same frame to
//! every subscriber's outbound queue, optionally skipping the sender.
//! Stats are atomics so the publish path takes only the read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ConnectionHandle, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(String),
    Room(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_published: u64,
    pub deliveries: u64,
    pub topics: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_published: AtomicU64,
    deliveries: AtomicU64,
}

#[derive(Default)]
pub struct TopicHub {
    topics: RwLock<HashMap<Topic, HashMap<ConnectionId, ConnectionHandle>>>,
    stats: AtomicHubStats,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handle` to `topic`. Returns false if it already was.
    pub async fn subscribe(&self, topic: Topic, handle: ConnectionHandle) -> bool {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic)
            .or_default()
            .insert(handle.id(), handle)
            .is_none()
    }

    pub async fn unsubscribe(&self, topic: &Topic, id: ConnectionId) -> bool {
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Drop `id` from every topic. Returns how many it left.
    pub async fn unsubscribe_all(&self, id: ConnectionId) -> usize {
        let mut topics = self.topics.write().await;
        let mut left = 0;
        topics.retain(|_, subscribers| {
            if subscribers.remove(&id).is_some() {
                left += 1;
            }
            !subscribers.is_empty()
        });
        left
    }

    /// Queue `message` for every subscriber of `topic` except `except`.
    /// Returns the number of connections reached.
    pub async fn publish(
        &self,
        topic: &Topic,
        message: Message,
        except: Option<ConnectionId>,
    ) -> usize {
        let topics = self.topics.read().await;
        let mut reached = 0;
        if let Some(subscribers) = topics.get(topic) {
            for (id, handle) in subscribers {
                if Some(*id) == except {
                    continue;
                }
                if handle.send(message.clone()) {
                    reached += 1;
                }
            }
        }
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(reached as u64, Ordering::Relaxed);
        reached
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.read().await.get(topic).map_or(0, HashMap::len)
    }

    pub async fn is_subscribed(&self, topic: &Topic, id: ConnectionId) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(&id))
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            topics: self.topics.read().await.len(),
        }
    }
}

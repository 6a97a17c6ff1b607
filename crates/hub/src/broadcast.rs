//! Topic-based fan-out to live dashboard clients.
//!
//! Delivery is best-effort: every client owns a bounded outbound queue and
//! `publish` only ever `try_send`s into it. A full queue drops the frame for
//! that client; a closed queue unregisters the client.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{Reading, Unit, UnitId, UnitStatus};

pub type ClientId = Uuid;

/// A serialized event, shared between all recipients.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveEvent {
    #[serde(rename_all = "camelCase")]
    UnitUpdate { unit_id: UnitId, reading: Reading },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        unit_id: UnitId,
        status: UnitStatus,
        #[serde(with = "time::serde::rfc3339::option")]
        last_seen_at: Option<OffsetDateTime>,
    },
    #[serde(rename_all = "camelCase")]
    UnitCreated { unit: Unit },
    #[serde(rename_all = "camelCase")]
    UnitDeleted { unit_id: UnitId },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, mpsc::Sender<Frame>>,
    topics: HashMap<String, HashSet<ClientId>>,
}

impl Registry {
    fn remove_client(&mut self, client: &ClientId) {
        self.clients.remove(client);
        self.topics.retain(|_, members| {
            members.remove(client);
            !members.is_empty()
        });
    }
}

pub struct Broadcaster {
    registry: RwLock<Registry>,
    buffer: usize,
}

impl Broadcaster {
    /// `buffer` is the per-client queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            buffer: buffer.max(1),
        }
    }

    /// Register a client. Frames for its topics arrive on the receiver.
    pub async fn connect(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.registry.write().await.clients.insert(id, tx);
        (id, rx)
    }

    pub async fn disconnect(&self, client: ClientId) {
        self.registry.write().await.remove_client(&client);
    }

    /// Join a topic. Returns false for an unknown client. Joining twice is a
    /// no-op.
    pub async fn subscribe(&self, client: ClientId, topic: &str) -> bool {
        let mut reg = self.registry.write().await;
        if !reg.clients.contains_key(&client) {
            return false;
        }
        reg.topics.entry(topic.to_string()).or_default().insert(client);
        true
    }

    pub async fn unsubscribe(&self, client: ClientId, topic: &str) {
        let mut reg = self.registry.write().await;
        if let Some(members) = reg.topics.get_mut(topic) {
            members.remove(&client);
            if members.is_empty() {
                reg.topics.remove(topic);
            }
        }
    }

    /// Push an event to every current subscriber of `topic` without waiting
    /// on any of them.
    pub async fn publish(&self, topic: &str, event: &LiveEvent) -> Delivery {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!(topic, error = %e, "broadcast: failed to encode event");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        let mut closed = Vec::new();
        {
            let reg = self.registry.read().await;
            let Some(members) = reg.topics.get(topic) else {
                return delivery;
            };
            for client in members {
                let Some(tx) = reg.clients.get(client) else {
                    continue;
                };
                match tx.try_send(frame.clone()) {
                    Ok(()) => delivery.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(topic, %client, "broadcast: subscriber queue full, dropping");
                        delivery.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        delivery.dropped += 1;
                        closed.push(*client);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut reg = self.registry.write().await;
            for client in &closed {
                reg.remove_client(client);
            }
            debug!(topic, count = closed.len(), "broadcast: pruned closed subscribers");
        }

        delivery
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .read()
            .await
            .topics
            .get(topic)
            .map_or(0, HashSet::len)
    }

    /// Drop every client queue; their forwarding tasks see the channel
    /// close and end.
    pub async fn close_all(&self) {
        let mut reg = self.registry.write().await;
        let count = reg.clients.len();
        reg.clients.clear();
        reg.topics.clear();
        tracing::info!(count, "closed all live subscribers");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

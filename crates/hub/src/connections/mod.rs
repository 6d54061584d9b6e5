// Outbound delivery: one queue per live connection.

use atrium_common::protocol::ws::ServerEvent;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Maps a connection id to its outbound event queue. Emitters enqueue and
/// move on; the connection's own socket task drains the queue, so a slow
/// peer never stalls a broadcast and no lock is held across socket I/O.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMap {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

#[derive(Debug)]
struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    connected_at: DateTime<Utc>,
}

impl ConnectionMap {
    /// Register a connection's outbound queue. Replaces any previous
    /// handle under the same id.
    pub async fn insert(&self, connection_id: &str, outbound: mpsc::UnboundedSender<ServerEvent>) {
        let mut guard = self.connections.write().await;
        guard.insert(
            connection_id.to_string(),
            ConnectionHandle { outbound, connected_at: Utc::now() },
        );
    }

    pub async fn remove(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connected_at(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.connections.read().await.get(connection_id).map(|handle| handle.connected_at)
    }

    /// Enqueue one event for one connection. Returns false when the
    /// connection is gone (unknown id or a queue whose receiver dropped).
    pub async fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        let sender = {
            let guard = self.connections.read().await;
            guard.get(connection_id).map(|handle| handle.outbound.clone())
        };
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Enqueue a copy of the event for each listed connection, skipping
    /// ids that are no longer live. Returns the number delivered. Senders
    /// are collected under the read lock and used after it is released.
    pub async fn send_to_each<I, S>(&self, connection_ids: I, event: ServerEvent) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let senders: Vec<mpsc::UnboundedSender<ServerEvent>> = {
            let guard = self.connections.read().await;
            connection_ids
                .into_iter()
                .filter_map(|id| guard.get(id.as_ref()).map(|handle| handle.outbound.clone()))
                .collect()
        };

        let mut sent_count = 0;
        for sender in senders {
            if sender.send(event.clone()).is_ok() {
                sent_count += 1;
            }
        }
        sent_count
    }
}

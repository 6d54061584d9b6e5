// Notification registration: which connections speak for which user.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maps a user id to the set of live connection ids registered to receive
/// that user's notifications. A user may hold zero, one, or many
/// connections (multi-tab, multi-device).
///
/// The reverse index lets disconnect cleanup drop a connection from every
/// user it registered under without scanning the whole registry.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections_by_user: HashMap<String, HashSet<String>>,
    users_by_connection: HashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    /// Register a (user, connection) pair. Registering the same pair twice
    /// has no additional effect.
    pub async fn register(&self, user_id: &str, connection_id: &str) {
        let mut guard = self.state.write().await;
        guard
            .connections_by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        guard
            .users_by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Remove a (user, connection) pair. Unregistering an absent pair is a
    /// no-op; the user entry disappears entirely once its last connection
    /// is gone.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) {
        let mut guard = self.state.write().await;
        remove_pair(&mut guard.connections_by_user, user_id, connection_id);
        remove_pair(&mut guard.users_by_connection, connection_id, user_id);
    }

    /// Drop a connection from every user it registered under. Called from
    /// the disconnect path so a connection that registered but never
    /// joined a room is still cleaned up.
    pub async fn unregister_connection(&self, connection_id: &str) {
        let mut guard = self.state.write().await;
        let users = match guard.users_by_connection.remove(connection_id) {
            Some(users) => users,
            None => return,
        };
        for user_id in users {
            remove_pair(&mut guard.connections_by_user, &user_id, connection_id);
        }
    }

    /// Snapshot of a user's registered connections; empty for unknown
    /// users. Order is unspecified.
    pub async fn sessions_for(&self, user_id: &str) -> Vec<String> {
        let guard = self.state.read().await;
        guard
            .connections_by_user
            .get(user_id)
            .map(|connections| connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the whole registry, one (user, connections) pair per
    /// registered user. Used by registry-wide broadcast.
    pub async fn all_sessions(&self) -> Vec<(String, Vec<String>)> {
        let guard = self.state.read().await;
        guard
            .connections_by_user
            .iter()
            .map(|(user_id, connections)| {
                (user_id.clone(), connections.iter().cloned().collect())
            })
            .collect()
    }

    pub async fn registered_user_count(&self) -> usize {
        self.state.read().await.connections_by_user.len()
    }
}

fn remove_pair(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) {
    if let Some(values) = map.get_mut(key) {
        values.remove(value);
        if values.is_empty() {
            map.remove(key);
        }
    }
}

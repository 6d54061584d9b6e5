// Document presence tracking (who is in which room, over which connection).

use atrium_common::protocol::ws::PresenceEntry;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tracks room membership per document plus the reverse index used to
/// resolve a disconnect to every affected room in one pass.
///
/// Both maps live under a single lock so they can never disagree: every
/// document in a connection's reverse-index set contains that connection
/// as a member, and vice versa.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    state: Arc<RwLock<PresenceState>>,
}

#[derive(Debug, Default)]
struct PresenceState {
    /// document id -> connection id -> member entry.
    rooms: HashMap<String, HashMap<String, PresenceEntry>>,
    /// connection id -> document ids the connection is currently in.
    documents_by_connection: HashMap<String, HashSet<String>>,
}

impl PresenceTracker {
    /// Add a connection to a document's room and return the *other*
    /// current members, so the caller can tell the joiner who is already
    /// there.
    ///
    /// Idempotent per (document, connection): re-joining keeps a single
    /// entry and the original `joined_at`, refreshing the user fields.
    pub async fn join(
        &self,
        document_id: &str,
        user_id: &str,
        connection_id: &str,
        user_name: Option<String>,
        user_email: Option<String>,
    ) -> Vec<PresenceEntry> {
        let mut guard = self.state.write().await;

        let room = guard.rooms.entry(document_id.to_string()).or_default();
        match room.get_mut(connection_id) {
            Some(existing) => {
                existing.user_id = user_id.to_string();
                existing.user_name = user_name;
                existing.user_email = user_email;
            }
            None => {
                room.insert(
                    connection_id.to_string(),
                    PresenceEntry {
                        user_id: user_id.to_string(),
                        connection_id: connection_id.to_string(),
                        user_name,
                        user_email,
                        joined_at: Utc::now(),
                    },
                );
            }
        }

        let others: Vec<PresenceEntry> = room
            .values()
            .filter(|entry| entry.connection_id != connection_id)
            .cloned()
            .collect();

        guard
            .documents_by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(document_id.to_string());

        others
    }

    /// Remove a connection from a room. Returns the removed entry so the
    /// caller can announce who left, or `None` if the connection was not a
    /// member (leaving a room you are not in is a no-op, not an error).
    pub async fn leave(&self, document_id: &str, connection_id: &str) -> Option<PresenceEntry> {
        let mut guard = self.state.write().await;
        let removed = remove_member(&mut guard.rooms, document_id, connection_id);

        if let Some(documents) = guard.documents_by_connection.get_mut(connection_id) {
            documents.remove(document_id);
            if documents.is_empty() {
                guard.documents_by_connection.remove(connection_id);
            }
        }

        removed
    }

    /// Remove a connection from every room it belonged to, using the
    /// reverse index rather than a scan of all rooms. Returns one
    /// (document id, removed entry) pair per affected room.
    pub async fn disconnect_all(&self, connection_id: &str) -> Vec<(String, PresenceEntry)> {
        let mut guard = self.state.write().await;

        let documents = match guard.documents_by_connection.remove(connection_id) {
            Some(documents) => documents,
            None => return Vec::new(),
        };

        let mut left = Vec::with_capacity(documents.len());
        for document_id in documents {
            if let Some(entry) = remove_member(&mut guard.rooms, &document_id, connection_id) {
                left.push((document_id, entry));
            }
        }

        left
    }

    /// Snapshot of a room's current members. Order is unspecified.
    pub async fn members_of(&self, document_id: &str) -> Vec<PresenceEntry> {
        let guard = self.state.read().await;
        guard
            .rooms
            .get(document_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, document_id: &str, connection_id: &str) -> bool {
        let guard = self.state.read().await;
        guard
            .rooms
            .get(document_id)
            .is_some_and(|room| room.contains_key(connection_id))
    }

    pub async fn member_count(&self, document_id: &str) -> usize {
        let guard = self.state.read().await;
        guard.rooms.get(document_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Documents a connection is currently in. Order is unspecified.
    pub async fn documents_for(&self, connection_id: &str) -> Vec<String> {
        let guard = self.state.read().await;
        guard
            .documents_by_connection
            .get(connection_id)
            .map(|documents| documents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }
}

/// Remove one member from a room, garbage-collecting the room when its
/// last member leaves. Empty rooms must not survive in the index.
fn remove_member(
    rooms: &mut HashMap<String, HashMap<String, PresenceEntry>>,
    document_id: &str,
    connection_id: &str,
) -> Option<PresenceEntry> {
    let room = rooms.get_mut(document_id)?;
    let removed = room.remove(connection_id);
    if room.is_empty() {
        rooms.remove(document_id);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn join_simple(tracker: &PresenceTracker, doc: &str, user: &str, conn: &str) {
        tracker.join(doc, user, conn, Some(format!("{user} name")), None).await;
    }

    #[tokio::test]
    async fn first_joiner_sees_nobody_else() {
        let tracker = PresenceTracker::default();
        let others = tracker.join("d1", "u1", "c1", None, None).await;
        assert!(others.is_empty());
        assert_eq!(tracker.member_count("d1").await, 1);
    }

    #[tokio::test]
    async fn second_joiner_sees_the_first() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        let others = tracker.join("d1", "u2", "c2", None, None).await;

        assert_eq!(others.len(), 1);
        assert_eq!(others[0].user_id, "u1");
        assert_eq!(others[0].connection_id, "c1");
        assert_eq!(others[0].user_name.as_deref(), Some("u1 name"));
    }

    #[tokio::test]
    async fn join_is_idempotent_per_connection() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        join_simple(&tracker, "d1", "u1", "c1").await;

        assert_eq!(tracker.member_count("d1").await, 1);
        assert_eq!(tracker.members_of("d1").await.len(), 1);
    }

    #[tokio::test]
    async fn rejoin_keeps_joined_at_but_refreshes_user_fields() {
        let tracker = PresenceTracker::default();
        tracker.join("d1", "u1", "c1", Some("Old Name".into()), None).await;
        let first = tracker.members_of("d1").await.remove(0);

        tracker.join("d1", "u1", "c1", Some("New Name".into()), Some("u1@example.com".into())).await;
        let second = tracker.members_of("d1").await.remove(0);

        assert_eq!(second.joined_at, first.joined_at);
        assert_eq!(second.user_name.as_deref(), Some("New Name"));
        assert_eq!(second.user_email.as_deref(), Some("u1@example.com"));
    }

    #[tokio::test]
    async fn two_tabs_of_one_user_are_two_entries() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        let others = tracker.join("d1", "u1", "c2", None, None).await;

        assert_eq!(others.len(), 1);
        assert_eq!(others[0].connection_id, "c1");
        assert_eq!(tracker.member_count("d1").await, 2);
    }

    #[tokio::test]
    async fn leave_returns_the_removed_entry() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;

        let removed = tracker.leave("d1", "c1").await.expect("member should be removed");
        assert_eq!(removed.user_id, "u1");
        assert_eq!(removed.connection_id, "c1");
    }

    #[tokio::test]
    async fn leave_when_not_a_member_is_a_noop() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;

        assert!(tracker.leave("d1", "c2").await.is_none());
        assert!(tracker.leave("d-unknown", "c1").await.is_none());
        assert_eq!(tracker.member_count("d1").await, 1);
    }

    #[tokio::test]
    async fn join_then_leave_restores_both_indices() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        tracker.leave("d1", "c1").await;

        assert!(tracker.members_of("d1").await.is_empty());
        assert!(tracker.documents_for("c1").await.is_empty());
        assert!(!tracker.is_member("d1", "c1").await);
    }

    #[tokio::test]
    async fn empty_rooms_are_garbage_collected() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        join_simple(&tracker, "d2", "u1", "c1").await;
        assert_eq!(tracker.room_count().await, 2);

        tracker.leave("d1", "c1").await;
        assert_eq!(tracker.room_count().await, 1);

        tracker.disconnect_all("c1").await;
        assert_eq!(tracker.room_count().await, 0);
    }

    #[tokio::test]
    async fn room_survives_while_other_members_remain() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        join_simple(&tracker, "d1", "u2", "c2").await;

        tracker.leave("d1", "c1").await;
        assert_eq!(tracker.room_count().await, 1);
        let members = tracker.members_of("d1").await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].connection_id, "c2");
    }

    #[tokio::test]
    async fn disconnect_returns_one_pair_per_joined_document() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        join_simple(&tracker, "d2", "u1", "c1").await;
        join_simple(&tracker, "d3", "u1", "c1").await;
        // Another connection keeps d1 alive afterwards.
        join_simple(&tracker, "d1", "u2", "c2").await;

        let mut left = tracker.disconnect_all("c1").await;
        left.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(left.len(), 3);
        assert_eq!(left[0].0, "d1");
        assert_eq!(left[1].0, "d2");
        assert_eq!(left[2].0, "d3");
        assert!(left.iter().all(|(_, entry)| entry.connection_id == "c1"));

        for doc in ["d1", "d2", "d3"] {
            assert!(!tracker.is_member(doc, "c1").await);
        }
        assert!(tracker.documents_for("c1").await.is_empty());
        assert_eq!(tracker.member_count("d1").await, 1);
    }

    #[tokio::test]
    async fn disconnect_of_unknown_connection_is_empty() {
        let tracker = PresenceTracker::default();
        assert!(tracker.disconnect_all("c-unknown").await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;

        assert_eq!(tracker.disconnect_all("c1").await.len(), 1);
        assert!(tracker.disconnect_all("c1").await.is_empty());
    }

    #[tokio::test]
    async fn members_of_unknown_document_is_empty() {
        let tracker = PresenceTracker::default();
        assert!(tracker.members_of("d-unknown").await.is_empty());
        assert_eq!(tracker.member_count("d-unknown").await, 0);
    }

    #[tokio::test]
    async fn documents_for_lists_all_rooms_of_a_connection() {
        let tracker = PresenceTracker::default();
        join_simple(&tracker, "d1", "u1", "c1").await;
        join_simple(&tracker, "d2", "u1", "c1").await;

        let mut documents = tracker.documents_for("c1").await;
        documents.sort();
        assert_eq!(documents, vec!["d1", "d2"]);
    }
}

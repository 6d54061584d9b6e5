// Event routing: validates inbound events, mutates the shared presence
// state, and resolves each emission to its recipient set (the sender, the
// room minus the sender, or every session of a user).

use atrium_common::protocol::ws::{ClientEvent, ServerEvent};
use tokio::time::Instant;
use tracing::{error, info};

use crate::connections::ConnectionMap;
use crate::metrics;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::store::DocumentStore;

/// The connection-facing state machine. One instance per process, shared
/// by every socket task; all state lives in the injected stores.
#[derive(Clone)]
pub struct EventRouter {
    pub(crate) presence: PresenceTracker,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) connections: ConnectionMap,
    store: DocumentStore,
}

impl EventRouter {
    pub fn new(
        presence: PresenceTracker,
        registry: ConnectionRegistry,
        connections: ConnectionMap,
        store: DocumentStore,
    ) -> Self {
        Self { presence, registry, connections, store }
    }

    /// Handle one inbound event. Never fails upward: every failure mode is
    /// either an `error` event to the sender or a silent drop.
    pub async fn dispatch(&self, connection_id: &str, event: ClientEvent) {
        let label = event_label(&event);
        let started_at = Instant::now();

        let is_error = match event {
            ClientEvent::JoinDocument { document_id, user_id, user_name, user_email } => {
                self.handle_join_document(connection_id, document_id, user_id, user_name, user_email)
                    .await
            }
            ClientEvent::LeaveDocument { document_id } => {
                self.handle_leave_document(connection_id, document_id).await
            }
            ClientEvent::CursorMove { document_id, position, selection } => {
                self.handle_cursor_move(connection_id, document_id, position, selection).await
            }
            ClientEvent::EditContent { document_id, operation, version } => {
                self.handle_edit_content(connection_id, document_id, operation, version).await
            }
            ClientEvent::GetDocumentUsers { document_id } => {
                self.handle_get_document_users(connection_id, document_id).await
            }
            ClientEvent::RegisterUser { user_id } => {
                self.handle_register_user(connection_id, user_id).await
            }
            ClientEvent::UnregisterUser { user_id } => {
                self.handle_unregister_user(connection_id, user_id).await
            }
            ClientEvent::RequestSync { document_id, current_version } => {
                self.handle_request_sync(connection_id, document_id, current_version).await
            }
            ClientEvent::Ping {} => {
                self.connections.send_to(connection_id, ServerEvent::Pong {}).await;
                false
            }
        };

        metrics::record_ws_event(label, is_error, started_at.elapsed().as_millis() as u64);
    }

    /// Transport-declared death of a connection. Resolves every room the
    /// connection was in through the reverse index, announces one
    /// `user_left` per room, and drops any notification registrations.
    /// Idempotent, so duplicate cleanup paths cannot fail.
    pub async fn handle_disconnect(&self, connection_id: &str) {
        let left = self.presence.disconnect_all(connection_id).await;
        let room_count = left.len();

        for (document_id, entry) in left {
            let remaining = self.room_peers_excluding(&document_id, connection_id).await;
            self.connections
                .send_to_each(
                    &remaining,
                    ServerEvent::UserLeft {
                        document_id: document_id.clone(),
                        user_id: entry.user_id,
                        user_name: entry.user_name,
                        connection_id: connection_id.to_string(),
                    },
                )
                .await;
        }

        self.registry.unregister_connection(connection_id).await;
        metrics::set_open_rooms(self.presence.room_count().await as i64);

        if room_count > 0 {
            info!(connection_id = %connection_id, rooms = room_count, "disconnect cleanup complete");
        }
    }

    async fn handle_join_document(
        &self,
        connection_id: &str,
        document_id: Option<String>,
        user_id: Option<String>,
        user_name: Option<String>,
        user_email: Option<String>,
    ) -> bool {
        let (Some(document_id), Some(user_id)) = (required(document_id), required(user_id)) else {
            self.emit_error(connection_id, "document_id and user_id are required").await;
            return true;
        };

        let others = self
            .presence
            .join(&document_id, &user_id, connection_id, user_name.clone(), user_email.clone())
            .await;
        metrics::set_open_rooms(self.presence.room_count().await as i64);

        let peer_ids: Vec<&str> = others.iter().map(|entry| entry.connection_id.as_str()).collect();

        self.connections
            .send_to(
                connection_id,
                ServerEvent::DocumentJoined { document_id: document_id.clone(), users: others.clone() },
            )
            .await;
        self.connections
            .send_to_each(
                peer_ids,
                ServerEvent::UserJoined {
                    document_id: document_id.clone(),
                    user_id: user_id.clone(),
                    user_name,
                    user_email,
                    connection_id: connection_id.to_string(),
                },
            )
            .await;

        info!(connection_id = %connection_id, document_id = %document_id, user_id = %user_id, "joined document");
        false
    }

    async fn handle_leave_document(
        &self,
        connection_id: &str,
        document_id: Option<String>,
    ) -> bool {
        let Some(document_id) = required(document_id) else {
            self.emit_error(connection_id, "document_id is required").await;
            return true;
        };

        if let Some(entry) = self.presence.leave(&document_id, connection_id).await {
            let remaining = self.room_peers_excluding(&document_id, connection_id).await;
            self.connections
                .send_to_each(
                    &remaining,
                    ServerEvent::UserLeft {
                        document_id: document_id.clone(),
                        user_id: entry.user_id,
                        user_name: entry.user_name,
                        connection_id: connection_id.to_string(),
                    },
                )
                .await;
        }
        metrics::set_open_rooms(self.presence.room_count().await as i64);

        // Acknowledge whether or not a member was actually removed.
        self.connections
            .send_to(connection_id, ServerEvent::DocumentLeft { document_id: document_id.clone() })
            .await;

        info!(connection_id = %connection_id, document_id = %document_id, "left document");
        false
    }

    async fn handle_cursor_move(
        &self,
        connection_id: &str,
        document_id: Option<String>,
        position: Option<serde_json::Value>,
        selection: Option<serde_json::Value>,
    ) -> bool {
        // Cursor spam must never crash the router or answer with errors;
        // incomplete frames are dropped.
        let (Some(document_id), Some(position)) = (required(document_id), position) else {
            return false;
        };

        let peers = self.room_peers_excluding(&document_id, connection_id).await;
        self.connections
            .send_to_each(
                &peers,
                ServerEvent::CursorUpdate {
                    document_id,
                    connection_id: connection_id.to_string(),
                    position,
                    selection,
                },
            )
            .await;
        false
    }

    async fn handle_edit_content(
        &self,
        connection_id: &str,
        document_id: Option<String>,
        operation: Option<serde_json::Value>,
        version: Option<i64>,
    ) -> bool {
        let (Some(document_id), Some(operation)) = (required(document_id), operation) else {
            self.emit_error(connection_id, "document_id and operation are required").await;
            return true;
        };

        // Pure relay: the operation payload and version marker pass through
        // untouched, and only the other room members receive them.
        let peers = self.room_peers_excluding(&document_id, connection_id).await;
        self.connections
            .send_to_each(
                &peers,
                ServerEvent::ContentUpdate {
                    document_id,
                    connection_id: connection_id.to_string(),
                    operation,
                    version,
                },
            )
            .await;
        false
    }

    async fn handle_get_document_users(
        &self,
        connection_id: &str,
        document_id: Option<String>,
    ) -> bool {
        let Some(document_id) = required(document_id) else {
            self.emit_error(connection_id, "document_id is required").await;
            return true;
        };

        let users = self.presence.members_of(&document_id).await;
        self.connections
            .send_to(connection_id, ServerEvent::DocumentUsers { document_id, users })
            .await;
        false
    }

    async fn handle_register_user(&self, connection_id: &str, user_id: Option<String>) -> bool {
        let Some(user_id) = required(user_id) else {
            self.emit_error(connection_id, "user_id is required").await;
            return true;
        };

        self.registry.register(&user_id, connection_id).await;
        self.connections
            .send_to(
                connection_id,
                ServerEvent::UserRegistered {
                    user_id: user_id.clone(),
                    connection_id: connection_id.to_string(),
                },
            )
            .await;

        info!(connection_id = %connection_id, user_id = %user_id, "registered for notifications");
        false
    }

    async fn handle_unregister_user(&self, connection_id: &str, user_id: Option<String>) -> bool {
        // Unregistering nothing is a quiet no-op.
        if let Some(user_id) = required(user_id) {
            self.registry.unregister(&user_id, connection_id).await;
            self.connections
                .send_to(connection_id, ServerEvent::UserUnregistered { user_id })
                .await;
        }
        false
    }

    async fn handle_request_sync(
        &self,
        connection_id: &str,
        document_id: Option<String>,
        _current_version: Option<i64>,
    ) -> bool {
        let Some(document_id) = required(document_id) else {
            self.emit_error(connection_id, "document_id is required").await;
            return true;
        };

        // The only I/O in the router. No presence lock is held here.
        match self.store.load(&document_id).await {
            Ok(Some(snapshot)) => {
                self.connections
                    .send_to(
                        connection_id,
                        ServerEvent::SyncResponse {
                            document_id,
                            content: snapshot.content,
                            version: snapshot.version,
                        },
                    )
                    .await;
                false
            }
            Ok(None) => {
                self.emit_error(connection_id, "document not found").await;
                true
            }
            Err(err) => {
                error!(error = ?err, document_id = %document_id, "sync read failed");
                self.emit_error(connection_id, "failed to sync document").await;
                true
            }
        }
    }

    async fn room_peers_excluding(&self, document_id: &str, exclude_connection: &str) -> Vec<String> {
        self.presence
            .members_of(document_id)
            .await
            .into_iter()
            .map(|entry| entry.connection_id)
            .filter(|id| id != exclude_connection)
            .collect()
    }

    async fn emit_error(&self, connection_id: &str, message: &str) {
        self.connections.send_to(connection_id, ServerEvent::error(message)).await;
    }
}

fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.trim().is_empty())
}

fn event_label(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::JoinDocument { .. } => "join_document",
        ClientEvent::LeaveDocument { .. } => "leave_document",
        ClientEvent::CursorMove { .. } => "cursor_move",
        ClientEvent::EditContent { .. } => "edit_content",
        ClientEvent::GetDocumentUsers { .. } => "get_document_users",
        ClientEvent::RegisterUser { .. } => "register_user",
        ClientEvent::UnregisterUser { .. } => "unregister_user",
        ClientEvent::RequestSync { .. } => "request_sync",
        ClientEvent::Ping {} => "ping",
    }
}

// WebSocket message types for the atrium-presence.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One room member as reported to clients.
///
/// A member is a (user, connection) pair: two tabs of the same user appear
/// as two entries sharing a `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Client -> Server events.
///
/// Fields the router requires are still `Option` here: a frame with a
/// missing field must decode so the router can answer with an `error`
/// event for that specific request instead of a generic parse failure.
/// There is no `connect`/`disconnect` variant; those are the socket's
/// open and close, not frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinDocument {
        document_id: Option<String>,
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_email: Option<String>,
    },
    LeaveDocument {
        document_id: Option<String>,
    },
    /// Cursor position relay. `position` and `selection` are opaque JSON;
    /// the hub never interprets them.
    CursorMove {
        document_id: Option<String>,
        position: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<serde_json::Value>,
    },
    /// Edit operation relay. `operation` is an opaque payload and
    /// `version` an opaque marker; the hub does not merge or sequence.
    EditContent {
        document_id: Option<String>,
        operation: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
    },
    GetDocumentUsers {
        document_id: Option<String>,
    },
    RegisterUser {
        user_id: Option<String>,
    },
    UnregisterUser {
        user_id: Option<String>,
    },
    RequestSync {
        document_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_version: Option<i64>,
    },
    Ping {},
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event on every socket: the id assigned to this connection.
    Connected {
        connection_id: String,
    },

    /// Join acknowledgement listing the *other* current room members.
    DocumentJoined {
        document_id: String,
        users: Vec<PresenceEntry>,
    },

    /// Someone else entered a room you are in.
    UserJoined {
        document_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_email: Option<String>,
        connection_id: String,
    },

    /// Leave acknowledgement to the leaver.
    DocumentLeft {
        document_id: String,
    },

    /// Someone else left a room you are in (explicitly or by disconnect).
    UserLeft {
        document_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        connection_id: String,
    },

    CursorUpdate {
        document_id: String,
        connection_id: String,
        position: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<serde_json::Value>,
    },

    ContentUpdate {
        document_id: String,
        connection_id: String,
        operation: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
    },

    DocumentUsers {
        document_id: String,
        users: Vec<PresenceEntry>,
    },

    UserRegistered {
        user_id: String,
        connection_id: String,
    },

    UserUnregistered {
        user_id: String,
    },

    SyncResponse {
        document_id: String,
        content: String,
        version: i64,
    },

    /// Out-of-band document change fanned out to a whole room.
    DocumentChanged {
        document_id: String,
        change_type: String,
        data: serde_json::Value,
    },

    /// Asynchronous notification; the payload is caller-defined.
    Notification {
        #[serde(flatten)]
        payload: serde_json::Value,
    },

    Pong {},

    Error {
        message: String,
    },
}

/// Failure to decode an inbound text frame.
#[derive(Debug, thiserror::Error)]
#[error("invalid event frame: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl ClientEvent {
    /// Decode a text frame. Unknown event types and type mismatches are
    /// decode errors; missing fields are not (see the enum docs).
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl ServerEvent {
    /// Shorthand for the `error {message}` event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

// Notification fan-out: the entry point for REST handlers and background
// jobs that need to reach a user's live connections. Reads the connection
// registry only; document presence is touched solely by the
// document-changed room broadcast.

use atrium_common::protocol::ws::ServerEvent;
use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::info;

use crate::connections::ConnectionMap;
use crate::error::{ErrorCode, HubError};
use crate::metrics;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct NotificationDispatcher {
    registry: ConnectionRegistry,
    connections: ConnectionMap,
}

impl NotificationDispatcher {
    pub fn new(registry: ConnectionRegistry, connections: ConnectionMap) -> Self {
        Self { registry, connections }
    }

    /// Push a payload to every registered connection of a user. A user
    /// with no live registrations is a silent no-op; the caller is
    /// expected to have durably recorded the notification before asking
    /// for delivery, so best-effort is acceptable here.
    pub async fn dispatch(&self, user_id: &str, payload: Value) -> usize {
        let sessions = self.registry.sessions_for(user_id).await;
        let delivered = self
            .connections
            .send_to_each(&sessions, ServerEvent::Notification { payload })
            .await;
        metrics::record_notification_dispatch(delivered as u64);
        if delivered > 0 {
            info!(user_id = %user_id, delivered, "notification dispatched");
        }
        delivered
    }

    /// Push a payload to every connection of every registered user,
    /// optionally skipping one user. A connection registered under
    /// several users receives the payload once.
    pub async fn broadcast_all(&self, payload: Value, exclude_user_id: Option<&str>) -> usize {
        let mut recipients: HashSet<String> = HashSet::new();
        for (user_id, sessions) in self.registry.all_sessions().await {
            if Some(user_id.as_str()) == exclude_user_id {
                continue;
            }
            recipients.extend(sessions);
        }

        let delivered = self
            .connections
            .send_to_each(&recipients, ServerEvent::Notification { payload })
            .await;
        metrics::record_notification_dispatch(delivered as u64);
        delivered
    }
}

// ── HTTP entry points ───────────────────────────────────────────────

#[derive(Clone)]
struct NotifyState {
    dispatcher: NotificationDispatcher,
    presence: PresenceTracker,
    connections: ConnectionMap,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub user_id: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub payload: Value,
    #[serde(default)]
    pub exclude_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DocumentChangedRequest {
    pub change_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub delivered: usize,
}

pub fn router(
    dispatcher: NotificationDispatcher,
    presence: PresenceTracker,
    connections: ConnectionMap,
) -> Router {
    Router::new()
        .route("/v1/notifications/dispatch", post(dispatch_notification))
        .route("/v1/notifications/broadcast", post(broadcast_notification))
        .route("/v1/documents/{document_id}/changed", post(document_changed))
        .with_state(NotifyState { dispatcher, presence, connections })
}

async fn dispatch_notification(
    State(state): State<NotifyState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DeliveryResponse>, HubError> {
    if request.user_id.trim().is_empty() {
        return Err(HubError::new(ErrorCode::ValidationFailed, "user_id is required"));
    }
    require_object_payload(&request.payload)?;

    let delivered = state.dispatcher.dispatch(&request.user_id, request.payload).await;
    Ok(Json(DeliveryResponse { delivered }))
}

async fn broadcast_notification(
    State(state): State<NotifyState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<DeliveryResponse>, HubError> {
    require_object_payload(&request.payload)?;

    let delivered = state
        .dispatcher
        .broadcast_all(request.payload, request.exclude_user_id.as_deref())
        .await;
    Ok(Json(DeliveryResponse { delivered }))
}

/// Fan a change announcement out to everyone currently in the document's
/// room, including any connection that triggered the change over HTTP.
async fn document_changed(
    Path(document_id): Path<String>,
    State(state): State<NotifyState>,
    Json(request): Json<DocumentChangedRequest>,
) -> Result<Json<DeliveryResponse>, HubError> {
    if request.change_type.trim().is_empty() {
        return Err(HubError::new(ErrorCode::ValidationFailed, "change_type is required"));
    }

    let members = state.presence.members_of(&document_id).await;
    let member_ids: Vec<String> =
        members.into_iter().map(|entry| entry.connection_id).collect();
    let delivered = state
        .connections
        .send_to_each(
            &member_ids,
            ServerEvent::DocumentChanged {
                document_id,
                change_type: request.change_type,
                data: request.data,
            },
        )
        .await;
    Ok(Json(DeliveryResponse { delivered }))
}

fn require_object_payload(payload: &Value) -> Result<(), HubError> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(HubError::new(ErrorCode::ValidationFailed, "payload must be a json object"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn fixture() -> (NotificationDispatcher, ConnectionRegistry, ConnectionMap, PresenceTracker) {
        let registry = ConnectionRegistry::default();
        let connections = ConnectionMap::default();
        let presence = PresenceTracker::default();
        let dispatcher = NotificationDispatcher::new(registry.clone(), connections.clone());
        (dispatcher, registry, connections, presence)
    }

    async fn open_connection(
        connections: &ConnectionMap,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        connections.insert(id, tx).await;
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ── Dispatcher ─────────────────────────────────────────────────

    #[tokio::test]
    async fn dispatch_fans_out_to_every_session_of_the_user() {
        let (dispatcher, registry, connections, _presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        let mut rx_b = open_connection(&connections, "cb").await;
        let mut rx_other = open_connection(&connections, "cx").await;
        registry.register("u1", "ca").await;
        registry.register("u1", "cb").await;
        registry.register("u2", "cx").await;

        let delivered = dispatcher.dispatch("u1", json!({"title": "hello"})).await;

        assert_eq!(delivered, 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::Notification { payload } => assert_eq!(payload["title"], "hello"),
                other => panic!("expected notification, got {other:?}"),
            }
        }
        assert!(drain(&mut rx_other).is_empty());
    }

    #[tokio::test]
    async fn dispatch_after_unregister_reaches_remaining_sessions_only() {
        let (dispatcher, registry, connections, _presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        let mut rx_b = open_connection(&connections, "cb").await;
        registry.register("u1", "ca").await;
        registry.register("u1", "cb").await;

        registry.unregister("u1", "ca").await;
        let delivered = dispatcher.dispatch("u1", json!({"n": 1})).await;

        assert_eq!(delivered, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_user_is_a_silent_noop() {
        let (dispatcher, _registry, _connections, _presence) = fixture();
        assert_eq!(dispatcher.dispatch("u-ghost", json!({"n": 1})).await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_except_the_excluded_user() {
        let (dispatcher, registry, connections, _presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        let mut rx_b = open_connection(&connections, "cb").await;
        let mut rx_c = open_connection(&connections, "cc").await;
        registry.register("u1", "ca").await;
        registry.register("u2", "cb").await;
        registry.register("u3", "cc").await;

        let delivered = dispatcher.broadcast_all(json!({"m": "maintenance"}), Some("u2")).await;

        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(drain(&mut rx_c).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_delivers_once_to_multi_user_connections() {
        let (dispatcher, registry, connections, _presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        registry.register("u1", "ca").await;
        registry.register("u2", "ca").await;

        let delivered = dispatcher.broadcast_all(json!({"m": "hi"}), None).await;

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    // ── HTTP surface ───────────────────────────────────────────────

    fn test_app(
        dispatcher: NotificationDispatcher,
        presence: PresenceTracker,
        connections: ConnectionMap,
    ) -> Router {
        router(dispatcher, presence, connections)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let parsed = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn dispatch_endpoint_reports_delivery_count() {
        let (dispatcher, registry, connections, presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        registry.register("u1", "ca").await;
        let app = test_app(dispatcher, presence, connections);

        let (status, body) = post_json(
            app,
            "/v1/notifications/dispatch",
            json!({"user_id": "u1", "payload": {"type": "new_notification", "notification": {"title": "hi"}}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);
        let events = drain(&mut rx_a);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Notification { payload } => {
                assert_eq!(payload["type"], "new_notification");
                assert_eq!(payload["notification"]["title"], "hi");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_endpoint_rejects_blank_user_and_non_object_payload() {
        let (dispatcher, _registry, connections, presence) = fixture();
        let app = test_app(dispatcher.clone(), presence.clone(), connections.clone());
        let (status, body) =
            post_json(app, "/v1/notifications/dispatch", json!({"user_id": " ", "payload": {}}))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        let app = test_app(dispatcher, presence, connections);
        let (status, body) = post_json(
            app,
            "/v1/notifications/dispatch",
            json!({"user_id": "u1", "payload": "plain string"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "payload must be a json object");
    }

    #[tokio::test]
    async fn broadcast_endpoint_excludes_the_named_user() {
        let (dispatcher, registry, connections, presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        let mut rx_b = open_connection(&connections, "cb").await;
        registry.register("u1", "ca").await;
        registry.register("u2", "cb").await;
        let app = test_app(dispatcher, presence, connections);

        let (status, body) = post_json(
            app,
            "/v1/notifications/broadcast",
            json!({"payload": {"m": "ship it"}, "exclude_user_id": "u1"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn document_changed_reaches_the_whole_room() {
        let (dispatcher, _registry, connections, presence) = fixture();
        let mut rx_a = open_connection(&connections, "ca").await;
        let mut rx_b = open_connection(&connections, "cb").await;
        let mut rx_out = open_connection(&connections, "cx").await;
        presence.join("d1", "u1", "ca", None, None).await;
        presence.join("d1", "u2", "cb", None, None).await;
        let app = test_app(dispatcher, presence, connections);

        let (status, body) = post_json(
            app,
            "/v1/documents/d1/changed",
            json!({"change_type": "update", "data": {"name": "notes.md"}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::DocumentChanged { document_id, change_type, data } => {
                    assert_eq!(document_id, "d1");
                    assert_eq!(change_type, "update");
                    assert_eq!(data["name"], "notes.md");
                }
                other => panic!("expected document_changed, got {other:?}"),
            }
        }
        assert!(drain(&mut rx_out).is_empty());
    }

    #[tokio::test]
    async fn document_changed_for_empty_room_delivers_zero() {
        let (dispatcher, _registry, connections, presence) = fixture();
        let app = test_app(dispatcher, presence, connections);

        let (status, body) =
            post_json(app, "/v1/documents/d-empty/changed", json!({"change_type": "delete"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 0);
    }
}

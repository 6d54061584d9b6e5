mod config;
mod connections;
mod cors;
mod error;
mod metrics;
mod notify;
mod presence;
mod registry;
mod store;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::connections::ConnectionMap;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::HubMetrics;
use crate::notify::NotificationDispatcher;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::store::DocumentStore;
use crate::ws::EventRouter;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let hub_metrics = Arc::new(HubMetrics::default());
    metrics::set_global_metrics(Arc::clone(&hub_metrics));

    let store = DocumentStore::from_config(config.database_url.as_deref())
        .await
        .context("failed to initialize document store")?;
    if config.database_url.is_none() {
        warn!("no database url configured, request_sync serves the in-memory store");
    }

    let app = build_router(
        PresenceTracker::default(),
        ConnectionRegistry::default(),
        ConnectionMap::default(),
        store,
        hub_metrics,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind hub listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting presence hub");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("hub server exited unexpectedly")
}

fn build_router(
    presence: PresenceTracker,
    registry: ConnectionRegistry,
    connections: ConnectionMap,
    store: DocumentStore,
    hub_metrics: Arc<HubMetrics>,
) -> Router {
    let event_router =
        EventRouter::new(presence.clone(), registry.clone(), connections.clone(), store);
    let dispatcher = NotificationDispatcher::new(registry, connections.clone());

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route(
                "/metrics",
                get(move || {
                    let hub_metrics = Arc::clone(&hub_metrics);
                    async move { hub_metrics.render_prometheus() }
                }),
            )
            .merge(ws::router(event_router))
            .merge(notify::router(dispatcher, presence, connections)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors::cors_layer())
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response =
        with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

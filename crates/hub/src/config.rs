// Hub server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The CORS layer reads its own env var — this module covers
// the core server settings.

use std::net::SocketAddr;

/// Core hub server configuration.
///
/// Constructed via [`HubConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string for the document store. When unset the
    /// hub runs with an in-memory store and `request_sync` only sees
    /// documents seeded by tests.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `atrium_hub=debug`).
    pub log_filter: String,
}

impl HubConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ATRIUM_HUB_HOST` | `0.0.0.0` |
    /// | `ATRIUM_HUB_PORT` | `8080` |
    /// | `ATRIUM_HUB_DATABASE_URL` | *(none — in-memory document store)* |
    /// | `ATRIUM_HUB_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `ATRIUM_HUB_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("ATRIUM_HUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ATRIUM_HUB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("ATRIUM_HUB_DATABASE_URL").ok();
        let cors_origins = env("ATRIUM_HUB_CORS_ORIGINS").ok();

        let log_filter = env("ATRIUM_HUB_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, database_url, cors_origins, log_filter }
    }
}

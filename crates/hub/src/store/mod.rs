// Document store collaborator backing `request_sync`.
//
// The hub never owns document content; it reads the current text and an
// opaque version marker from whatever persistence the deployment provides.
// The Memory backend serves tests and store-less development runs.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Current content and version marker for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: i64,
}

#[derive(Clone)]
pub enum DocumentStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<HashMap<String, DocumentSnapshot>>>),
}

impl DocumentStore {
    /// Connect to Postgres when a url is configured, otherwise fall back
    /// to the in-memory backend.
    pub async fn from_config(database_url: Option<&str>) -> anyhow::Result<Self> {
        match database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(url)
                    .await
                    .context("failed to connect document store pool")?;
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("document store health check failed")?;
                Ok(Self::Postgres(pool))
            }
            None => Ok(Self::memory()),
        }
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Load a document's current content and version. `Ok(None)` means the
    /// document does not exist; `Err` is any read failure.
    ///
    /// The version marker is the row's `updated_at` as epoch seconds,
    /// opaque to the hub and monotonic enough for clients to compare.
    pub async fn load(&self, document_id: &str) -> anyhow::Result<Option<DocumentSnapshot>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (String, i64)>(
                    r#"
                    SELECT content, floor(extract(epoch FROM updated_at))::bigint
                    FROM documents
                    WHERE id = $1
                    "#,
                )
                .bind(document_id)
                .fetch_optional(pool)
                .await
                .context("failed to load document for sync")?;

                Ok(row.map(|(content, version)| DocumentSnapshot { content, version }))
            }
            Self::Memory(store) => Ok(store.read().await.get(document_id).cloned()),
        }
    }

    /// Seed a document into the Memory backend. No-op on Postgres, where
    /// content is owned by the surrounding application.
    pub async fn seed(&self, document_id: &str, content: &str, version: i64) {
        if let Self::Memory(store) = self {
            store.write().await.insert(
                document_id.to_string(),
                DocumentSnapshot { content: content.to_string(), version },
            );
        }
    }
}

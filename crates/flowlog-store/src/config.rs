//! Configuration for selecting and building an event log backend
//!
//! Backend choice and tuning live in one named-options struct so embedding
//! applications can deserialize it straight from their own config files.

use crate::error::{Error, Result};
use crate::storage::{
    ConsolidatedSqliteEventLogStorage, EventLogStorage, InMemoryEventLogStorage,
    PostgresEventLogStorage, SqliteEventLogStorage,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_BUSY_RETRY_LIMIT: u32 = 5;
pub(crate) const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Which backend an [`EventLogConfig`] selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local, non-durable; for tests
    InMemory,
    /// Postgres via `postgres_url`
    Postgres,
    /// One SQLite file per run under `base_dir`
    Sqlite,
    /// A single shared SQLite file under `base_dir`
    ConsolidatedSqlite,
}

/// Event log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Backend selection
    pub backend: StorageBackend,
    /// Connection URL; required when `backend` is `postgres`
    pub postgres_url: Option<String>,
    /// Root directory for the file backends; defaults to the platform data
    /// dir under `flowlog`
    pub base_dir: Option<PathBuf>,
    /// Subscription poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Retry ceiling for busy-database writes on the consolidated backend
    pub busy_retry_limit: u32,
    /// Connection pool size for the SQL backends
    pub max_connections: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            postgres_url: None,
            base_dir: None,
            poll_interval_ms: 500,
            busy_retry_limit: DEFAULT_BUSY_RETRY_LIMIT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl EventLogConfig {
    /// Configuration for the in-memory backend
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: StorageBackend::InMemory,
            ..Default::default()
        }
    }

    /// Configuration for the per-run SQLite backend rooted at `base_dir`
    #[must_use]
    pub fn sqlite(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            base_dir: Some(base_dir.into()),
            ..Default::default()
        }
    }

    /// Configuration for the consolidated SQLite backend rooted at `base_dir`
    #[must_use]
    pub fn consolidated_sqlite(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::ConsolidatedSqlite,
            base_dir: Some(base_dir.into()),
            ..Default::default()
        }
    }

    /// Configuration for the Postgres backend
    #[must_use]
    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Postgres,
            postgres_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Subscription poll interval as a `Duration`
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Build the configured backend.
    ///
    /// Fails with [`Error::Config`] on incomplete configuration and
    /// [`Error::StorageUnavailable`] if the backing medium cannot be reached.
    pub async fn connect(&self) -> Result<Arc<dyn EventLogStorage>> {
        let store: Arc<dyn EventLogStorage> = match self.backend {
            StorageBackend::InMemory => Arc::new(InMemoryEventLogStorage::new()),
            StorageBackend::Postgres => {
                let url = self.postgres_url.as_deref().ok_or_else(|| {
                    Error::Config("postgres backend requires postgres_url".to_string())
                })?;
                Arc::new(
                    PostgresEventLogStorage::connect_with(url, self.max_connections)
                        .await?
                        .with_poll_interval(self.poll_interval()),
                )
            }
            StorageBackend::Sqlite => Arc::new(
                SqliteEventLogStorage::new(self.resolved_base_dir())
                    .with_poll_interval(self.poll_interval())
                    .with_max_connections(self.max_connections),
            ),
            StorageBackend::ConsolidatedSqlite => Arc::new(
                ConsolidatedSqliteEventLogStorage::open_with(
                    self.resolved_base_dir(),
                    self.max_connections,
                )
                .await?
                .with_poll_interval(self.poll_interval())
                .with_busy_retry_limit(self.busy_retry_limit),
            ),
        };
        info!(backend = store.name(), "event log storage configured");
        Ok(store)
    }
}

/// Default root directory for the file backends
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("flowlog"))
        .unwrap_or_else(|| PathBuf::from(".flowlog"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDraft, EventType};
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = EventLogConfig::default();
        assert_eq!(config.backend, StorageBackend::Sqlite);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.busy_retry_limit, 5);
    }

    #[test]
    fn config_deserializes_from_named_options() {
        let config: EventLogConfig = serde_json::from_str(
            r#"{"backend": "consolidated_sqlite", "base_dir": "/var/lib/flowlog", "poll_interval_ms": 100}"#,
        )
        .unwrap();
        assert_eq!(config.backend, StorageBackend::ConsolidatedSqlite);
        assert_eq!(config.base_dir.as_deref(), Some(std::path::Path::new("/var/lib/flowlog")));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn postgres_requires_a_url() {
        let config = EventLogConfig {
            backend: StorageBackend::Postgres,
            ..Default::default()
        };
        let err = tokio_test::block_on(config.connect()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn connect_builds_each_local_backend() {
        let dir = TempDir::new().unwrap();

        let mem = EventLogConfig::in_memory().connect().await.unwrap();
        assert_eq!(mem.name(), "in_memory");
        assert!(mem.as_asset_aware().is_some());

        let sqlite = EventLogConfig::sqlite(dir.path().join("per-run"))
            .connect()
            .await
            .unwrap();
        assert_eq!(sqlite.name(), "sqlite");

        let consolidated = EventLogConfig::consolidated_sqlite(dir.path().join("single"))
            .connect()
            .await
            .unwrap();
        assert_eq!(consolidated.name(), "consolidated_sqlite");

        // The trait object is usable end to end.
        let seq = consolidated
            .append("r1", EventDraft::new(EventType::StepStarted))
            .await
            .unwrap();
        assert_eq!(consolidated.events_after("r1", 0).await.unwrap().len(), 1);
        assert_eq!(seq, 1);
    }
}

//! Postgres event log storage
//!
//! The relational backend: any Postgres instance reachable through sqlx. Owns
//! the transactional append path (event row and asset index row commit or
//! roll back together) and relies on the engine's default isolation for
//! reads, so writers never block readers. Postgres offers no uniform push
//! channel for the abstract contract, so subscriptions run the shared poll
//! loop.

use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::event::{AssetKey, EventDraft, EventRecord};
use crate::storage::schema;
use crate::storage::subscription::{spawn_poll_loop, EventSubscription};
use crate::storage::{AssetAwareEventLogStorage, EventLogStorage};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

/// Relational event log backend over Postgres
#[derive(Debug, Clone)]
pub struct PostgresEventLogStorage {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresEventLogStorage {
    /// Connect to the given Postgres URL and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit connection pool size
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let store = Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        store.run_migrations().await?;

        info!("postgres event log storage initialized");
        Ok(store)
    }

    /// Create a store from an existing connection pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the subscription poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn run_migrations(&self) -> Result<()> {
        for statement in [
            schema::POSTGRES_EVENTS_TABLE,
            schema::POSTGRES_ASSET_INDEX_TABLE,
        ]
        .iter()
        .chain(schema::POSTGRES_INDEXES)
        {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }
        debug!("database migrations completed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventLogStorage for PostgresEventLogStorage {
    async fn append(&self, run_id: &str, draft: EventDraft) -> Result<i64> {
        draft.validate()?;
        let asset_id = draft
            .asset_key
            .as_ref()
            .map(AssetKey::to_storage_id)
            .transpose()?;
        let timestamp = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO events (run_id, timestamp, event_type, step_key, asset_key, partition_key, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(timestamp)
        .bind(draft.event_type.as_str())
        .bind(draft.step_key.as_deref())
        .bind(asset_id.as_deref())
        .bind(draft.partition.as_deref())
        .bind(&draft.payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let sequence_id: i64 = row.get("id");

        if let Some(asset_id) = &asset_id {
            sqlx::query(
                r#"
                INSERT INTO asset_index (asset_key, partition_key, run_id, event_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(asset_id)
            .bind(draft.partition.as_deref())
            .bind(run_id)
            .bind(sequence_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        debug!(run_id, sequence_id, event_type = %draft.event_type, "appended event");
        Ok(sequence_id)
    }

    async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, timestamp, event_type, step_key, asset_key, partition_key, payload
            FROM events
            WHERE run_id = $1 AND id > $2
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        sqlx::query("DELETE FROM asset_index WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        sqlx::query("DELETE FROM events WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        debug!(run_id, "deleted run");
        Ok(())
    }

    async fn subscribe(&self, run_id: &str, from_cursor: i64) -> Result<EventSubscription> {
        Ok(spawn_poll_loop(
            self.clone(),
            run_id.to_string(),
            from_cursor,
            self.poll_interval,
        ))
    }

    fn as_asset_aware(&self) -> Option<&dyn AssetAwareEventLogStorage> {
        Some(self)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[async_trait::async_trait]
impl AssetAwareEventLogStorage for PostgresEventLogStorage {
    async fn asset_events(
        &self,
        asset_key: &AssetKey,
        partition: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.run_id, e.timestamp, e.event_type, e.step_key, e.asset_key, e.partition_key, e.payload
            FROM events e
            JOIN asset_index a ON a.event_id = e.id
            WHERE a.asset_key = $1
              AND ($2::text IS NULL OR a.partition_key = $2)
              AND ($3::timestamptz IS NULL OR e.timestamp < $3)
            ORDER BY e.id ASC
            "#,
        )
        .bind(asset_key.to_storage_id()?)
        .bind(partition)
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn known_asset_keys(&self) -> Result<Vec<AssetKey>> {
        let rows = sqlx::query("SELECT DISTINCT asset_key FROM asset_index ORDER BY asset_key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        rows.iter()
            .map(|row| AssetKey::from_storage_id(row.get("asset_key")))
            .collect()
    }
}

/// Convert a Postgres row to an EventRecord
fn row_to_event(row: PgRow) -> Result<EventRecord> {
    let event_type_str: String = row.get("event_type");
    let asset_key_str: Option<String> = row.get("asset_key");

    let event_type = event_type_str
        .parse()
        .map_err(|e: String| Error::Serialization(e))?;
    let asset_key = asset_key_str
        .as_deref()
        .map(AssetKey::from_storage_id)
        .transpose()?;

    Ok(EventRecord {
        run_id: row.get("run_id"),
        sequence_id: row.get("id"),
        timestamp: row.get("timestamp"),
        event_type,
        step_key: row.get("step_key"),
        asset_key,
        partition: row.get("partition_key"),
        payload: row.get("payload"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use uuid::Uuid;

    fn test_url() -> String {
        std::env::var("FLOWLOG_TEST_POSTGRES_URL")
            .expect("FLOWLOG_TEST_POSTGRES_URL must point at a scratch database")
    }

    #[tokio::test]
    #[ignore = "requires a live Postgres; set FLOWLOG_TEST_POSTGRES_URL"]
    async fn postgres_round_trip_and_asset_index() {
        let store = PostgresEventLogStorage::connect(&test_url()).await.unwrap();
        let run_id = format!("test-{}", Uuid::new_v4());
        let key = AssetKey::new(["it", &run_id]);

        let payload = serde_json::json!({"rows": 3});
        let first = store
            .append(
                &run_id,
                EventDraft::new(EventType::StepStarted).with_step_key("build"),
            )
            .await
            .unwrap();
        let second = store
            .append(
                &run_id,
                EventDraft::new(EventType::AssetMaterialized)
                    .for_asset(key.clone())
                    .with_payload(payload.clone()),
            )
            .await
            .unwrap();
        assert!(second > first);

        let events = store.events_after(&run_id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, payload);

        let assets = store.as_asset_aware().unwrap();
        let materializations = assets.asset_events(&key, None, None).await.unwrap();
        assert_eq!(materializations.len(), 1);
        assert_eq!(materializations[0].sequence_id, second);

        store.delete_run(&run_id).await.unwrap();
        store.delete_run(&run_id).await.unwrap();
        assert!(store.events_after(&run_id, 0).await.unwrap().is_empty());
        assert!(assets.asset_events(&key, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a live Postgres; set FLOWLOG_TEST_POSTGRES_URL"]
    async fn postgres_subscription_completeness() {
        let store = PostgresEventLogStorage::connect(&test_url())
            .await
            .unwrap()
            .with_poll_interval(std::time::Duration::from_millis(50));
        let run_id = format!("test-{}", Uuid::new_v4());

        let mut sub = store.subscribe(&run_id, 0).await.unwrap();
        let mut expected = Vec::new();
        for step in ["a", "b", "c"] {
            expected.push(
                store
                    .append(&run_id, EventDraft::new(EventType::StepStarted).with_step_key(step))
                    .await
                    .unwrap(),
            );
        }

        for seq in expected {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(event.sequence_id, seq);
        }

        store.delete_run(&run_id).await.unwrap();
    }
}

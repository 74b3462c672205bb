//! SQLite event log backends
//!
//! Two embedded-file variants share one single-file core:
//! - [`SqliteEventLogStorage`]: one `<root>/<run_id>/events.db` per run,
//!   created lazily on first append. Cross-run asset queries fan out over
//!   every run's file, a known scaling limit of the per-run layout.
//! - [`ConsolidatedSqliteEventLogStorage`]: a single `<root>/events.db` for
//!   all runs. SQLite serializes writers at the file level, so writes retry
//!   on busy/locked conditions with bounded backoff before surfacing
//!   `StorageUnavailable`.

use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::event::{AssetKey, EventDraft, EventRecord};
use crate::storage::schema;
use crate::storage::subscription::{spawn_poll_loop, EventSubscription};
use crate::storage::{AssetAwareEventLogStorage, EventLogStorage};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Database file name, per run directory or consolidated under the root
const DB_FILE: &str = "events.db";

/// Initial backoff for busy retries; doubles per attempt, capped at 1s
const BUSY_BACKOFF_START: Duration = Duration::from_millis(50);
const BUSY_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Single-file SQLite event log: the schema and append/read/delete/index
/// logic both file backends layer on.
#[derive(Debug, Clone)]
pub(crate) struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Open (creating if missing) the database file and run migrations
    pub(crate) async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(format!("failed to create directory: {e}")))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(100));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let log = Self { pool };
        log.init_schema().await?;

        debug!(path = %path.display(), "sqlite event log opened");
        Ok(log)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in [schema::SQLITE_EVENTS_TABLE, schema::SQLITE_ASSET_INDEX_TABLE]
            .iter()
            .chain(schema::SQLITE_INDEXES)
        {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Transactional append: event row and asset index row commit together
    pub(crate) async fn append(&self, run_id: &str, draft: &EventDraft) -> Result<i64> {
        draft.validate()?;
        let asset_id = draft
            .asset_key
            .as_ref()
            .map(AssetKey::to_storage_id)
            .transpose()?;
        let payload = draft.payload.to_string();
        let timestamp = encode_timestamp(Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO events (run_id, timestamp, event_type, step_key, asset_key, partition_key, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(&timestamp)
        .bind(draft.event_type.as_str())
        .bind(draft.step_key.as_deref())
        .bind(asset_id.as_deref())
        .bind(draft.partition.as_deref())
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let sequence_id: i64 = row.get("id");

        if let Some(asset_id) = &asset_id {
            sqlx::query(
                r#"
                INSERT INTO asset_index (asset_key, partition_key, run_id, event_id)
                VALUES (?1, ?2, ?3, ?4)
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

    pub(crate) async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, timestamp, event_type, step_key, asset_key, partition_key, payload
            FROM events
            WHERE run_id = ?1 AND id > ?2
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

    pub(crate) async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        sqlx::query("DELETE FROM asset_index WHERE run_id = ?1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        sqlx::query("DELETE FROM events WHERE run_id = ?1")
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

    pub(crate) async fn asset_events(
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
            WHERE a.asset_key = ?1
              AND (?2 IS NULL OR a.partition_key = ?2)
              AND (?3 IS NULL OR e.timestamp < ?3)
            ORDER BY e.id ASC
            "#,
        )
        .bind(asset_key.to_storage_id()?)
        .bind(partition)
        .bind(before.map(encode_timestamp))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        rows.into_iter().map(row_to_event).collect()
    }

    pub(crate) async fn known_asset_keys(&self) -> Result<Vec<AssetKey>> {
        let rows = sqlx::query("SELECT DISTINCT asset_key FROM asset_index ORDER BY asset_key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        rows.iter()
            .map(|row| AssetKey::from_storage_id(row.get("asset_key")))
            .collect()
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

/// Timestamps are compared as strings in SQL, so they are stored at a fixed
/// fractional-second width; `to_rfc3339` alone varies the width and breaks
/// lexicographic order at exact boundaries.
fn encode_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert a SQLite row to an EventRecord
fn row_to_event(row: SqliteRow) -> Result<EventRecord> {
    let timestamp_str: String = row.get("timestamp");
    let event_type_str: String = row.get("event_type");
    let asset_key_str: Option<String> = row.get("asset_key");
    let payload_str: String = row.get("payload");

    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|e| Error::Serialization(format!("invalid timestamp: {e}")))?
        .with_timezone(&Utc);
    let event_type = event_type_str
        .parse()
        .map_err(|e: String| Error::Serialization(e))?;
    let asset_key = asset_key_str
        .as_deref()
        .map(AssetKey::from_storage_id)
        .transpose()?;
    let payload: serde_json::Value = serde_json::from_str(&payload_str)
        .map_err(|e| Error::Serialization(format!("invalid json: {e}")))?;

    Ok(EventRecord {
        run_id: row.get("run_id"),
        sequence_id: row.get("id"),
        timestamp,
        event_type,
        step_key: row.get("step_key"),
        asset_key,
        partition: row.get("partition_key"),
        payload,
    })
}

/// SQLITE_BUSY and friends surface as locked/busy database errors
fn is_busy(err: &Error) -> bool {
    matches!(
        err,
        Error::StorageUnavailable(msg)
            if msg.contains("database is locked")
                || msg.contains("database table is locked")
                || msg.contains("busy")
    )
}

/// Run ids double as directory names under the root, so they must be usable
/// path components.
fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty()
        || run_id == "."
        || run_id == ".."
        || run_id.contains('/')
        || run_id.contains('\\')
    {
        return Err(Error::Serialization(format!(
            "run id {run_id:?} is not usable as a directory name"
        )));
    }
    Ok(())
}

/// Per-run embedded-file backend: one SQLite database per run.
///
/// Files live at `<root>/<run_id>/events.db` and are created lazily on first
/// append; open handles are cached per run. Each run gets an isolated file,
/// so sequence ids restart per run and cross-run asset queries must visit
/// every run's file.
#[derive(Debug, Clone)]
pub struct SqliteEventLogStorage {
    base_dir: PathBuf,
    poll_interval: Duration,
    max_connections: u32,
    logs: Arc<RwLock<HashMap<String, SqliteEventLog>>>,
}

impl SqliteEventLogStorage {
    /// Create a store rooted at `base_dir`; no files are touched until the
    /// first append.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        info!(base_dir = %base_dir.display(), "per-run sqlite event log storage initialized");
        Self {
            base_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            logs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set the subscription poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-file connection pool size
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Root directory holding one subdirectory per run
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn db_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id).join(DB_FILE)
    }

    /// Open (or fetch the cached handle for) a run's file, creating it
    async fn ensure_log(&self, run_id: &str) -> Result<SqliteEventLog> {
        if let Some(log) = self.logs.read().await.get(run_id) {
            return Ok(log.clone());
        }
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get(run_id) {
            return Ok(log.clone());
        }
        let log = SqliteEventLog::open(&self.db_path(run_id), self.max_connections).await?;
        logs.insert(run_id.to_string(), log.clone());
        Ok(log)
    }

    /// Like `ensure_log`, but never creates the file: reads of a run that was
    /// never appended to stay empty without leaving a database behind.
    async fn existing_log(&self, run_id: &str) -> Result<Option<SqliteEventLog>> {
        if let Some(log) = self.logs.read().await.get(run_id) {
            return Ok(Some(log.clone()));
        }
        if !self.db_path(run_id).is_file() {
            return Ok(None);
        }
        self.ensure_log(run_id).await.map(Some)
    }

    /// Run directories currently present under the root
    fn run_dirs(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::StorageUnavailable(e.to_string())),
        };

        let mut run_ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            if entry.path().join(DB_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    run_ids.push(name.to_string());
                }
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }
}

#[async_trait::async_trait]
impl EventLogStorage for SqliteEventLogStorage {
    async fn append(&self, run_id: &str, draft: EventDraft) -> Result<i64> {
        validate_run_id(run_id)?;
        let log = self.ensure_log(run_id).await?;
        log.append(run_id, &draft).await
    }

    async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>> {
        validate_run_id(run_id)?;
        match self.existing_log(run_id).await? {
            Some(log) => log.events_after(run_id, cursor).await,
            None => Ok(Vec::new()),
        }
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        validate_run_id(run_id)?;
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.remove(run_id) {
            log.close().await;
        }
        match std::fs::remove_dir_all(self.base_dir.join(run_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::StorageUnavailable(e.to_string())),
        }
        debug!(run_id, "deleted run database");
        Ok(())
    }

    async fn subscribe(&self, run_id: &str, from_cursor: i64) -> Result<EventSubscription> {
        validate_run_id(run_id)?;
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
        "sqlite"
    }
}

#[async_trait::async_trait]
impl AssetAwareEventLogStorage for SqliteEventLogStorage {
    /// Fans out over every run's file. Sequence ids are per-file here, so the
    /// merged result is ordered by `(timestamp, sequence_id)` instead of the
    /// raw id order the shared-sequence backends use.
    async fn asset_events(
        &self,
        asset_key: &AssetKey,
        partition: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let mut events = Vec::new();
        for run_id in self.run_dirs()? {
            if let Some(log) = self.existing_log(&run_id).await? {
                events.extend(log.asset_events(asset_key, partition, before).await?);
            }
        }
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence_id.cmp(&b.sequence_id))
        });
        Ok(events)
    }

    async fn known_asset_keys(&self) -> Result<Vec<AssetKey>> {
        let mut keys = BTreeSet::new();
        for run_id in self.run_dirs()? {
            if let Some(log) = self.existing_log(&run_id).await? {
                keys.extend(log.known_asset_keys().await?);
            }
        }
        Ok(keys.into_iter().collect())
    }
}

/// Consolidated embedded-file backend: one shared SQLite database for all
/// runs.
///
/// Trades per-run isolation for lower filesystem overhead and single-query
/// cross-run asset lookups. Because SQLite serializes writers at the file
/// level, writes retry on busy conditions up to the configured ceiling.
#[derive(Debug, Clone)]
pub struct ConsolidatedSqliteEventLogStorage {
    log: SqliteEventLog,
    poll_interval: Duration,
    busy_retry_limit: u32,
}

impl ConsolidatedSqliteEventLogStorage {
    /// Open (creating if missing) `<base_dir>/events.db`
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(base_dir, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open with an explicit connection pool size
    pub async fn open_with(base_dir: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = base_dir.as_ref().join(DB_FILE);
        let log = SqliteEventLog::open(&path, max_connections).await?;
        info!(path = %path.display(), "consolidated sqlite event log storage initialized");
        Ok(Self {
            log,
            poll_interval: DEFAULT_POLL_INTERVAL,
            busy_retry_limit: crate::config::DEFAULT_BUSY_RETRY_LIMIT,
        })
    }

    /// Set the subscription poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the busy retry ceiling for writes
    #[must_use]
    pub fn with_busy_retry_limit(mut self, limit: u32) -> Self {
        self.busy_retry_limit = limit;
        self
    }
}

#[async_trait::async_trait]
impl EventLogStorage for ConsolidatedSqliteEventLogStorage {
    async fn append(&self, run_id: &str, draft: EventDraft) -> Result<i64> {
        let mut backoff = BUSY_BACKOFF_START;
        let mut attempt = 0;
        loop {
            match self.log.append(run_id, &draft).await {
                Err(err) if is_busy(&err) && attempt < self.busy_retry_limit => {
                    attempt += 1;
                    debug!(run_id, attempt, "append hit busy database, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BUSY_BACKOFF_CAP);
                }
                Err(err) if is_busy(&err) => {
                    return Err(Error::StorageUnavailable(format!(
                        "append retry budget exhausted after {attempt} retries: {err}"
                    )));
                }
                other => return other,
            }
        }
    }

    async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>> {
        self.log.events_after(run_id, cursor).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut backoff = BUSY_BACKOFF_START;
        let mut attempt = 0;
        loop {
            match self.log.delete_run(run_id).await {
                Err(err) if is_busy(&err) && attempt < self.busy_retry_limit => {
                    attempt += 1;
                    debug!(run_id, attempt, "delete hit busy database, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BUSY_BACKOFF_CAP);
                }
                Err(err) if is_busy(&err) => {
                    return Err(Error::StorageUnavailable(format!(
                        "delete retry budget exhausted after {attempt} retries: {err}"
                    )));
                }
                other => return other,
            }
        }
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
        "consolidated_sqlite"
    }
}

#[async_trait::async_trait]
impl AssetAwareEventLogStorage for ConsolidatedSqliteEventLogStorage {
    async fn asset_events(
        &self,
        asset_key: &AssetKey,
        partition: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        self.log.asset_events(asset_key, partition, before).await
    }

    async fn known_asset_keys(&self) -> Result<Vec<AssetKey>> {
        self.log.known_asset_keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use tempfile::TempDir;

    fn step_event(step: &str) -> EventDraft {
        EventDraft::new(EventType::StepStarted).with_step_key(step)
    }

    fn materialization(key: &AssetKey) -> EventDraft {
        EventDraft::new(EventType::AssetMaterialized).for_asset(key.clone())
    }

    #[test]
    fn busy_errors_are_classified() {
        assert!(is_busy(&Error::StorageUnavailable(
            "error returned from database: database is locked".to_string()
        )));
        assert!(!is_busy(&Error::StorageUnavailable(
            "connection refused".to_string()
        )));
        assert!(!is_busy(&Error::Serialization(
            "database is locked".to_string()
        )));
    }

    #[test]
    fn run_ids_must_be_path_safe() {
        assert!(validate_run_id("run-1").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("..").is_err());
        assert!(validate_run_id("a/b").is_err());
    }

    #[tokio::test]
    async fn per_run_append_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());

        let payload = serde_json::json!({"rows": 7});
        assert_eq!(store.append("r1", step_event("a")).await.unwrap(), 1);
        assert_eq!(
            store
                .append(
                    "r1",
                    EventDraft::new(EventType::StepSucceeded)
                        .with_step_key("a")
                        .with_payload(payload.clone())
                )
                .await
                .unwrap(),
            2
        );

        let events = store.events_after("r1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_id, 1);
        assert_eq!(events[1].payload, payload);
        assert_eq!(events[1].run_id, "r1");

        let tail = store.events_after("r1", 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence_id, 2);
    }

    #[tokio::test]
    async fn per_run_events_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteEventLogStorage::new(dir.path());
            store.append("r1", step_event("a")).await.unwrap();
        }

        let store = SqliteEventLogStorage::new(dir.path());
        let events = store.events_after("r1", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step_key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn per_run_files_live_under_run_directories() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());
        store.append("r1", step_event("a")).await.unwrap();

        assert!(dir.path().join("r1").join("events.db").is_file());
    }

    #[tokio::test]
    async fn reading_unknown_run_creates_no_file() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());

        assert!(store.events_after("ghost", 0).await.unwrap().is_empty());
        assert!(!dir.path().join("ghost").exists());
    }

    #[tokio::test]
    async fn per_run_delete_is_idempotent_and_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());
        store.append("r1", step_event("a")).await.unwrap();

        store.delete_run("r1").await.unwrap();
        store.delete_run("r1").await.unwrap();

        assert!(store.events_after("r1", 0).await.unwrap().is_empty());
        assert!(!dir.path().join("r1").exists());
    }

    #[tokio::test]
    async fn per_run_sequences_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());

        store.append("a", step_event("x")).await.unwrap();
        store.append("b", step_event("y")).await.unwrap();
        store.append("a", step_event("z")).await.unwrap();

        let a = store.events_after("a", 0).await.unwrap();
        let b = store.events_after("b", 0).await.unwrap();
        assert_eq!(a.iter().map(|e| e.sequence_id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b.iter().map(|e| e.sequence_id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn per_run_asset_queries_fan_out_across_runs() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventLogStorage::new(dir.path());
        let key = AssetKey::new(["users"]);

        store.append("r1", materialization(&key)).await.unwrap();
        store.append("r2", materialization(&key)).await.unwrap();

        let assets = store.as_asset_aware().unwrap();
        let events = assets.asset_events(&key, None, None).await.unwrap();
        assert_eq!(events.len(), 2);
        let runs: Vec<_> = events.iter().map(|e| e.run_id.as_str()).collect();
        assert!(runs.contains(&"r1") && runs.contains(&"r2"));

        store.delete_run("r1").await.unwrap();
        assert_eq!(assets.asset_events(&key, None, None).await.unwrap().len(), 1);
        assert_eq!(assets.known_asset_keys().await.unwrap(), vec![key.clone()]);

        store.delete_run("r2").await.unwrap();
        assert!(assets.known_asset_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn per_run_subscription_delivers_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteEventLogStorage::new(dir.path()).with_poll_interval(Duration::from_millis(50));
        store.append("r1", step_event("before")).await.unwrap();

        let mut sub = store.subscribe("r1", 1).await.unwrap();
        for step in ["a", "b", "c"] {
            store.append("r1", step_event(step)).await.unwrap();
        }

        for expected in [2, 3, 4] {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(event.sequence_id, expected);
        }

        sub.cancel();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn consolidated_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();

        let payload = serde_json::json!({"ok": true});
        store
            .append("r1", step_event("a").with_payload(payload.clone()))
            .await
            .unwrap();

        let events = store.events_after("r1", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, payload);

        store.delete_run("r1").await.unwrap();
        store.delete_run("r1").await.unwrap();
        assert!(store.events_after("r1", 0).await.unwrap().is_empty());
        assert!(dir.path().join("events.db").is_file());
    }

    #[tokio::test]
    async fn consolidated_sequence_ids_increase_within_a_run() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();

        // Interleave runs: ids within each run must stay strictly increasing
        // even though both share one id sequence.
        store.append("a", step_event("1")).await.unwrap();
        store.append("b", step_event("1")).await.unwrap();
        store.append("a", step_event("2")).await.unwrap();

        let a = store.events_after("a", 0).await.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a[0].sequence_id < a[1].sequence_id);

        store.delete_run("b").await.unwrap();
        let a_after = store.events_after("a", 0).await.unwrap();
        assert_eq!(a_after, a);
    }

    #[tokio::test]
    async fn consolidated_asset_queries_span_runs_in_one_file() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();
        let key = AssetKey::new(["warehouse", "users"]);

        let seq1 = store
            .append("r1", materialization(&key).with_partition("p1"))
            .await
            .unwrap();
        let seq2 = store
            .append("r2", materialization(&key).with_partition("p2"))
            .await
            .unwrap();

        let assets = store.as_asset_aware().unwrap();
        let events = assets.asset_events(&key, None, None).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.sequence_id).collect::<Vec<_>>(),
            vec![seq1, seq2]
        );

        let p2 = assets.asset_events(&key, Some("p2"), None).await.unwrap();
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].run_id, "r2");

        store.delete_run("r1").await.unwrap();
        assert_eq!(assets.asset_events(&key, None, None).await.unwrap().len(), 1);
        assert_eq!(assets.known_asset_keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn consolidated_subscription_completeness() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(50));

        let mut sub = store.subscribe("r1", 0).await.unwrap();
        let mut expected = Vec::new();
        for step in ["a", "b", "c", "d"] {
            expected.push(store.append("r1", step_event(step)).await.unwrap());
        }

        for seq in expected {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(event.sequence_id, seq);
        }
    }

    #[tokio::test]
    async fn asset_events_respect_time_bound() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();
        let key = AssetKey::new(["users"]);

        store.append("r1", materialization(&key)).await.unwrap();
        let assets = store.as_asset_aware().unwrap();

        let distant_past = Utc::now() - chrono::Duration::days(1);
        assert!(assets
            .asset_events(&key, None, Some(distant_past))
            .await
            .unwrap()
            .is_empty());

        let future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(
            assets
                .asset_events(&key, None, Some(future))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn asset_event_time_bound_is_exact_at_the_boundary() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();
        let key = AssetKey::new(["users"]);

        store.append("r1", materialization(&key)).await.unwrap();
        let stored = store.events_after("r1", 0).await.unwrap().remove(0);

        // The bound is exclusive: an event at exactly `before` is filtered
        // out, one microsecond later it is included.
        let assets = store.as_asset_aware().unwrap();
        assert!(assets
            .asset_events(&key, None, Some(stored.timestamp))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            assets
                .asset_events(
                    &key,
                    None,
                    Some(stored.timestamp + chrono::Duration::microseconds(1))
                )
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn consolidated_append_retries_until_a_competing_writer_commits() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap();

        // A second handle on the same file holds the write lock for a while.
        let blocker = SqliteEventLog::open(&dir.path().join(DB_FILE), 1)
            .await
            .unwrap();
        let mut conn = blocker.pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.append("r1", step_event("a")).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        sqlx::query("COMMIT").execute(&mut *conn).await.unwrap();
        drop(conn);

        let seq = tokio::time::timeout(Duration::from_secs(10), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(store.events_after("r1", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consolidated_append_surfaces_busy_once_the_retry_budget_is_spent() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidatedSqliteEventLogStorage::open(dir.path())
            .await
            .unwrap()
            .with_busy_retry_limit(0);

        let blocker = SqliteEventLog::open(&dir.path().join(DB_FILE), 1)
            .await
            .unwrap();
        let mut conn = blocker.pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = store.append("r1", step_event("a")).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(err.to_string().contains("retry budget exhausted"));

        sqlx::query("COMMIT").execute(&mut *conn).await.unwrap();
    }
}

//! Schema - persisted row shapes for the relational backends
//!
//! Two tables: `events`, keyed by an auto-incrementing primary key that serves
//! as the `sequence_id`, and `asset_index`, a secondary index from asset key
//! and partition back to the materialization event. Pure data definition; the
//! backends run these statements at connect time.

/// SQLite `events` table
pub(crate) const SQLITE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    step_key TEXT,
    asset_key TEXT,
    partition_key TEXT,
    payload TEXT NOT NULL DEFAULT '{}'
)
"#;

/// SQLite `asset_index` table
pub(crate) const SQLITE_ASSET_INDEX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS asset_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_key TEXT NOT NULL,
    partition_key TEXT,
    run_id TEXT NOT NULL,
    event_id INTEGER NOT NULL REFERENCES events(id)
)
"#;

/// SQLite indexes for cursor reads, asset lookups, and run deletion
pub(crate) const SQLITE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_asset_index_key ON asset_index(asset_key, event_id)",
    "CREATE INDEX IF NOT EXISTS idx_asset_index_run ON asset_index(run_id)",
];

/// Postgres `events` table
pub(crate) const POSTGRES_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id BIGSERIAL PRIMARY KEY,
    run_id TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    event_type TEXT NOT NULL,
    step_key TEXT,
    asset_key TEXT,
    partition_key TEXT,
    payload JSONB NOT NULL DEFAULT '{}'::jsonb
)
"#;

/// Postgres `asset_index` table
pub(crate) const POSTGRES_ASSET_INDEX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS asset_index (
    id BIGSERIAL PRIMARY KEY,
    asset_key TEXT NOT NULL,
    partition_key TEXT,
    run_id TEXT NOT NULL,
    event_id BIGINT NOT NULL REFERENCES events(id)
)
"#;

/// Postgres indexes for cursor reads, asset lookups, and run deletion
pub(crate) const POSTGRES_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_asset_index_key ON asset_index(asset_key, event_id)",
    "CREATE INDEX IF NOT EXISTS idx_asset_index_run ON asset_index(run_id)",
];

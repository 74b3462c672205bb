//! Storage - pluggable event log backends
//!
//! This module defines the abstract storage contract and its backends:
//! - `InMemoryEventLogStorage`: process-local, non-durable, for tests
//! - `PostgresEventLogStorage`: any reachable Postgres instance
//! - `SqliteEventLogStorage`: one SQLite file per run under a root directory
//! - `ConsolidatedSqliteEventLogStorage`: a single shared SQLite file
//!
//! All backends behave identically from the caller's perspective; they differ
//! in durability, concurrency, and how live subscriptions are delivered.

mod in_memory;
mod postgres;
pub(crate) mod schema;
mod sqlite;
mod subscription;

pub use in_memory::InMemoryEventLogStorage;
pub use postgres::PostgresEventLogStorage;
pub use sqlite::{ConsolidatedSqliteEventLogStorage, SqliteEventLogStorage};
pub use subscription::EventSubscription;

use crate::error::Result;
use crate::event::{AssetKey, EventDraft, EventRecord};
use chrono::{DateTime, Utc};

/// Abstract contract every event log backend implements.
///
/// The execution engine appends events as work proceeds; readers page through
/// history by cursor and subscribe for live updates. Append is the only
/// mutator besides `delete_run`.
#[async_trait::async_trait]
pub trait EventLogStorage: Send + Sync + std::fmt::Debug {
    /// Append an event to a run's log.
    ///
    /// Assigns the `sequence_id` and `timestamp` and returns the assigned id,
    /// which is usable later as a resume cursor. If the draft carries an
    /// asset key, the asset index entry is written in the same atomic unit.
    async fn append(&self, run_id: &str, draft: EventDraft) -> Result<i64>;

    /// All events with `sequence_id > cursor`, in increasing order.
    ///
    /// Cursor 0 means "from the beginning". An empty result for a run with no
    /// events is valid, not an error.
    async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>>;

    /// Remove all events and asset index entries for a run.
    ///
    /// Idempotent: deleting a run with no events succeeds silently.
    async fn delete_run(&self, run_id: &str) -> Result<()>;

    /// Live-tail a run: a cancelable stream of every event with
    /// `sequence_id > from_cursor`, in order, with no gaps and no duplicates.
    ///
    /// Returns immediately; delivery happens on a background worker (or
    /// synchronously during `append` for the in-memory backend). A
    /// `StorageUnavailable` error terminates the stream as its final item.
    async fn subscribe(&self, run_id: &str, from_cursor: i64) -> Result<EventSubscription>;

    /// Capability probe for the asset index extension.
    ///
    /// Backends that maintain the secondary asset index return `Some`; callers
    /// use this instead of downcasting.
    fn as_asset_aware(&self) -> Option<&dyn AssetAwareEventLogStorage> {
        None
    }

    /// Backend tag for logging
    fn name(&self) -> &str;
}

/// Asset index extension, composed with [`EventLogStorage`].
///
/// Exposed only by backends that maintain the secondary index mapping asset
/// keys to the materialization events that produced them. The index is never
/// authoritative; the event log is the source of truth.
#[async_trait::async_trait]
pub trait AssetAwareEventLogStorage: EventLogStorage {
    /// All materialization events for an asset key, ascending, across runs.
    ///
    /// `partition` and `before` narrow the result to one partition label
    /// and/or an exclusive upper time bound.
    async fn asset_events(
        &self,
        asset_key: &AssetKey,
        partition: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>>;

    /// Every distinct asset key with at least one surviving materialization.
    ///
    /// Deleting a run retracts a key only when no other run still
    /// materializes it.
    async fn known_asset_keys(&self) -> Result<Vec<AssetKey>>;
}

//! Flowlog Store - pluggable event log storage for workflow runs
//!
//! An append-only, per-run sequence of structured execution events (step
//! lifecycle, asset materializations) behind one storage contract:
//! - Event: event types and schemas
//! - Storage: the [`EventLogStorage`] contract and its four backends
//! - Config: backend selection and tuning as one named-options struct
//!
//! Backends differ in durability and notification mechanics but behave
//! identically from the caller's perspective: the engine appends, readers
//! page by cursor or subscribe for live tailing, and backends that maintain
//! the asset index additionally answer lineage queries through
//! [`AssetAwareEventLogStorage`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod storage;

pub use config::{default_data_dir, EventLogConfig, StorageBackend};
pub use error::{Error, Result};
pub use event::{AssetKey, EventDraft, EventRecord, EventType};
pub use storage::{
    AssetAwareEventLogStorage, ConsolidatedSqliteEventLogStorage, EventLogStorage,
    EventSubscription, InMemoryEventLogStorage, PostgresEventLogStorage, SqliteEventLogStorage,
};

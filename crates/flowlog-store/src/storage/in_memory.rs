//! In-memory event log storage
//!
//! Process-local and non-durable: contents vanish with the process. Intended
//! as a deterministic, fast test double for the durable backends. All state is
//! scoped to the store instance, so multiple isolated stores can coexist in
//! one process for parallel test runs.

use crate::error::Result;
use crate::event::{AssetKey, EventDraft, EventRecord};
use crate::storage::subscription::EventSubscription;
use crate::storage::{AssetAwareEventLogStorage, EventLogStorage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Secondary index entry pointing back at a materialization event
#[derive(Debug, Clone)]
struct IndexEntry {
    run_id: String,
    partition: Option<String>,
    sequence_id: i64,
}

/// Registered live subscriber: the channel plus the cancellation token the
/// returned handle shares, so cancellation is visible at delivery time.
#[derive(Debug)]
struct Subscriber {
    sender: mpsc::UnboundedSender<Result<EventRecord>>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, Vec<EventRecord>>,
    asset_index: HashMap<AssetKey, Vec<IndexEntry>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// In-memory event log backend
///
/// All mutation happens under a single per-instance lock, which is acceptable
/// for the single-process test usage this backend targets. Subscribers are
/// fed synchronously during `append`, in registration order, before `append`
/// returns.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLogStorage {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEventLogStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_for(inner: &Inner, entry: &IndexEntry) -> Option<EventRecord> {
        let log = inner.runs.get(&entry.run_id)?;
        log.binary_search_by_key(&entry.sequence_id, |e| e.sequence_id)
            .ok()
            .map(|idx| log[idx].clone())
    }
}

#[async_trait::async_trait]
impl EventLogStorage for InMemoryEventLogStorage {
    async fn append(&self, run_id: &str, draft: EventDraft) -> Result<i64> {
        draft.validate()?;

        let mut inner = self.inner.write().await;
        let log = inner.runs.entry(run_id.to_string()).or_default();
        let sequence_id = log.last().map_or(0, |e| e.sequence_id) + 1;

        let record = EventRecord {
            run_id: run_id.to_string(),
            sequence_id,
            timestamp: Utc::now(),
            event_type: draft.event_type,
            step_key: draft.step_key,
            asset_key: draft.asset_key,
            partition: draft.partition,
            payload: draft.payload,
        };
        log.push(record.clone());

        if let Some(key) = record.asset_key.clone() {
            inner.asset_index.entry(key).or_default().push(IndexEntry {
                run_id: run_id.to_string(),
                partition: record.partition.clone(),
                sequence_id,
            });
        }

        // Deliver to live subscribers before append returns; subscriptions
        // that were canceled or dropped are pruned here.
        if let Some(subs) = inner.subscribers.get_mut(run_id) {
            subs.retain(|sub| {
                !sub.cancel.is_cancelled() && sub.sender.send(Ok(record.clone())).is_ok()
            });
        }

        debug!(run_id, sequence_id, event_type = %record.event_type, "appended event");
        Ok(sequence_id)
    }

    async fn events_after(&self, run_id: &str, cursor: i64) -> Result<Vec<EventRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence_id > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.runs.remove(run_id);
        inner
            .asset_index
            .retain(|_, entries| {
                entries.retain(|entry| entry.run_id != run_id);
                !entries.is_empty()
            });
        debug!(run_id, "deleted run");
        Ok(())
    }

    async fn subscribe(&self, run_id: &str, from_cursor: i64) -> Result<EventSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;

        // Backfill everything past the cursor, then register for live
        // delivery, all under the same lock so no event is missed or doubled.
        if let Some(log) = inner.runs.get(run_id) {
            for event in log.iter().filter(|e| e.sequence_id > from_cursor) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        let cancel = CancellationToken::new();
        inner
            .subscribers
            .entry(run_id.to_string())
            .or_default()
            .push(Subscriber {
                sender: tx,
                cancel: cancel.clone(),
            });

        Ok(EventSubscription::new(rx, cancel))
    }

    fn as_asset_aware(&self) -> Option<&dyn AssetAwareEventLogStorage> {
        Some(self)
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[async_trait::async_trait]
impl AssetAwareEventLogStorage for InMemoryEventLogStorage {
    async fn asset_events(
        &self,
        asset_key: &AssetKey,
        partition: Option<&str>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.read().await;
        let Some(entries) = inner.asset_index.get(asset_key) else {
            return Ok(Vec::new());
        };

        // Index entries are kept in global append order, which is the true
        // chronological order for a single-process store.
        let mut events = Vec::new();
        for entry in entries {
            if let Some(p) = partition {
                if entry.partition.as_deref() != Some(p) {
                    continue;
                }
            }
            if let Some(record) = Self::record_for(&inner, entry) {
                if let Some(bound) = before {
                    if record.timestamp >= bound {
                        continue;
                    }
                }
                events.push(record);
            }
        }
        Ok(events)
    }

    async fn known_asset_keys(&self) -> Result<Vec<AssetKey>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<AssetKey> = inner.asset_index.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

//! Event - event types and schemas for the run log
//!
//! This module defines the records the store persists. Events form an
//! immutable, per-run audit log: the engine appends them as work proceeds and
//! readers page through them by cursor or tail them live.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Run execution started
    RunStarted,
    /// Run completed successfully
    RunSucceeded,
    /// Run failed
    RunFailed,
    /// Step execution started
    StepStarted,
    /// Step completed successfully
    StepSucceeded,
    /// Step failed
    StepFailed,
    /// Step was skipped
    StepSkipped,
    /// A named asset was materialized by a step
    AssetMaterialized,
    /// Engine-level error outside any step
    EngineError,
}

impl EventType {
    /// Returns the string representation of the event type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunSucceeded => "run_succeeded",
            Self::RunFailed => "run_failed",
            Self::StepStarted => "step_started",
            Self::StepSucceeded => "step_succeeded",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::AssetMaterialized => "asset_materialized",
            Self::EngineError => "engine_error",
        }
    }

    /// Whether events of this type may carry an asset key
    #[must_use]
    pub fn is_materialization(&self) -> bool {
        matches!(self, Self::AssetMaterialized)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "run_started" => Ok(Self::RunStarted),
            "run_succeeded" => Ok(Self::RunSucceeded),
            "run_failed" => Ok(Self::RunFailed),
            "step_started" => Ok(Self::StepStarted),
            "step_succeeded" => Ok(Self::StepSucceeded),
            "step_failed" => Ok(Self::StepFailed),
            "step_skipped" => Ok(Self::StepSkipped),
            "asset_materialized" => Ok(Self::AssetMaterialized),
            "engine_error" => Ok(Self::EngineError),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// Structured identifier of a named asset: a non-empty path of segments
/// (e.g. `["warehouse", "users"]`).
///
/// Persisted as its canonical JSON-array form so equality filters work in SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(Vec<String>);

impl AssetKey {
    /// Create an asset key from path segments
    #[must_use]
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(path.into_iter().map(Into::into).collect())
    }

    /// The path segments of this key
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.0
    }

    /// Canonical string form used as the `asset_key` column value
    pub(crate) fn to_storage_id(&self) -> Result<String> {
        serde_json::to_string(&self.0)
            .map_err(|e| Error::Serialization(format!("invalid asset key: {e}")))
    }

    /// Parse a key back from its `asset_key` column value
    pub(crate) fn from_storage_id(s: &str) -> Result<Self> {
        let path: Vec<String> = serde_json::from_str(s)
            .map_err(|e| Error::Serialization(format!("invalid asset key: {e}")))?;
        Ok(Self(path))
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// What callers hand to `append`: everything except the store-assigned
/// `sequence_id` and `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    /// Kind of occurrence
    pub event_type: EventType,
    /// Identifier of the producing step, if any
    pub step_key: Option<String>,
    /// Asset identifier, present only for materialization events
    pub asset_key: Option<AssetKey>,
    /// Partition label qualifying the asset event
    pub partition: Option<String>,
    /// Opaque event body; the store does not interpret its contents
    pub payload: serde_json::Value,
}

impl EventDraft {
    /// Create a draft with an empty payload
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            step_key: None,
            asset_key: None,
            partition: None,
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Set the producing step
    #[must_use]
    pub fn with_step_key(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }

    /// Mark this draft as materializing the given asset
    #[must_use]
    pub fn for_asset(mut self, asset_key: AssetKey) -> Self {
        self.asset_key = Some(asset_key);
        self
    }

    /// Set the partition label for an asset event
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Set the payload
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Reject malformed drafts before they reach a backend.
    ///
    /// An asset key is only valid on materialization-class events, and a
    /// partition label only qualifies an asset key.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(key) = &self.asset_key {
            if !self.event_type.is_materialization() {
                return Err(Error::Serialization(format!(
                    "event type {} cannot carry an asset key",
                    self.event_type
                )));
            }
            if key.path().is_empty() {
                return Err(Error::Serialization("asset key path is empty".to_string()));
            }
        } else if self.partition.is_some() {
            return Err(Error::Serialization(
                "partition label requires an asset key".to_string(),
            ));
        }
        Ok(())
    }
}

/// An immutable record of something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Opaque identifier of the owning run
    pub run_id: String,
    /// Store-assigned id, strictly increasing within a run in append order
    pub sequence_id: i64,
    /// Store-assigned wall-clock time of append
    pub timestamp: DateTime<Utc>,
    /// Kind of occurrence
    pub event_type: EventType,
    /// Identifier of the producing step, if any
    pub step_key: Option<String>,
    /// Asset identifier, present only for materialization events
    pub asset_key: Option<AssetKey>,
    /// Partition label qualifying the asset event
    pub partition: Option<String>,
    /// Opaque event body
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Whether this event materialized an asset
    #[must_use]
    pub fn is_materialization(&self) -> bool {
        self.asset_key.is_some()
    }
}

//! Queued mutation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Feature,
    Correction,
    Layer,
}

impl EntityType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Correction => "correction",
            Self::Layer => "layer",
        }
    }

    /// Remote collection holding this kind of entity.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Feature => "features",
            Self::Correction => "corrections",
            Self::Layer => "layers",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(Self::Feature),
            "correction" => Ok(Self::Correction),
            "layer" => Ok(Self::Layer),
            other => Err(Error::InvalidInput(format!("unknown entity type: {other}"))),
        }
    }
}

/// A local write ready to be queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Value,
    pub base_updated_at: Option<i64>,
}

impl Mutation {
    #[must_use]
    pub fn new(
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            base_updated_at: None,
        }
    }

    /// Attach the remote `updated_at` this write was derived from.
    #[must_use]
    pub const fn based_on(mut self, updated_at: i64) -> Self {
        self.base_updated_at = Some(updated_at);
        self
    }
}

/// A pending local write, in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Queue position, assigned by local storage
    pub sequence: i64,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Patch or full record; geometry is already wire-encoded
    pub payload: Value,
    /// Remote `updated_at` the patch was derived from (Unix ms)
    pub base_updated_at: Option<i64>,
    pub attempts: u32,
    /// Earliest time the next push may be tried (Unix ms)
    pub next_attempt_at: i64,
    /// Parked operations wait for manual resolution
    pub parked: bool,
    pub last_error: Option<String>,
    /// Unix ms
    pub created_at: i64,
}

impl QueuedOperation {
    /// Whether a push cycle at `now_millis` should try this operation.
    #[must_use]
    pub const fn is_due(&self, now_millis: i64) -> bool {
        !self.parked && self.next_attempt_at <= now_millis
    }
}

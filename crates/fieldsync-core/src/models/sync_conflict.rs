//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::EntityType;
use crate::error::{Error, Result};

/// Why a queued operation was parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The remote state disagreed with the operation's precondition
    Precondition,
    /// The queued payload could not be decoded or encoded
    InvalidPayload,
}

impl ConflictKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "precondition" => Ok(Self::Precondition),
            "invalid_payload" => Ok(Self::InvalidPayload),
            other => Err(Error::InvalidInput(format!("unknown conflict kind: {other}"))),
        }
    }
}

/// Recorded push conflict awaiting (or after) manual resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Parked queue entry
    pub sequence: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ConflictKind,
    /// Remote error text as received
    pub message: String,
    /// Unix ms
    pub detected_at: i64,
    /// Unix ms, set once resolved
    pub resolved_at: Option<i64>,
    /// Resolution name (`discard_local`, `retry_local`, `replace`)
    pub resolution: Option<String>,
}

impl SyncConflict {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Manual decision for a parked operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Drop the local write; the remote state stands
    DiscardLocal,
    /// Unpark and push again as-is on the next cycle
    RetryLocal,
    /// Push a new payload instead, based on the given remote `updated_at`
    Replace {
        payload: Value,
        base_updated_at: Option<i64>,
    },
}

impl ConflictResolution {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DiscardLocal => "discard_local",
            Self::RetryLocal => "retry_local",
            Self::Replace { .. } => "replace",
        }
    }
}

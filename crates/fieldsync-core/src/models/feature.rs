//! Feature model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// Opaque feature identifier, stable across offline and online use.
///
/// Locally created features get a UUID v7; ids coming from the backend are
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    /// Create a new unique feature ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FeatureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeatureId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("feature id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Review progression of a feature.
///
/// `Rejected` loops back to `Pending`; the progression is not strictly linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    #[default]
    Draft,
    Pending,
    Locked,
    Corrected,
    Validated,
    Rejected,
}

impl FeatureStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Corrected => "corrected",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    /// Whether a reviewer or agent may move a feature from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Pending)
                | (Self::Pending, Self::Locked | Self::Corrected)
                | (Self::Locked, Self::Pending | Self::Corrected)
                | (Self::Corrected, Self::Validated | Self::Rejected | Self::Locked)
                | (Self::Rejected, Self::Pending)
        )
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "locked" => Ok(Self::Locked),
            "corrected" => Ok(Self::Corrected),
            "validated" => Ok(Self::Validated),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidInput(format!("unknown feature status: {other}"))),
        }
    }
}

/// Lease metadata as last seen from the backend.
///
/// Advisory only: it drives display, never enforcement. The backend is the
/// single source of truth for who holds a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLock {
    pub holder: String,
    /// Unix ms
    pub acquired_at: i64,
    /// Unix ms
    pub expires_at: i64,
}

impl FeatureLock {
    /// An expired lease is equivalent to no lease at all.
    #[must_use]
    pub const fn is_active(&self, now_millis: i64) -> bool {
        self.expires_at > now_millis
    }
}

/// Audit trail timestamps are Unix ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureAudit {
    pub corrected_by: Option<String>,
    pub corrected_at: Option<i64>,
    pub validated_by: Option<String>,
    pub validated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A corrected geospatial record (parcel, survey feature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub layer_id: String,
    pub geometry: Geometry,
    /// Field values in schema order
    pub properties: Map<String, Value>,
    pub status: FeatureStatus,
    pub lock: Option<FeatureLock>,
    pub audit: FeatureAudit,
}

impl Feature {
    /// Create a new draft feature stamped with `now_millis`.
    #[must_use]
    pub fn new(layer_id: impl Into<String>, geometry: Geometry, now_millis: i64) -> Self {
        Self {
            id: FeatureId::new(),
            layer_id: layer_id.into(),
            geometry,
            properties: Map::new(),
            status: FeatureStatus::Draft,
            lock: None,
            audit: FeatureAudit {
                created_at: now_millis,
                updated_at: now_millis,
                ..FeatureAudit::default()
            },
        }
    }

    /// Holder of a lease that has not expired at `now_millis`.
    #[must_use]
    pub fn active_lock_holder(&self, now_millis: i64) -> Option<&str> {
        self.lock
            .as_ref()
            .filter(|lock| lock.is_active(now_millis))
            .map(|lock| lock.holder.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coord;

    #[test]
    fn test_feature_id_unique() {
        assert_ne!(FeatureId::new(), FeatureId::new());
    }

    #[test]
    fn test_feature_id_parse_keeps_backend_ids() {
        let id: FeatureId = " parcel-0042 ".parse().unwrap();
        assert_eq!(id.as_str(), "parcel-0042");
        assert!("  ".parse::<FeatureId>().is_err());
    }

    #[test]
    fn test_status_round_trip_through_text() {
        for status in [
            FeatureStatus::Draft,
            FeatureStatus::Pending,
            FeatureStatus::Locked,
            FeatureStatus::Corrected,
            FeatureStatus::Validated,
            FeatureStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<FeatureStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_rejected_loops_back_to_pending() {
        assert!(FeatureStatus::Rejected.can_transition_to(FeatureStatus::Pending));
        assert!(FeatureStatus::Corrected.can_transition_to(FeatureStatus::Rejected));
        assert!(!FeatureStatus::Validated.can_transition_to(FeatureStatus::Draft));
        assert!(!FeatureStatus::Draft.can_transition_to(FeatureStatus::Validated));
    }

    #[test]
    fn test_expired_lock_reads_as_unlocked() {
        let mut feature = Feature::new("layer", Geometry::Point(Coord::new(0.0, 0.0)), 1_000);
        feature.lock = Some(FeatureLock {
            holder: "agent-a".to_string(),
            acquired_at: 1_000,
            expires_at: 2_000,
        });
        assert_eq!(feature.active_lock_holder(1_999), Some("agent-a"));
        assert_eq!(feature.active_lock_holder(2_000), None);
    }
}

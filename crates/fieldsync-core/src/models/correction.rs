//! Correction model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Feature, FeatureId};
use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// Unique identifier for a correction (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionId(Uuid);

impl CorrectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionStatus {
    #[default]
    Submitted,
    Validated,
    Rejected,
}

impl CorrectionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for CorrectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "submitted" => Ok(Self::Submitted),
            "validated" => Ok(Self::Validated),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidInput(format!(
                "unknown correction status: {other}"
            ))),
        }
    }
}

/// A proposed change to a feature.
///
/// Fields are fixed once built; only a reviewer decision changes `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    id: CorrectionId,
    feature_id: FeatureId,
    layer_id: String,
    author_id: String,
    /// Sparse: only the fields the agent touched
    props_patch: Map<String, Value>,
    geometry_corrected: Option<Geometry>,
    notes: Option<String>,
    media_refs: Vec<String>,
    status: CorrectionStatus,
    /// Unix ms
    created_at: i64,
}

impl Correction {
    /// Start a correction of `feature` by `author_id`.
    #[must_use]
    pub fn new(
        feature: &Feature,
        author_id: impl Into<String>,
        props_patch: Map<String, Value>,
        now_millis: i64,
    ) -> Self {
        Self {
            id: CorrectionId::new(),
            feature_id: feature.id.clone(),
            layer_id: feature.layer_id.clone(),
            author_id: author_id.into(),
            props_patch,
            geometry_corrected: None,
            notes: None,
            media_refs: Vec::new(),
            status: CorrectionStatus::Submitted,
            created_at: now_millis,
        }
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry_corrected = Some(geometry);
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = crate::util::normalize_text_option(Some(notes.into()));
        self
    }

    #[must_use]
    pub fn with_media_refs(mut self, media_refs: Vec<String>) -> Self {
        self.media_refs = media_refs;
        self
    }

    pub const fn id(&self) -> CorrectionId {
        self.id
    }

    pub const fn feature_id(&self) -> &FeatureId {
        &self.feature_id
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub const fn props_patch(&self) -> &Map<String, Value> {
        &self.props_patch
    }

    pub const fn geometry_corrected(&self) -> Option<&Geometry> {
        self.geometry_corrected.as_ref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn media_refs(&self) -> &[String] {
        &self.media_refs
    }

    pub const fn status(&self) -> CorrectionStatus {
        self.status
    }

    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Record a reviewer decision. Only submitted corrections can be reviewed.
    pub fn review(&mut self, decision: CorrectionStatus) -> Result<()> {
        if self.status != CorrectionStatus::Submitted {
            return Err(Error::InvalidInput(format!(
                "correction {} already {}",
                self.id,
                self.status.as_str()
            )));
        }
        if decision == CorrectionStatus::Submitted {
            return Err(Error::InvalidInput(
                "review decision must be validated or rejected".into(),
            ));
        }
        self.status = decision;
        Ok(())
    }

    /// Overlay this correction onto `feature` (last correction wins per field).
    pub fn apply_to(&self, feature: &mut Feature) {
        for (key, value) in &self.props_patch {
            feature.properties.insert(key.clone(), value.clone());
        }
        if let Some(geometry) = &self.geometry_corrected {
            feature.geometry = geometry.clone();
        }
        feature.audit.corrected_by = Some(self.author_id.clone());
        feature.audit.corrected_at = Some(self.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coord;
    use crate::models::FeatureStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn feature() -> Feature {
        let mut feature = Feature::new("parcels", Geometry::Point(Coord::new(1.0, 1.0)), 10);
        feature.properties.insert("owner".into(), json!("Diallo"));
        feature.properties.insert("area".into(), json!(120));
        feature.status = FeatureStatus::Pending;
        feature
    }

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_new_correction_inherits_feature_scope() {
        let feature = feature();
        let correction = Correction::new(&feature, "agent-7", patch(json!({"area": 125})), 50)
            .with_notes("  fence moved  ")
            .with_media_refs(vec!["photo-1.jpg".into()]);

        assert_eq!(correction.feature_id(), &feature.id);
        assert_eq!(correction.layer_id(), "parcels");
        assert_eq!(correction.status(), CorrectionStatus::Submitted);
        assert_eq!(correction.notes(), Some("fence moved"));
        assert_eq!(correction.media_refs(), ["photo-1.jpg".to_string()]);
    }

    #[test]
    fn test_review_is_one_shot() {
        let mut correction = Correction::new(&feature(), "agent-7", Map::new(), 50);
        correction.review(CorrectionStatus::Validated).unwrap();
        assert_eq!(correction.status(), CorrectionStatus::Validated);
        assert!(correction.review(CorrectionStatus::Rejected).is_err());
    }

    #[test]
    fn test_review_requires_a_decision() {
        let mut correction = Correction::new(&feature(), "agent-7", Map::new(), 50);
        assert!(correction.review(CorrectionStatus::Submitted).is_err());
    }

    #[test]
    fn test_later_correction_wins_per_field() {
        let mut target = feature();
        let first = Correction::new(&target, "agent-1", patch(json!({"area": 125})), 50);
        let second = Correction::new(
            &target,
            "agent-2",
            patch(json!({"area": 130, "use": "garden"})),
            60,
        )
        .with_geometry(Geometry::Point(Coord::new(2.0, 2.0)));

        first.apply_to(&mut target);
        second.apply_to(&mut target);

        assert_eq!(target.properties["area"], json!(130));
        assert_eq!(target.properties["owner"], json!("Diallo"));
        assert_eq!(target.properties["use"], json!("garden"));
        assert_eq!(target.geometry, Geometry::Point(Coord::new(2.0, 2.0)));
        assert_eq!(target.audit.corrected_by.as_deref(), Some("agent-2"));
        assert_eq!(target.audit.corrected_at, Some(60));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "Validated".parse::<CorrectionStatus>().unwrap(),
            CorrectionStatus::Validated
        );
        assert!("approved".parse::<CorrectionStatus>().is_err());
    }
}

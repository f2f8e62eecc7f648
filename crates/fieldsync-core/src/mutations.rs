//! Builders for queued writes.
//!
//! Each builder applies the edit to the local model and returns the
//! [`Mutation`] to queue for it. Geometry is encoded to SRID-tagged WKT here,
//! so an unencodable shape fails before anything is queued and the local
//! model is left untouched.
//!
//! Local edits never move `audit.updated_at`: it keeps tracking the remote
//! version the edit was derived from, which is what updates are based on.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::geometry::{self, Geometry};
use crate::models::{
    Correction, CorrectionStatus, EntityType, Feature, FeatureStatus, Mutation, OperationKind,
};
use crate::util::millis_to_rfc3339;

/// Full wire record for a feature, as sent on insert.
///
/// `updated_at` and the lease columns are owned by the backend and are not
/// included.
pub fn feature_record(feature: &Feature, srid: u32) -> Result<Value> {
    let mut record = Map::new();
    record.insert("id".into(), feature.id.as_str().into());
    record.insert("layer_id".into(), feature.layer_id.clone().into());
    record.insert(
        "geom".into(),
        geometry::encode(&feature.geometry, srid)?.into(),
    );
    record.insert("props".into(), Value::Object(feature.properties.clone()));
    record.insert("status".into(), feature.status.as_str().into());
    record.insert(
        "corrected_by".into(),
        feature.audit.corrected_by.clone().into(),
    );
    record.insert(
        "corrected_at".into(),
        optional_time(feature.audit.corrected_at),
    );
    record.insert(
        "validated_by".into(),
        feature.audit.validated_by.clone().into(),
    );
    record.insert(
        "validated_at".into(),
        optional_time(feature.audit.validated_at),
    );
    record.insert(
        "created_at".into(),
        millis_to_rfc3339(feature.audit.created_at).into(),
    );
    Ok(Value::Object(record))
}

pub fn insert_feature(feature: &Feature, srid: u32) -> Result<Mutation> {
    Ok(Mutation::new(
        OperationKind::Insert,
        EntityType::Feature,
        feature.id.as_str(),
        feature_record(feature, srid)?,
    ))
}

/// Merge `changes` into the feature's properties.
///
/// The patch carries the whole merged property map because the backend
/// stores properties as a single column.
pub fn update_feature_properties(feature: &mut Feature, changes: Map<String, Value>) -> Mutation {
    for (key, value) in changes {
        feature.properties.insert(key, value);
    }
    let mut patch = Map::new();
    patch.insert("props".into(), Value::Object(feature.properties.clone()));
    feature_update(feature, patch)
}

pub fn update_feature_geometry(
    feature: &mut Feature,
    geometry: Geometry,
    srid: u32,
) -> Result<Mutation> {
    let encoded = geometry::encode(&geometry, srid)?;
    feature.geometry = geometry;

    let mut patch = Map::new();
    patch.insert("geom".into(), encoded.into());
    Ok(feature_update(feature, patch))
}

/// Move the feature through its workflow.
///
/// `Corrected` records `actor` as the corrector. `Validated` and `Rejected`
/// record `actor` as the reviewer.
pub fn update_feature_status(
    feature: &mut Feature,
    next: FeatureStatus,
    actor: &str,
    now_millis: i64,
) -> Result<Mutation> {
    if !feature.status.can_transition_to(next) {
        return Err(Error::InvalidInput(format!(
            "feature {} cannot move from {} to {}",
            feature.id, feature.status, next
        )));
    }
    let actor = actor.trim();
    let mut patch = Map::new();
    patch.insert("status".into(), next.as_str().into());

    match next {
        FeatureStatus::Corrected | FeatureStatus::Validated | FeatureStatus::Rejected
            if actor.is_empty() =>
        {
            return Err(Error::InvalidInput(format!(
                "moving feature {} to {next} requires an actor",
                feature.id
            )));
        }
        FeatureStatus::Corrected => {
            feature.audit.corrected_by = Some(actor.to_string());
            feature.audit.corrected_at = Some(now_millis);
            patch.insert("corrected_by".into(), actor.into());
            patch.insert("corrected_at".into(), millis_to_rfc3339(now_millis).into());
        }
        FeatureStatus::Validated | FeatureStatus::Rejected => {
            feature.audit.validated_by = Some(actor.to_string());
            feature.audit.validated_at = Some(now_millis);
            patch.insert("validated_by".into(), actor.into());
            patch.insert("validated_at".into(), millis_to_rfc3339(now_millis).into());
        }
        _ => {}
    }

    feature.status = next;
    Ok(feature_update(feature, patch))
}

pub fn delete_feature(feature: &Feature) -> Mutation {
    Mutation::new(
        OperationKind::Delete,
        EntityType::Feature,
        feature.id.as_str(),
        Value::Null,
    )
}

pub fn insert_correction(correction: &Correction, srid: u32) -> Result<Mutation> {
    let geom_corrected = correction
        .geometry_corrected()
        .map(|geometry| geometry::encode(geometry, srid))
        .transpose()?;

    let mut record = Map::new();
    record.insert("id".into(), correction.id().as_str().into());
    record.insert("feature_id".into(), correction.feature_id().as_str().into());
    record.insert("layer_id".into(), correction.layer_id().into());
    record.insert("author_id".into(), correction.author_id().into());
    record.insert(
        "props_patch".into(),
        Value::Object(correction.props_patch().clone()),
    );
    record.insert("geom_corrected".into(), geom_corrected.into());
    record.insert("notes".into(), correction.notes().into());
    record.insert(
        "media_refs".into(),
        Value::from(correction.media_refs().to_vec()),
    );
    record.insert("status".into(), correction.status().as_str().into());
    record.insert(
        "created_at".into(),
        millis_to_rfc3339(correction.created_at()).into(),
    );

    Ok(Mutation::new(
        OperationKind::Insert,
        EntityType::Correction,
        correction.id().as_str(),
        Value::Object(record),
    ))
}

/// Record a reviewer decision on a submitted correction.
pub fn review_correction(
    correction: &mut Correction,
    decision: CorrectionStatus,
) -> Result<Mutation> {
    correction.review(decision)?;

    let mut patch = Map::new();
    patch.insert("status".into(), decision.as_str().into());
    // The feature id lets a parked review flag the feature it belongs to
    patch.insert("feature_id".into(), correction.feature_id().as_str().into());
    Ok(Mutation::new(
        OperationKind::Update,
        EntityType::Correction,
        correction.id().as_str(),
        Value::Object(patch),
    ))
}

fn feature_update(feature: &Feature, patch: Map<String, Value>) -> Mutation {
    Mutation::new(
        OperationKind::Update,
        EntityType::Feature,
        feature.id.as_str(),
        Value::Object(patch),
    )
    .based_on(feature.audit.updated_at)
}

fn optional_time(millis: Option<i64>) -> Value {
    millis.map_or(Value::Null, |millis| millis_to_rfc3339(millis).into())
}

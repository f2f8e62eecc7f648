//! Decoding of feature rows as returned by the backend.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{RemoteError, RemoteResult};
use crate::geometry;
use crate::models::{Feature, FeatureAudit, FeatureLock};

/// Feature row. Geometry lives in `geom`, field values in `props`.
#[derive(Debug, Deserialize)]
struct FeatureRow {
    id: Value,
    layer_id: Value,
    geom: Value,
    #[serde(default)]
    props: Option<Map<String, Value>>,
    status: String,
    #[serde(default)]
    locked_by: Option<String>,
    #[serde(default)]
    locked_at: Option<Value>,
    #[serde(default)]
    lock_expires_at: Option<Value>,
    #[serde(default)]
    corrected_by: Option<String>,
    #[serde(default)]
    corrected_at: Option<Value>,
    #[serde(default)]
    validated_by: Option<String>,
    #[serde(default)]
    validated_at: Option<Value>,
    created_at: Value,
    updated_at: Value,
}

/// Decode a backend feature row into the canonical model.
pub fn decode_feature(value: &Value) -> RemoteResult<Feature> {
    let row = FeatureRow::deserialize(value)
        .map_err(|error| RemoteError::InvalidPayload(format!("feature row: {error}")))?;

    let geometry = geometry::decode(&row.geom)
        .map_err(|error| RemoteError::InvalidPayload(error.to_string()))?;
    let status = row
        .status
        .parse()
        .map_err(|error: crate::Error| RemoteError::InvalidPayload(error.to_string()))?;

    let lock = match (row.locked_by, optional_timestamp(row.lock_expires_at.as_ref())?) {
        (Some(holder), Some(expires_at)) => Some(FeatureLock {
            holder,
            acquired_at: optional_timestamp(row.locked_at.as_ref())?.unwrap_or(expires_at),
            expires_at,
        }),
        _ => None,
    };

    Ok(Feature {
        id: id_text(&row.id)?
            .parse()
            .map_err(|error: crate::Error| RemoteError::InvalidPayload(error.to_string()))?,
        layer_id: id_text(&row.layer_id)?,
        geometry,
        properties: row.props.unwrap_or_default(),
        status,
        lock,
        audit: FeatureAudit {
            corrected_by: row.corrected_by,
            corrected_at: optional_timestamp(row.corrected_at.as_ref())?,
            validated_by: row.validated_by,
            validated_at: optional_timestamp(row.validated_at.as_ref())?,
            created_at: required_timestamp(&row.created_at, "created_at")?,
            updated_at: required_timestamp(&row.updated_at, "updated_at")?,
        },
    })
}

/// Parse a timestamp given either as Unix ms or as RFC 3339 text.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|time| time.timestamp_millis()),
        _ => None,
    }
}

fn required_timestamp(value: &Value, field: &str) -> RemoteResult<i64> {
    parse_timestamp(value)
        .ok_or_else(|| RemoteError::InvalidPayload(format!("invalid {field}: {value}")))
}

fn optional_timestamp(value: Option<&Value>) -> RemoteResult<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_timestamp(value)
            .map(Some)
            .ok_or_else(|| RemoteError::InvalidPayload(format!("invalid timestamp: {value}"))),
    }
}

/// Ids may come back as text or as integers.
fn id_text(value: &Value) -> RemoteResult<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(RemoteError::InvalidPayload(format!("invalid id: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coord, Geometry};
    use crate::models::FeatureStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_row_with_hex_geometry() {
        let row = json!({
            "id": "0190f1d4-1f1e-7a4b-9a64-0c1f0b7a1e11",
            "layer_id": "parcels",
            "geom": "\\x0101000000000000000000F03F0000000000000040",
            "props": {"owner": "Fall", "area": 12},
            "status": "corrected",
            "locked_by": "agent-a",
            "locked_at": "2024-03-01T10:00:00+00:00",
            "lock_expires_at": "2024-03-01T10:15:00+00:00",
            "corrected_by": "agent-a",
            "corrected_at": "2024-03-01T10:05:00.250+00:00",
            "validated_by": null,
            "validated_at": null,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": 1_709_287_500_250_i64
        });

        let feature = decode_feature(&row).unwrap();
        assert_eq!(feature.geometry, Geometry::Point(Coord::new(1.0, 2.0)));
        assert_eq!(feature.status, FeatureStatus::Corrected);
        assert_eq!(feature.properties["owner"], json!("Fall"));
        assert_eq!(
            feature.lock,
            Some(FeatureLock {
                holder: "agent-a".into(),
                acquired_at: 1_709_287_200_000,
                expires_at: 1_709_288_100_000,
            })
        );
        assert_eq!(feature.audit.corrected_at, Some(1_709_287_500_250));
        assert_eq!(feature.audit.validated_at, None);
        assert_eq!(feature.audit.created_at, 1_704_067_200_000);
        assert_eq!(feature.audit.updated_at, 1_709_287_500_250);
    }

    #[test]
    fn decodes_row_with_object_geometry_and_numeric_ids() {
        let row = json!({
            "id": 42,
            "layer_id": 7,
            "geom": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]},
            "status": "pending",
            "created_at": 0,
            "updated_at": 5
        });

        let feature = decode_feature(&row).unwrap();
        assert_eq!(feature.id.as_str(), "42");
        assert_eq!(feature.layer_id, "7");
        assert!(feature.properties.is_empty());
        assert_eq!(feature.lock, None);
    }

    #[test]
    fn rejects_bad_rows() {
        let base = json!({
            "id": "f-1",
            "layer_id": "parcels",
            "geom": {"type": "Point", "coordinates": [0, 0]},
            "status": "pending",
            "created_at": 0,
            "updated_at": 5
        });

        let mut bad_geometry = base.clone();
        bad_geometry["geom"] = json!("01010000");
        let mut bad_status = base.clone();
        bad_status["status"] = json!("archived");
        let mut bad_time = base;
        bad_time["updated_at"] = json!("yesterday");

        for row in [bad_geometry, bad_status, bad_time, json!({"id": "f-1"})] {
            assert!(matches!(
                decode_feature(&row),
                Err(RemoteError::InvalidPayload(_))
            ));
        }
    }

    #[test]
    fn parses_timestamps() {
        assert_eq!(parse_timestamp(&json!(1_000)), Some(1_000));
        assert_eq!(
            parse_timestamp(&json!("1970-01-01T00:00:01.500Z")),
            Some(1_500)
        );
        assert_eq!(parse_timestamp(&json!(true)), None);
    }
}

//! Canonical geometry model and its wire encodings.
//!
//! Writes go out as SRID-tagged well-known text (`SRID=4326;POINT (1 2)`).
//! Reads come back from the spatial store as an already parsed GeoJSON-like
//! object, the same object as JSON text, a hex string holding (E)WKB
//! (optionally prefixed by the `\x` bytea escape marker), or (E)WKT.
//!
//! Only x/y are kept in the canonical value. Z and M ordinates are consumed
//! while decoding and dropped; the SRID of incoming EWKB is skipped because
//! callers track the coordinate reference system separately.

mod wkb;
mod wkt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use wkb::{decode_hex, decode_wkb, to_hex_wkb, to_wkb};
pub use wkt::{encode, parse_wkt, to_wkt};

/// SRID applied to outgoing geometry unless the caller specifies another.
pub const DEFAULT_SRID: u32 = 4326;

/// Errors raised by the geometry codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    /// Input could not be decoded into a geometry.
    #[error("Geometry decode error: {0}")]
    Decode(String),

    /// Geometry could not be encoded for the wire.
    #[error("Geometry encode error: {0}")]
    Encode(String),
}

pub type GeometryResult<T> = std::result::Result<T, GeometryError>;

/// A planar position. Serialized as a `[x, y]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both ordinates are finite numbers.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

impl From<Coord> for [f64; 2] {
    fn from(coord: Coord) -> Self {
        [coord.x, coord.y]
    }
}

impl TryFrom<Vec<f64>> for Coord {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            [x, y] | [x, y, _] | [x, y, _, _] => Ok(Self { x: *x, y: *y }),
            other => Err(format!(
                "position must have 2 to 4 ordinates, got {}",
                other.len()
            )),
        }
    }
}

/// Canonical in-memory geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "GeometryRepr", into = "GeometryRepr")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    /// GeoJSON type name of this geometry.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
            Self::Polygon(_) => "Polygon",
            Self::MultiPoint(_) => "MultiPoint",
            Self::MultiLineString(_) => "MultiLineString",
            Self::MultiPolygon(_) => "MultiPolygon",
            Self::GeometryCollection(_) => "GeometryCollection",
        }
    }

    /// Serialize to the GeoJSON-shaped JSON value used in local storage.
    pub fn to_json(&self) -> GeometryResult<Value> {
        serde_json::to_value(self).map_err(|error| GeometryError::Encode(error.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum GeometryRepr {
    Point { coordinates: Coord },
    LineString { coordinates: Vec<Coord> },
    Polygon { coordinates: Vec<Vec<Coord>> },
    MultiPoint { coordinates: Vec<Coord> },
    MultiLineString { coordinates: Vec<Vec<Coord>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Coord>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl From<GeometryRepr> for Geometry {
    fn from(repr: GeometryRepr) -> Self {
        match repr {
            GeometryRepr::Point { coordinates } => Self::Point(coordinates),
            GeometryRepr::LineString { coordinates } => Self::LineString(coordinates),
            GeometryRepr::Polygon { coordinates } => Self::Polygon(coordinates),
            GeometryRepr::MultiPoint { coordinates } => Self::MultiPoint(coordinates),
            GeometryRepr::MultiLineString { coordinates } => Self::MultiLineString(coordinates),
            GeometryRepr::MultiPolygon { coordinates } => Self::MultiPolygon(coordinates),
            GeometryRepr::GeometryCollection { geometries } => {
                Self::GeometryCollection(geometries)
            }
        }
    }
}

impl From<Geometry> for GeometryRepr {
    fn from(geometry: Geometry) -> Self {
        match geometry {
            Geometry::Point(coordinates) => Self::Point { coordinates },
            Geometry::LineString(coordinates) => Self::LineString { coordinates },
            Geometry::Polygon(coordinates) => Self::Polygon { coordinates },
            Geometry::MultiPoint(coordinates) => Self::MultiPoint { coordinates },
            Geometry::MultiLineString(coordinates) => Self::MultiLineString { coordinates },
            Geometry::MultiPolygon(coordinates) => Self::MultiPolygon { coordinates },
            Geometry::GeometryCollection(geometries) => Self::GeometryCollection { geometries },
        }
    }
}

/// Decode a geometry as delivered by the spatial store.
///
/// Objects are taken as already-parsed GeoJSON geometry. Strings are either
/// JSON text, (E)WKT or hex (E)WKB; see [`decode_str`].
pub fn decode(value: &Value) -> GeometryResult<Geometry> {
    match value {
        Value::Object(_) => Geometry::deserialize(value)
            .map_err(|error| GeometryError::Decode(format!("invalid geometry object: {error}"))),
        Value::String(text) => decode_str(text),
        other => Err(GeometryError::Decode(format!(
            "unsupported geometry value: {other}"
        ))),
    }
}

/// Decode a textual geometry: JSON text when it looks like an object, (E)WKT
/// when it starts with a keyword, otherwise hex-encoded (E)WKB.
pub fn decode_str(text: &str) -> GeometryResult<Geometry> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)
            .map_err(|error| GeometryError::Decode(format!("invalid geometry JSON: {error}")))
    } else if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() && !first.is_ascii_hexdigit())
    {
        parse_wkt(trimmed).map(|(_, geometry)| geometry)
    } else {
        decode_hex(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decode_passes_structured_objects_through() {
        let value = json!({"type": "LineString", "coordinates": [[0.0, 0.0], [1.5, 2.5]]});
        let geometry = decode(&value).unwrap();
        assert_eq!(
            geometry,
            Geometry::LineString(vec![Coord::new(0.0, 0.0), Coord::new(1.5, 2.5)])
        );
    }

    #[test]
    fn decode_parses_json_text() {
        let geometry = decode(&json!(r#"{"type":"Point","coordinates":[3,4]}"#)).unwrap();
        assert_eq!(geometry, Geometry::Point(Coord::new(3.0, 4.0)));
    }

    #[test]
    fn decode_reads_hex_strings() {
        let geometry = decode(&json!("0101000000000000000000F03F0000000000000040")).unwrap();
        assert_eq!(geometry, Geometry::Point(Coord::new(1.0, 2.0)));
    }

    #[test]
    fn decode_reads_ewkt_strings() {
        let geometry = decode(&json!("SRID=4326;LINESTRING (0 0, 1 1)")).unwrap();
        assert_eq!(
            geometry,
            Geometry::LineString(vec![Coord::new(0.0, 0.0), Coord::new(1.0, 1.0)])
        );
    }

    #[test]
    fn decode_rejects_non_geometry_values() {
        assert!(matches!(decode(&json!(42)), Err(GeometryError::Decode(_))));
        assert!(matches!(
            decode(&json!({"type": "Circle", "coordinates": [0, 0]})),
            Err(GeometryError::Decode(_))
        ));
    }

    #[test]
    fn positions_drop_z_and_m() {
        let geometry: Geometry =
            serde_json::from_value(json!({"type": "Point", "coordinates": [1, 2, 3, 4]})).unwrap();
        assert_eq!(geometry, Geometry::Point(Coord::new(1.0, 2.0)));

        let short =
            serde_json::from_value::<Geometry>(json!({"type": "Point", "coordinates": [1]}));
        assert!(short.is_err());
    }

    #[test]
    fn collections_serialize_with_geometries_member() {
        let geometry = Geometry::GeometryCollection(vec![Geometry::Point(Coord::new(1.0, 2.0))]);
        let value = geometry.to_json().unwrap();
        assert_eq!(
            value,
            json!({
                "type": "GeometryCollection",
                "geometries": [{"type": "Point", "coordinates": [1.0, 2.0]}]
            })
        );
        assert_eq!(decode(&value).unwrap(), geometry);
    }
}

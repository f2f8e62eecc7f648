//! SRID-tagged well-known text, both directions.

use super::{Coord, Geometry, GeometryError, GeometryResult};

/// Nesting limit for collections, matching the binary reader.
const MAX_DEPTH: usize = 32;

/// Encode `geometry` as `SRID=<srid>;<WKT>`, the form sent on writes.
pub fn encode(geometry: &Geometry, srid: u32) -> GeometryResult<String> {
    Ok(format!("SRID={srid};{}", to_wkt(geometry)?))
}

/// Untagged WKT body of `geometry`.
pub fn to_wkt(geometry: &Geometry) -> GeometryResult<String> {
    let (keyword, body) = match geometry {
        Geometry::Point(coord) => ("POINT", Some(format!("({})", coord_text(coord)?))),
        Geometry::LineString(coords) => ("LINESTRING", coord_list(coords)?),
        Geometry::Polygon(rings) => ("POLYGON", ring_list(rings)?),
        Geometry::MultiPoint(points) => (
            "MULTIPOINT",
            wrap_list(points, |point| Ok(format!("({})", coord_text(point)?)))?,
        ),
        Geometry::MultiLineString(lines) => (
            "MULTILINESTRING",
            wrap_list(lines, |line| Ok(coord_list(line)?.unwrap_or_else(empty)))?,
        ),
        Geometry::MultiPolygon(polygons) => (
            "MULTIPOLYGON",
            wrap_list(polygons, |rings| Ok(ring_list(rings)?.unwrap_or_else(empty)))?,
        ),
        Geometry::GeometryCollection(members) => {
            ("GEOMETRYCOLLECTION", wrap_list(members, to_wkt)?)
        }
    };

    Ok(match body {
        Some(body) => format!("{keyword} {body}"),
        None => format!("{keyword} EMPTY"),
    })
}

fn empty() -> String {
    "EMPTY".to_string()
}

fn coord_text(coord: &Coord) -> GeometryResult<String> {
    if !coord.is_finite() {
        return Err(GeometryError::Encode(format!(
            "non-finite coordinate ({}, {})",
            coord.x, coord.y
        )));
    }
    Ok(format!("{} {}", coord.x, coord.y))
}

/// `(x y, x y, ...)`, or `None` when there are no coordinates.
fn coord_list(coords: &[Coord]) -> GeometryResult<Option<String>> {
    wrap_list(coords, coord_text)
}

fn ring_list(rings: &[Vec<Coord>]) -> GeometryResult<Option<String>> {
    wrap_list(rings, |ring| Ok(coord_list(ring)?.unwrap_or_else(empty)))
}

fn wrap_list<T>(
    items: &[T],
    render: impl Fn(&T) -> GeometryResult<String>,
) -> GeometryResult<Option<String>> {
    if items.is_empty() {
        return Ok(None);
    }
    let parts = items.iter().map(render).collect::<GeometryResult<Vec<_>>>()?;
    Ok(Some(format!("({})", parts.join(", "))))
}

/// Parse WKT with an optional `SRID=<n>;` prefix.
///
/// Z and M ordinates are accepted and dropped. Returns the SRID when the
/// text carried one.
pub fn parse_wkt(text: &str) -> GeometryResult<(Option<u32>, Geometry)> {
    let text = text.trim();
    let (srid, body) = match text.split_once(';') {
        Some((tag, body)) if tag.trim().to_ascii_uppercase().starts_with("SRID=") => {
            let value = tag.trim()[5..].trim();
            let srid = value
                .parse()
                .map_err(|_| decode_error(format!("invalid SRID '{value}'")))?;
            (Some(srid), body)
        }
        _ => (None, text),
    };

    let mut reader = Reader::new(body);
    let geometry = reader.geometry(0)?;
    reader.skip_whitespace();
    if reader.pos < reader.input.len() {
        return Err(decode_error(format!(
            "unexpected trailing text at offset {}",
            reader.pos
        )));
    }
    Ok((srid, geometry))
}

fn decode_error(message: String) -> GeometryError {
    GeometryError::Decode(format!("invalid WKT: {message}"))
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(u8::is_ascii_whitespace)
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> GeometryResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(decode_error(format!(
                "expected '{}' at offset {}",
                byte as char, self.pos
            )))
        }
    }

    fn word(&mut self) -> String {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(u8::is_ascii_alphabetic)
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).to_ascii_uppercase()
    }

    /// Consume `EMPTY` if it comes next.
    fn empty(&mut self) -> bool {
        let start = self.pos;
        if self.word() == "EMPTY" {
            true
        } else {
            self.pos = start;
            false
        }
    }

    fn geometry(&mut self, depth: usize) -> GeometryResult<Geometry> {
        if depth > MAX_DEPTH {
            return Err(decode_error("geometry nested too deeply".into()));
        }
        let keyword = self.word();
        let start = self.pos;
        if !matches!(self.word().as_str(), "Z" | "M" | "ZM") {
            self.pos = start;
        }

        match keyword.as_str() {
            "POINT" => {
                if self.empty() {
                    return Err(decode_error("empty point".into()));
                }
                self.expect(b'(')?;
                let coord = self.coord()?;
                self.expect(b')')?;
                Ok(Geometry::Point(coord))
            }
            "LINESTRING" => Ok(Geometry::LineString(self.coords()?)),
            "POLYGON" => Ok(Geometry::Polygon(self.rings()?)),
            "MULTIPOINT" => Ok(Geometry::MultiPoint(self.list(Self::multi_point_member)?)),
            "MULTILINESTRING" => Ok(Geometry::MultiLineString(self.list(Self::coords)?)),
            "MULTIPOLYGON" => Ok(Geometry::MultiPolygon(self.list(Self::rings)?)),
            "GEOMETRYCOLLECTION" => Ok(Geometry::GeometryCollection(
                self.list(|reader| reader.geometry(depth + 1))?,
            )),
            "" => Err(decode_error(format!("expected a keyword at offset {}", self.pos))),
            other => Err(decode_error(format!("unsupported geometry type {other}"))),
        }
    }

    /// `EMPTY` or a parenthesized, comma-separated list.
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> GeometryResult<T>,
    ) -> GeometryResult<Vec<T>> {
        if self.empty() {
            return Ok(Vec::new());
        }
        self.expect(b'(')?;
        let mut items = vec![item(self)?];
        while self.peek() == Some(b',') {
            self.pos += 1;
            items.push(item(self)?);
        }
        self.expect(b')')?;
        Ok(items)
    }

    fn coords(&mut self) -> GeometryResult<Vec<Coord>> {
        self.list(Self::coord)
    }

    fn rings(&mut self) -> GeometryResult<Vec<Vec<Coord>>> {
        self.list(Self::coords)
    }

    /// Members may be written `(x y)` or bare `x y`.
    fn multi_point_member(&mut self) -> GeometryResult<Coord> {
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let coord = self.coord()?;
            self.expect(b')')?;
            Ok(coord)
        } else {
            self.coord()
        }
    }

    fn coord(&mut self) -> GeometryResult<Coord> {
        let x = self.number()?;
        let y = self.number()?;
        // Z and M
        for _ in 0..2 {
            if self
                .peek()
                .is_some_and(|byte| matches!(byte, b'-' | b'+' | b'.') || byte.is_ascii_digit())
            {
                self.number()?;
            }
        }
        Ok(Coord::new(x, y))
    }

    fn number(&mut self) -> GeometryResult<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.input.get(self.pos).is_some_and(|byte| {
            byte.is_ascii_digit() || matches!(*byte, b'-' | b'+' | b'.' | b'e' | b'E')
        }) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        text.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| decode_error(format!("invalid number at offset {start}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DEFAULT_SRID;
    use pretty_assertions::assert_eq;

    fn coords(values: &[(f64, f64)]) -> Vec<Coord> {
        values.iter().copied().map(Coord::from).collect()
    }

    #[test]
    fn encodes_polygon_with_srid() {
        let polygon = Geometry::Polygon(vec![coords(&[
            (0.0, 0.0),
            (0.0, 1.0),
            (1.0, 1.0),
            (1.0, 0.0),
            (0.0, 0.0),
        ])]);
        assert_eq!(
            encode(&polygon, DEFAULT_SRID).unwrap(),
            "SRID=4326;POLYGON ((0 0, 0 1, 1 1, 1 0, 0 0))"
        );
    }

    #[test]
    fn encodes_natural_decimal_form() {
        let point = Geometry::Point(Coord::new(-17.4467, 1_234_567.5));
        assert_eq!(to_wkt(&point).unwrap(), "POINT (-17.4467 1234567.5)");
    }

    #[test]
    fn encodes_multi_geometries() {
        let multi_point = Geometry::MultiPoint(coords(&[(1.0, 2.0), (3.0, 4.0)]));
        assert_eq!(to_wkt(&multi_point).unwrap(), "MULTIPOINT ((1 2), (3 4))");

        let multi_line = Geometry::MultiLineString(vec![
            coords(&[(0.0, 0.0), (1.0, 1.0)]),
            coords(&[(2.0, 2.0), (3.0, 3.0)]),
        ]);
        assert_eq!(
            to_wkt(&multi_line).unwrap(),
            "MULTILINESTRING ((0 0, 1 1), (2 2, 3 3))"
        );

        let multi_polygon = Geometry::MultiPolygon(vec![vec![coords(&[
            (0.0, 0.0),
            (1.0, 0.0),
            (0.0, 1.0),
            (0.0, 0.0),
        ])]]);
        assert_eq!(
            to_wkt(&multi_polygon).unwrap(),
            "MULTIPOLYGON (((0 0, 1 0, 0 1, 0 0)))"
        );
    }

    #[test]
    fn encodes_collections_recursively() {
        let collection = Geometry::GeometryCollection(vec![
            Geometry::Point(Coord::new(1.0, 2.0)),
            Geometry::LineString(coords(&[(0.0, 0.0), (1.0, 1.0)])),
        ]);
        assert_eq!(
            encode(&collection, 2154).unwrap(),
            "SRID=2154;GEOMETRYCOLLECTION (POINT (1 2), LINESTRING (0 0, 1 1))"
        );
    }

    #[test]
    fn encodes_empty_geometries() {
        assert_eq!(
            to_wkt(&Geometry::LineString(Vec::new())).unwrap(),
            "LINESTRING EMPTY"
        );
        assert_eq!(
            to_wkt(&Geometry::GeometryCollection(Vec::new())).unwrap(),
            "GEOMETRYCOLLECTION EMPTY"
        );
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let nan = Geometry::Point(Coord::new(f64::NAN, 0.0));
        assert!(matches!(encode(&nan, 4326), Err(GeometryError::Encode(_))));

        let nested = Geometry::GeometryCollection(vec![Geometry::LineString(coords(&[
            (0.0, 0.0),
            (f64::INFINITY, 1.0),
        ]))]);
        assert!(matches!(to_wkt(&nested), Err(GeometryError::Encode(_))));
    }

    #[test]
    fn parses_what_it_writes() {
        let shapes = [
            Geometry::Point(Coord::new(-17.4467, 14.6928)),
            Geometry::Polygon(vec![coords(&[
                (0.0, 0.0),
                (0.0, 1.0),
                (1.0, 1.0),
                (0.0, 0.0),
            ])]),
            Geometry::MultiPoint(coords(&[(1.0, 2.0), (3.0, 4.0)])),
            Geometry::GeometryCollection(vec![
                Geometry::Point(Coord::new(1.0, 2.0)),
                Geometry::MultiLineString(Vec::new()),
            ]),
        ];
        for shape in shapes {
            let text = encode(&shape, 3857).unwrap();
            assert_eq!(parse_wkt(&text).unwrap(), (Some(3857), shape));
        }
    }

    #[test]
    fn parses_loose_input() {
        let (srid, geometry) = parse_wkt("point z ( 1.5 -2e1 7 )").unwrap();
        assert_eq!(srid, None);
        assert_eq!(geometry, Geometry::Point(Coord::new(1.5, -20.0)));

        let (_, geometry) = parse_wkt("MULTIPOINT (1 2, 3 4)").unwrap();
        assert_eq!(geometry, Geometry::MultiPoint(coords(&[(1.0, 2.0), (3.0, 4.0)])));
    }

    #[test]
    fn rejects_malformed_text() {
        for text in [
            "",
            "POINT",
            "POINT EMPTY",
            "POINT (1)",
            "LINESTRING (0 0, 1 1",
            "CIRCLE (0 0, 1)",
            "SRID=abc;POINT (1 2)",
            "POINT (1 2) trailing",
        ] {
            assert!(
                matches!(parse_wkt(text), Err(GeometryError::Decode(_))),
                "{text}"
            );
        }
    }
}

//! (E)WKB reader and writer.

use super::{Coord, Geometry, GeometryError, GeometryResult};

const FLAG_Z: u32 = 0x8000_0000;
const FLAG_M: u32 = 0x4000_0000;
const FLAG_SRID: u32 = 0x2000_0000;
const FLAG_MASK: u32 = FLAG_Z | FLAG_M | FLAG_SRID;

const ISO_ZM: u32 = 3000;
const ISO_M: u32 = 2000;
const ISO_Z: u32 = 1000;

const POINT: u32 = 1;
const LINE_STRING: u32 = 2;
const POLYGON: u32 = 3;
const MULTI_POINT: u32 = 4;
const MULTI_LINE_STRING: u32 = 5;
const MULTI_POLYGON: u32 = 6;
const GEOMETRY_COLLECTION: u32 = 7;

const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

/// Forward-only read position over the whole input buffer.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            depth: 0,
        }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take<const N: usize>(&mut self) -> GeometryResult<[u8; N]> {
        let end = self
            .offset
            .checked_add(N)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                GeometryError::Decode(format!(
                    "unexpected end of WKB at byte {} (needed {N} more, {} left)",
                    self.offset,
                    self.remaining()
                ))
            })?;
        let mut chunk = [0_u8; N];
        chunk.copy_from_slice(&self.bytes[self.offset..end]);
        self.offset = end;
        Ok(chunk)
    }

    fn read_u8(&mut self) -> GeometryResult<u8> {
        let [byte] = self.take::<1>()?;
        Ok(byte)
    }

    fn read_u32(&mut self, order: ByteOrder) -> GeometryResult<u32> {
        let bytes = self.take::<4>()?;
        Ok(match order {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        })
    }

    fn read_f64(&mut self, order: ByteOrder) -> GeometryResult<f64> {
        let bytes = self.take::<8>()?;
        Ok(match order {
            ByteOrder::Big => f64::from_be_bytes(bytes),
            ByteOrder::Little => f64::from_le_bytes(bytes),
        })
    }

    /// Read an element count, refusing counts the rest of the buffer cannot hold.
    fn read_count(&mut self, order: ByteOrder, min_item_size: usize) -> GeometryResult<usize> {
        let count = usize::try_from(self.read_u32(order)?)
            .map_err(|_| GeometryError::Decode("WKB element count overflows usize".into()))?;
        if count.saturating_mul(min_item_size) > self.remaining() {
            return Err(GeometryError::Decode(format!(
                "WKB declares {count} elements but only {} bytes remain",
                self.remaining()
            )));
        }
        Ok(count)
    }
}

/// Header shared by every (nested) WKB geometry.
#[derive(Debug, Clone, Copy)]
struct Header {
    order: ByteOrder,
    base_type: u32,
    extra_ordinates: usize,
}

impl Header {
    const fn point_size(&self) -> usize {
        16 + 8 * self.extra_ordinates
    }
}

fn read_header(cursor: &mut Cursor<'_>) -> GeometryResult<Header> {
    let order = match cursor.read_u8()? {
        0 => ByteOrder::Big,
        1 => ByteOrder::Little,
        other => {
            return Err(GeometryError::Decode(format!(
                "invalid WKB byte order flag {other}"
            )))
        }
    };

    let word = cursor.read_u32(order)?;
    let mut has_z = word & FLAG_Z != 0;
    let mut has_m = word & FLAG_M != 0;
    let has_srid = word & FLAG_SRID != 0;

    let mut base_type = word & !FLAG_MASK;
    if base_type >= ISO_ZM {
        has_z = true;
        has_m = true;
        base_type -= ISO_ZM;
    } else if base_type >= ISO_M {
        has_m = true;
        base_type -= ISO_M;
    } else if base_type >= ISO_Z {
        has_z = true;
        base_type -= ISO_Z;
    }

    if has_srid {
        cursor.take::<4>()?;
    }

    Ok(Header {
        order,
        base_type,
        extra_ordinates: usize::from(has_z) + usize::from(has_m),
    })
}

fn read_coord(cursor: &mut Cursor<'_>, header: &Header) -> GeometryResult<Coord> {
    let x = cursor.read_f64(header.order)?;
    let y = cursor.read_f64(header.order)?;
    for _ in 0..header.extra_ordinates {
        cursor.read_f64(header.order)?;
    }
    Ok(Coord { x, y })
}

fn read_coords(cursor: &mut Cursor<'_>, header: &Header) -> GeometryResult<Vec<Coord>> {
    let count = cursor.read_count(header.order, header.point_size())?;
    (0..count).map(|_| read_coord(cursor, header)).collect()
}

fn read_rings(cursor: &mut Cursor<'_>, header: &Header) -> GeometryResult<Vec<Vec<Coord>>> {
    let count = cursor.read_count(header.order, 4)?;
    (0..count).map(|_| read_coords(cursor, header)).collect()
}

/// Read `count` nested geometries, each with its own header, requiring every
/// member to unwrap through `expect`.
fn read_members<T>(
    cursor: &mut Cursor<'_>,
    header: &Header,
    expected: &'static str,
    expect: impl Fn(Geometry) -> Option<T>,
) -> GeometryResult<Vec<T>> {
    let count = cursor.read_count(header.order, 5)?;
    if cursor.depth >= MAX_NESTING {
        return Err(GeometryError::Decode(format!(
            "WKB nesting exceeds {MAX_NESTING} levels"
        )));
    }
    cursor.depth += 1;
    let mut members = Vec::with_capacity(count);
    for index in 0..count {
        let member = read_geometry(cursor)?;
        let found = member.type_name();
        let member = expect(member).ok_or_else(|| {
            GeometryError::Decode(format!(
                "member {index} of multi-geometry is {found}, expected {expected}"
            ))
        })?;
        members.push(member);
    }
    cursor.depth -= 1;
    Ok(members)
}

fn read_geometry(cursor: &mut Cursor<'_>) -> GeometryResult<Geometry> {
    let header = read_header(cursor)?;
    match header.base_type {
        POINT => read_coord(cursor, &header).map(Geometry::Point),
        LINE_STRING => read_coords(cursor, &header).map(Geometry::LineString),
        POLYGON => read_rings(cursor, &header).map(Geometry::Polygon),
        MULTI_POINT => read_members(cursor, &header, "Point", |member| match member {
            Geometry::Point(coord) => Some(coord),
            _ => None,
        })
        .map(Geometry::MultiPoint),
        MULTI_LINE_STRING => read_members(cursor, &header, "LineString", |member| match member {
            Geometry::LineString(coords) => Some(coords),
            _ => None,
        })
        .map(Geometry::MultiLineString),
        MULTI_POLYGON => read_members(cursor, &header, "Polygon", |member| match member {
            Geometry::Polygon(rings) => Some(rings),
            _ => None,
        })
        .map(Geometry::MultiPolygon),
        GEOMETRY_COLLECTION => {
            read_members(cursor, &header, "Geometry", Some).map(Geometry::GeometryCollection)
        }
        other => Err(GeometryError::Decode(format!(
            "unsupported WKB geometry type {other}"
        ))),
    }
}

/// Decode a complete (E)WKB buffer. Trailing bytes are rejected.
pub fn decode_wkb(bytes: &[u8]) -> GeometryResult<Geometry> {
    let mut cursor = Cursor::new(bytes);
    let geometry = read_geometry(&mut cursor)?;
    if cursor.remaining() > 0 {
        return Err(GeometryError::Decode(format!(
            "{} trailing bytes after WKB geometry",
            cursor.remaining()
        )));
    }
    Ok(geometry)
}

/// Decode hex-encoded (E)WKB, stripping a leading `\x` escape marker.
pub fn decode_hex(input: &str) -> GeometryResult<Geometry> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("\\\\x")
        .or_else(|| trimmed.strip_prefix("\\x"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(digits)
        .map_err(|error| GeometryError::Decode(format!("invalid WKB hex: {error}")))?;
    decode_wkb(&bytes)
}

/// Encode to little-endian WKB. When `srid` is set the outermost geometry is
/// written as EWKB carrying that SRID.
pub fn to_wkb(geometry: &Geometry, srid: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    write_geometry(&mut out, geometry, srid);
    out
}

/// [`to_wkb`] rendered as upper-case hex, the form PostGIS returns.
pub fn to_hex_wkb(geometry: &Geometry, srid: Option<u32>) -> String {
    hex::encode_upper(to_wkb(geometry, srid))
}

fn write_header(out: &mut Vec<u8>, base_type: u32, srid: Option<u32>) {
    out.push(1);
    match srid {
        Some(srid) => {
            out.extend_from_slice(&(base_type | FLAG_SRID).to_le_bytes());
            out.extend_from_slice(&srid.to_le_bytes());
        }
        None => out.extend_from_slice(&base_type.to_le_bytes()),
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
}

fn write_coord(out: &mut Vec<u8>, coord: &Coord) {
    out.extend_from_slice(&coord.x.to_le_bytes());
    out.extend_from_slice(&coord.y.to_le_bytes());
}

fn write_coords(out: &mut Vec<u8>, coords: &[Coord]) {
    write_len(out, coords.len());
    for coord in coords {
        write_coord(out, coord);
    }
}

fn write_rings(out: &mut Vec<u8>, rings: &[Vec<Coord>]) {
    write_len(out, rings.len());
    for ring in rings {
        write_coords(out, ring);
    }
}

fn write_geometry(out: &mut Vec<u8>, geometry: &Geometry, srid: Option<u32>) {
    match geometry {
        Geometry::Point(coord) => {
            write_header(out, POINT, srid);
            write_coord(out, coord);
        }
        Geometry::LineString(coords) => {
            write_header(out, LINE_STRING, srid);
            write_coords(out, coords);
        }
        Geometry::Polygon(rings) => {
            write_header(out, POLYGON, srid);
            write_rings(out, rings);
        }
        Geometry::MultiPoint(points) => {
            write_header(out, MULTI_POINT, srid);
            write_len(out, points.len());
            for point in points {
                write_geometry(out, &Geometry::Point(*point), None);
            }
        }
        Geometry::MultiLineString(lines) => {
            write_header(out, MULTI_LINE_STRING, srid);
            write_len(out, lines.len());
            for line in lines {
                write_header(out, LINE_STRING, None);
                write_coords(out, line);
            }
        }
        Geometry::MultiPolygon(polygons) => {
            write_header(out, MULTI_POLYGON, srid);
            write_len(out, polygons.len());
            for polygon in polygons {
                write_header(out, POLYGON, None);
                write_rings(out, polygon);
            }
        }
        Geometry::GeometryCollection(members) => {
            write_header(out, GEOMETRY_COLLECTION, srid);
            write_len(out, members.len());
            for member in members {
                write_geometry(out, member, None);
            }
        }
    }
}

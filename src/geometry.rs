//! Geometry WKB encode/decode for the geopackage-binary envelope used by
//! Table Dataset V3 row bodies (`spec.md` §4.4, §6: "Geometry WKB
//! encoding/decoding (treat as (GeoJSON ⇄ bytes))").
//!
//! `spec.md` scopes this as an external collaborator the core only calls
//! through a `(bytes ⇄ GeoJSON)` boundary. We implement that boundary
//! directly against the GeoPackage/ISO-WKB wire format (OGC 12-128r17 §2.1.3)
//! using `byteorder`, the same crate the teacher reaches for whenever it
//! hand-parses binary geometry headers (`geozero`'s own `wkb` module builds on
//! `scroll` for the identical task; `byteorder` is the workspace's sibling
//! choice for the simpler envelope-only encode/decode this crate needs).
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{DatasetError, Result};

const MAGIC: [u8; 2] = *b"GP";

/// Decode a geopackage-envelope WKB blob (extension type 71, `spec.md` §4.4) into GeoJSON.
pub fn decode_geometry(bytes: &[u8]) -> Result<geojson::Geometry> {
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 2];
    cur.read_exact(&mut magic)
        .map_err(|_| geom_err("geopackage header truncated"))?;
    if magic != MAGIC {
        return Err(geom_err("bad geopackage magic bytes"));
    }
    let _version = cur.read_u8().map_err(|_| geom_err("truncated header"))?;
    let flags = cur.read_u8().map_err(|_| geom_err("truncated header"))?;
    let little_endian = flags & 0b0000_0001 != 0;
    let envelope_code = (flags >> 1) & 0b111;
    let empty = flags & 0b0001_0000 != 0;

    let _srs_id = read_i32(&mut cur, little_endian)?;
    let envelope_doubles = match envelope_code {
        0 => 0,
        1 => 4,
        2 | 3 => 6,
        4 => 8,
        _ => return Err(geom_err("unknown envelope indicator")),
    };
    for _ in 0..envelope_doubles {
        read_f64(&mut cur, little_endian)?;
    }

    if empty {
        return Ok(geojson::Geometry::new(geojson::Value::GeometryCollection(Vec::new())));
    }

    let pos = cur.position() as usize;
    decode_wkb(&bytes[pos..])
}

/// Encode a GeoJSON geometry into the geopackage-binary envelope (little-endian,
/// SRS ID 0, with an xy envelope attached for non-point geometries, `spec.md` §6).
pub fn encode_geometry(geom: &geojson::Geometry, has_z: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(0); // version

    let is_point = matches!(geom.value, geojson::Value::Point(_));
    let envelope = if is_point { None } else { bbox_of(geom) };
    let envelope_code: u8 = if envelope.is_some() { 1 } else { 0 }; // xy envelope only
    let flags = 0b0000_0001 | (envelope_code << 1); // little-endian, envelope code
    out.push(flags);

    out.write_i32::<LittleEndian>(0).unwrap(); // srs_id
    if let Some((minx, miny, maxx, maxy)) = envelope {
        out.write_f64::<LittleEndian>(minx).unwrap();
        out.write_f64::<LittleEndian>(maxx).unwrap();
        out.write_f64::<LittleEndian>(miny).unwrap();
        out.write_f64::<LittleEndian>(maxy).unwrap();
    }

    encode_wkb(&mut out, &geom.value, has_z)?;
    Ok(out)
}

fn geom_err(msg: &str) -> DatasetError {
    DatasetError::GeoJson(msg.to_string())
}

fn read_i32(cur: &mut Cursor<&[u8]>, little_endian: bool) -> Result<i32> {
    if little_endian {
        cur.read_i32::<LittleEndian>()
    } else {
        cur.read_i32::<byteorder::BigEndian>()
    }
    .map_err(|_| geom_err("truncated int"))
}

fn read_f64(cur: &mut Cursor<&[u8]>, little_endian: bool) -> Result<f64> {
    if little_endian {
        cur.read_f64::<LittleEndian>()
    } else {
        cur.read_f64::<byteorder::BigEndian>()
    }
    .map_err(|_| geom_err("truncated double"))
}

// --- ISO WKB geometry body (no SRID prefix; that lives in the envelope header) ---

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;
const WKB_GEOMETRYCOLLECTION: u32 = 7;
const WKB_Z_OFFSET: u32 = 1000;

pub(crate) fn decode_wkb(bytes: &[u8]) -> Result<geojson::Geometry> {
    let mut cur = Cursor::new(bytes);
    let value = decode_wkb_geom(&mut cur)?;
    Ok(geojson::Geometry::new(value))
}

fn decode_wkb_geom(cur: &mut Cursor<&[u8]>) -> Result<geojson::Value> {
    let byte_order = cur.read_u8().map_err(|_| geom_err("truncated wkb"))?;
    let little_endian = byte_order == 1;
    let raw_type = read_u32(cur, little_endian)?;
    let has_z = raw_type >= WKB_Z_OFFSET;
    let base_type = raw_type % WKB_Z_OFFSET;

    match base_type {
        WKB_POINT => Ok(geojson::Value::Point(read_position(cur, little_endian, has_z)?)),
        WKB_LINESTRING => Ok(geojson::Value::LineString(read_positions(
            cur,
            little_endian,
            has_z,
        )?)),
        WKB_POLYGON => Ok(geojson::Value::Polygon(read_rings(cur, little_endian, has_z)?)),
        WKB_MULTIPOINT => {
            let n = read_u32(cur, little_endian)?;
            let mut pts = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let geom = decode_wkb_geom(cur)?;
                if let geojson::Value::Point(p) = geom {
                    pts.push(p);
                } else {
                    return Err(geom_err("multipoint member not a point"));
                }
            }
            Ok(geojson::Value::MultiPoint(pts))
        }
        WKB_MULTILINESTRING => {
            let n = read_u32(cur, little_endian)?;
            let mut lines = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let geom = decode_wkb_geom(cur)?;
                if let geojson::Value::LineString(l) = geom {
                    lines.push(l);
                } else {
                    return Err(geom_err("multilinestring member not a linestring"));
                }
            }
            Ok(geojson::Value::MultiLineString(lines))
        }
        WKB_MULTIPOLYGON => {
            let n = read_u32(cur, little_endian)?;
            let mut polys = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let geom = decode_wkb_geom(cur)?;
                if let geojson::Value::Polygon(p) = geom {
                    polys.push(p);
                } else {
                    return Err(geom_err("multipolygon member not a polygon"));
                }
            }
            Ok(geojson::Value::MultiPolygon(polys))
        }
        WKB_GEOMETRYCOLLECTION => {
            let n = read_u32(cur, little_endian)?;
            let mut geoms = Vec::with_capacity(n as usize);
            for _ in 0..n {
                geoms.push(geojson::Geometry::new(decode_wkb_geom(cur)?));
            }
            Ok(geojson::Value::GeometryCollection(geoms))
        }
        other => Err(geom_err(&format!("unsupported wkb geometry type {other}"))),
    }
}

fn read_u32(cur: &mut Cursor<&[u8]>, little_endian: bool) -> Result<u32> {
    if little_endian {
        cur.read_u32::<LittleEndian>()
    } else {
        cur.read_u32::<byteorder::BigEndian>()
    }
    .map_err(|_| geom_err("truncated wkb"))
}

fn read_position(cur: &mut Cursor<&[u8]>, little_endian: bool, has_z: bool) -> Result<Vec<f64>> {
    let x = read_f64(cur, little_endian)?;
    let y = read_f64(cur, little_endian)?;
    let mut p = vec![x, y];
    if has_z {
        p.push(read_f64(cur, little_endian)?);
    }
    Ok(p)
}

fn read_positions(cur: &mut Cursor<&[u8]>, little_endian: bool, has_z: bool) -> Result<Vec<Vec<f64>>> {
    let n = read_u32(cur, little_endian)?;
    (0..n).map(|_| read_position(cur, little_endian, has_z)).collect()
}

fn read_rings(cur: &mut Cursor<&[u8]>, little_endian: bool, has_z: bool) -> Result<Vec<Vec<Vec<f64>>>> {
    let n = read_u32(cur, little_endian)?;
    (0..n).map(|_| read_positions(cur, little_endian, has_z)).collect()
}

/// Plain ISO WKB bytes for a geometry value, with no geopackage envelope —
/// the form `kart.diff/v1+hexwkb` hex-encodes (`spec.md` §4.7).
pub(crate) fn encode_wkb_bytes(value: &geojson::Value, has_z: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_wkb(&mut out, value, has_z)?;
    Ok(out)
}

pub(crate) fn encode_wkb(out: &mut Vec<u8>, value: &geojson::Value, has_z: bool) -> Result<()> {
    out.push(1); // little-endian
    let z_offset = if has_z { WKB_Z_OFFSET } else { 0 };
    match value {
        geojson::Value::Point(p) => {
            out.write_u32::<LittleEndian>(WKB_POINT + z_offset).unwrap();
            write_position(out, p);
        }
        geojson::Value::LineString(pts) => {
            out.write_u32::<LittleEndian>(WKB_LINESTRING + z_offset).unwrap();
            write_positions(out, pts);
        }
        geojson::Value::Polygon(rings) => {
            out.write_u32::<LittleEndian>(WKB_POLYGON + z_offset).unwrap();
            write_rings(out, rings);
        }
        geojson::Value::MultiPoint(pts) => {
            out.write_u32::<LittleEndian>(WKB_MULTIPOINT + z_offset).unwrap();
            out.write_u32::<LittleEndian>(pts.len() as u32).unwrap();
            for p in pts {
                encode_wkb(out, &geojson::Value::Point(p.clone()), has_z)?;
            }
        }
        geojson::Value::MultiLineString(lines) => {
            out.write_u32::<LittleEndian>(WKB_MULTILINESTRING + z_offset).unwrap();
            out.write_u32::<LittleEndian>(lines.len() as u32).unwrap();
            for l in lines {
                encode_wkb(out, &geojson::Value::LineString(l.clone()), has_z)?;
            }
        }
        geojson::Value::MultiPolygon(polys) => {
            out.write_u32::<LittleEndian>(WKB_MULTIPOLYGON + z_offset).unwrap();
            out.write_u32::<LittleEndian>(polys.len() as u32).unwrap();
            for p in polys {
                encode_wkb(out, &geojson::Value::Polygon(p.clone()), has_z)?;
            }
        }
        geojson::Value::GeometryCollection(geoms) => {
            out.write_u32::<LittleEndian>(WKB_GEOMETRYCOLLECTION + z_offset).unwrap();
            out.write_u32::<LittleEndian>(geoms.len() as u32).unwrap();
            for g in geoms {
                encode_wkb(out, &g.value, has_z)?;
            }
        }
    }
    Ok(())
}

fn write_position(out: &mut Vec<u8>, p: &[f64]) {
    out.write_f64::<LittleEndian>(p[0]).unwrap();
    out.write_f64::<LittleEndian>(p[1]).unwrap();
    if p.len() > 2 {
        out.write_f64::<LittleEndian>(p[2]).unwrap();
    }
}

fn write_positions(out: &mut Vec<u8>, pts: &[Vec<f64>]) {
    out.write_u32::<LittleEndian>(pts.len() as u32).unwrap();
    for p in pts {
        write_position(out, p);
    }
}

fn write_rings(out: &mut Vec<u8>, rings: &[Vec<Vec<f64>>]) {
    out.write_u32::<LittleEndian>(rings.len() as u32).unwrap();
    for ring in rings {
        write_positions(out, ring);
    }
}

/// Bounding box `(min_x, min_y, max_x, max_y)` of a GeoJSON geometry, used for
/// the geopackage envelope and for spatial-index insertion (`spec.md` §4.6).
pub fn bbox_of(geom: &geojson::Geometry) -> Option<(f64, f64, f64, f64)> {
    let mut acc: Option<(f64, f64, f64, f64)> = None;
    walk_positions(&geom.value, &mut |x, y| {
        acc = Some(match acc {
            None => (x, y, x, y),
            Some((minx, miny, maxx, maxy)) => (minx.min(x), miny.min(y), maxx.max(x), maxy.max(y)),
        });
    });
    acc
}

fn walk_positions(value: &geojson::Value, f: &mut impl FnMut(f64, f64)) {
    use geojson::Value::*;
    match value {
        Point(p) => f(p[0], p[1]),
        MultiPoint(pts) | LineString(pts) => {
            for p in pts {
                f(p[0], p[1]);
            }
        }
        Polygon(rings) | MultiLineString(rings) => {
            for ring in rings {
                for p in ring {
                    f(p[0], p[1]);
                }
            }
        }
        MultiPolygon(polys) => {
            for poly in polys {
                for ring in poly {
                    for p in ring {
                        f(p[0], p[1]);
                    }
                }
            }
        }
        GeometryCollection(geoms) => {
            for g in geoms {
                walk_positions(&g.value, f);
            }
        }
    }
}

/// `GeometryCollection` is a disallowed dominant type (`spec.md` §4.7, §9).
pub fn geometry_type_name(value: &geojson::Value) -> &'static str {
    use geojson::Value::*;
    match value {
        Point(_) => "Point",
        LineString(_) => "LineString",
        Polygon(_) => "Polygon",
        MultiPoint(_) => "MultiPoint",
        MultiLineString(_) => "MultiLineString",
        MultiPolygon(_) => "MultiPolygon",
        GeometryCollection(_) => "GeometryCollection",
    }
}

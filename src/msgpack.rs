//! MessagePack (de)serialization for on-disk row bodies, primary-key
//! filenames, and legend blobs (`spec.md` §4.4, §6, §9).
//!
//! Two extension types are registered on top of the base MessagePack value
//! model (`rmpv`): type 71 (`"G"`) for geopackage-envelope WKB geometry
//! blobs, handled by [`crate::geometry`], and the standard timestamp
//! extension (type -1) for instant-in-time values. Trailing bytes after the
//! first decoded value are ignored, per `spec.md` §4.4/§9.
use base64::Engine;
use byteorder::{BigEndian, ReadBytesExt};
use num_bigint::BigInt;
use rmpv::Value as Msg;
use std::io::Cursor;

use crate::error::{DatasetError, Result};
use crate::geometry;
use crate::value::Value;

const EXT_GEOMETRY: i8 = 71;
const EXT_TIMESTAMP: i8 = -1;

/// Decode the on-disk row body: `[legendId: string, nonPrimaryKeyValues: any[]]`.
/// Extra trailing bytes after the tuple are ignored (`spec.md` §4.4).
pub fn decode_body(bytes: &[u8]) -> Result<(String, Vec<Value>)> {
    let mut cur = Cursor::new(bytes);
    let tuple = rmpv::decode::read_value(&mut cur)
        .map_err(|e| DatasetError::MsgPackDecode(e.to_string()))?;
    let Msg::Array(items) = tuple else {
        return Err(DatasetError::MsgPackDecode(
            "row body is not a 2-tuple".into(),
        ));
    };
    let mut it = items.into_iter();
    let legend_id = match it.next() {
        Some(Msg::String(s)) => s
            .into_str()
            .ok_or_else(|| DatasetError::MsgPackDecode("legend id is not valid utf-8".into()))?,
        _ => return Err(DatasetError::MsgPackDecode("missing legend id".into())),
    };
    let raw_values = match it.next() {
        Some(Msg::Array(values)) => values,
        _ => return Err(DatasetError::MsgPackDecode("missing value tuple".into())),
    };
    let values = raw_values
        .into_iter()
        .map(msg_to_value)
        .collect::<Result<Vec<Value>>>()?;
    Ok((legend_id, values))
}

/// Decode a feature filename (base64 or base64url, padded or not) into its
/// primary-key value tuple (`spec.md` §4.4, §6).
pub fn decode_pk_tuple(filename_stem: &str) -> Result<Vec<Value>> {
    let bytes = decode_filename_base64(filename_stem)?;
    let mut cur = Cursor::new(bytes.as_slice());
    let tuple = rmpv::decode::read_value(&mut cur)
        .map_err(|e| DatasetError::MsgPackDecode(e.to_string()))?;
    let Msg::Array(items) = tuple else {
        return Err(DatasetError::MsgPackDecode(
            "primary key filename is not an array".into(),
        ));
    };
    items.into_iter().map(msg_to_value).collect()
}

/// Encode a row body: `[legendId, nonPrimaryKeyValues]`, the write-side
/// counterpart of [`decode_body`].
pub fn encode_body(legend_id: &str, values: &[Value]) -> Result<Vec<u8>> {
    let items: Vec<Msg> = values.iter().map(value_to_msg).collect::<Result<_>>()?;
    let tuple = Msg::Array(vec![Msg::String(legend_id.to_string().into()), Msg::Array(items)]);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &tuple).map_err(|e| DatasetError::MsgPackEncode(e.to_string()))?;
    Ok(out)
}

fn decode_filename_base64(s: &str) -> Result<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
    for engine in [&URL_SAFE_NO_PAD as &dyn Engine, &URL_SAFE, &STANDARD_NO_PAD, &STANDARD] {
        if let Ok(bytes) = engine.decode(s) {
            return Ok(bytes);
        }
    }
    Err(DatasetError::MsgPackDecode(format!(
        "filename `{s}` is not valid base64/base64url"
    )))
}

/// Pack a primary-key value tuple into MessagePack bytes, used both for
/// feature filenames and as the hash input for `msgpack/hash` path structures.
pub fn pack_value_tuple(values: &[Value]) -> Result<Vec<u8>> {
    let items: Vec<Msg> = values.iter().map(value_to_msg).collect::<Result<_>>()?;
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &Msg::Array(items))
        .map_err(|e| DatasetError::MsgPackEncode(e.to_string()))?;
    Ok(out)
}

fn msg_to_value(m: Msg) -> Result<Value> {
    match m {
        Msg::Nil => Ok(Value::Null),
        Msg::Boolean(b) => Ok(Value::Boolean(b)),
        Msg::Integer(i) => {
            if let Some(v) = i.as_i64() {
                Ok(Value::Integer(BigInt::from(v)))
            } else if let Some(v) = i.as_u64() {
                Ok(Value::Integer(BigInt::from(v)))
            } else {
                Err(DatasetError::MsgPackDecode("integer out of i64/u64 range".into()))
            }
        }
        Msg::F32(f) => Ok(Value::Float(f64::from(f))),
        Msg::F64(f) => Ok(Value::Float(f)),
        Msg::String(s) => Ok(Value::Text(
            s.into_str()
                .ok_or_else(|| DatasetError::MsgPackDecode("string is not valid utf-8".into()))?,
        )),
        Msg::Binary(b) => Ok(Value::Blob(b)),
        Msg::Ext(kind, data) => decode_ext(kind, &data),
        other => Err(DatasetError::MsgPackDecode(format!(
            "unsupported msgpack value: {other:?}"
        ))),
    }
}

fn decode_ext(kind: i8, data: &[u8]) -> Result<Value> {
    match kind {
        EXT_GEOMETRY => {
            let geom = geometry::decode_geometry(data)?;
            Ok(Value::Geometry(Box::new(geom)))
        }
        EXT_TIMESTAMP => Ok(Value::TimestampInstant(decode_timestamp_ext(data)?)),
        other => Err(DatasetError::MsgPackDecode(format!(
            "unsupported msgpack extension type {other}"
        ))),
    }
}

fn value_to_msg(v: &Value) -> Result<Msg> {
    match v {
        Value::Null => Ok(Msg::Nil),
        Value::Boolean(b) => Ok(Msg::Boolean(*b)),
        Value::Integer(n) => {
            if let Ok(v) = i64::try_from(n.clone()) {
                Ok(Msg::from(v))
            } else if let Ok(v) = u64::try_from(n.clone()) {
                Ok(Msg::from(v))
            } else {
                Err(DatasetError::MsgPackEncode(
                    "integer does not fit in i64/u64".into(),
                ))
            }
        }
        Value::Float(f) => Ok(Msg::F64(*f)),
        Value::Text(s) => Ok(Msg::String(s.clone().into())),
        Value::Blob(b) => Ok(Msg::Binary(b.clone())),
        Value::Geometry(g) => {
            let bytes = geometry::encode_geometry(g, has_z(g))?;
            Ok(Msg::Ext(EXT_GEOMETRY, bytes))
        }
        Value::TimestampInstant(ts) => Ok(Msg::Ext(EXT_TIMESTAMP, encode_timestamp_ext(*ts))),
    }
}

fn has_z(g: &geojson::Geometry) -> bool {
    let mut found = false;
    fn probe(value: &geojson::Value, found: &mut bool) {
        use geojson::Value::*;
        match value {
            Point(p) => {
                if p.len() > 2 {
                    *found = true;
                }
            }
            MultiPoint(pts) | LineString(pts) => {
                if pts.iter().any(|p| p.len() > 2) {
                    *found = true;
                }
            }
            Polygon(rings) | MultiLineString(rings) => {
                if rings.iter().any(|r| r.iter().any(|p| p.len() > 2)) {
                    *found = true;
                }
            }
            MultiPolygon(polys) => {
                if polys
                    .iter()
                    .any(|poly| poly.iter().any(|r| r.iter().any(|p| p.len() > 2)))
                {
                    *found = true;
                }
            }
            GeometryCollection(geoms) => {
                for g in geoms {
                    probe(&g.value, found);
                }
            }
        }
    }
    probe(&g.value, &mut found);
    found
}

/// Canonical MessagePack timestamp extension decode (32/64/96-bit formats).
fn decode_timestamp_ext(data: &[u8]) -> Result<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    let (sec, nsec): (i64, u32) = match data.len() {
        4 => {
            let secs = Cursor::new(data).read_u32::<BigEndian>().unwrap();
            (i64::from(secs), 0)
        }
        8 => {
            let combined = Cursor::new(data).read_u64::<BigEndian>().unwrap();
            let nsec = (combined >> 34) as u32;
            let secs = (combined & 0x0003_ffff_ffff) as i64;
            (secs, nsec)
        }
        12 => {
            let mut cur = Cursor::new(data);
            let nsec = cur.read_u32::<BigEndian>().unwrap();
            let secs = cur.read_i64::<BigEndian>().unwrap();
            (secs, nsec)
        }
        other => {
            return Err(DatasetError::MsgPackDecode(format!(
                "timestamp extension has unsupported length {other}"
            )))
        }
    };
    chrono::Utc
        .timestamp_opt(sec, nsec)
        .single()
        .ok_or_else(|| DatasetError::MsgPackDecode("timestamp out of range".into()))
}

fn encode_timestamp_ext(ts: chrono::DateTime<chrono::Utc>) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let secs = ts.timestamp();
    let nsec = ts.timestamp_subsec_nanos();
    let mut out = Vec::with_capacity(12);
    if secs >= 0 && (secs as u64) <= 0x0003_ffff_ffff && nsec > 0 {
        let combined = (u64::from(nsec) << 34) | (secs as u64);
        out.write_u64::<BigEndian>(combined).unwrap();
    } else if secs >= 0 && nsec == 0 && secs <= i64::from(u32::MAX) {
        out.write_u32::<BigEndian>(secs as u32).unwrap();
    } else {
        out.write_u32::<BigEndian>(nsec).unwrap();
        out.write_i64::<BigEndian>(secs).unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_trips_pk_tuple() {
        let values = vec![Value::Integer(BigInt::from(12345))];
        let bytes = pack_value_tuple(&values).unwrap();
        let filename = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes);
        let decoded = decode_pk_tuple(&filename).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_filename_accepts_padded_base64() {
        let values = vec![Value::Text("A".into())];
        let bytes = pack_value_tuple(&values).unwrap();
        let filename = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let decoded = decode_pk_tuple(&filename).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn timestamp_round_trips() {
        let ts = chrono::Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap();
        let data = encode_timestamp_ext(ts);
        let decoded = decode_timestamp_ext(&data).unwrap();
        assert_eq!(decoded, ts);
    }

    #[test]
    fn encode_body_round_trips_through_decode() {
        let values = vec![Value::Text("Alice".into()), Value::Integer(BigInt::from(42))];
        let bytes = encode_body("legend123", &values).unwrap();
        let (legend_id, decoded) = decode_body(&bytes).unwrap();
        assert_eq!(legend_id, "legend123");
        assert_eq!(decoded, values);
    }

    #[test]
    fn body_decode_ignores_trailing_bytes() {
        let tuple = Msg::Array(vec![
            Msg::String("abc".into()),
            Msg::Array(vec![Msg::from(1_i64)]),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &tuple).unwrap();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let (legend_id, values) = decode_body(&bytes).unwrap();
        assert_eq!(legend_id, "abc");
        assert_eq!(values, vec![Value::Integer(BigInt::from(1))]);
    }
}

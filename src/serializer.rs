//! Canonical JSON, Kart-wire JSON, and truncated SHA-256 hashing
//! (`spec.md` §2 "Serializer", §4.2, §4.7).
use sha2::{Digest, Sha256};

use crate::geometry;
use crate::value::Value;

/// Canonical JSON rendition of a `Value`, used for equality checks (e.g.
/// `WorkingFeatureCollection::updateProperties` comparing an overlay value
/// against the baseline). Keys of any enclosing object are assumed already
/// sorted by the caller; this function only renders a single value.
pub fn canonical_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::Integer(n) => json!(n.to_string()),
        Value::Float(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(hex::encode(b)),
        Value::Geometry(g) => json!(g.value),
        Value::TimestampInstant(ts) => json!(ts.to_rfc3339()),
    }
}

/// Kart-wire JSON rendition (`spec.md` §4.7, §6): geometries as hex WKB,
/// blobs as hex, big integers as raw JSON numbers, temporals as ISO strings.
pub fn kart_wire_json(value: &Value) -> crate::error::Result<serde_json::Value> {
    use serde_json::json;
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::Integer(n) => {
            // Raw JSON number per spec; large values still render via serde_json's
            // arbitrary-precision number support when the `arbitrary_precision`
            // feature isn't enabled we fall back to i64 when representable.
            match i64::try_from(n.clone()) {
                Ok(v) => json!(v),
                Err(_) => json!(n.to_string()),
            }
        }
        Value::Float(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(hex::encode(b)),
        Value::Geometry(g) => {
            let has_z = has_z_dimension(g);
            let bytes = geometry::encode_wkb_bytes(&g.value, has_z)?;
            json!(hex::encode(bytes))
        }
        Value::TimestampInstant(ts) => json!(ts.to_rfc3339()),
    })
}

fn has_z_dimension(g: &geojson::Geometry) -> bool {
    fn probe(value: &geojson::Value) -> bool {
        use geojson::Value::*;
        match value {
            Point(p) => p.len() > 2,
            MultiPoint(pts) | LineString(pts) => pts.iter().any(|p| p.len() > 2),
            Polygon(rings) | MultiLineString(rings) => {
                rings.iter().any(|r| r.iter().any(|p| p.len() > 2))
            }
            MultiPolygon(polys) => polys
                .iter()
                .any(|poly| poly.iter().any(|r| r.iter().any(|p| p.len() > 2))),
            GeometryCollection(geoms) => geoms.iter().any(|g| probe(&g.value)),
        }
    }
    probe(&g.value)
}

/// `hex(sha256(bytes)[0..20])` (`spec.md` §4.2, §6).
pub fn truncated_sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[0..20])
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    #[test]
    fn truncated_hash_is_20_bytes_hex() {
        let h = truncated_sha256_hex(b"hello");
        assert_eq!(h.len(), 40);
    }

    #[test]
    fn kart_wire_json_renders_blob_as_hex() {
        let v = Value::Blob(vec![0xde, 0xad]);
        assert_eq!(kart_wire_json(&v).unwrap(), serde_json::json!("dead"));
    }

    #[test]
    fn kart_wire_json_renders_big_integer_as_raw_number() {
        let v = Value::Integer(BigInt::from(42));
        assert_eq!(kart_wire_json(&v).unwrap(), serde_json::json!(42));
    }

    #[test]
    fn kart_wire_json_renders_geometry_as_plain_wkb_hex() {
        let geom = geojson::Geometry::new(geojson::Value::Point(vec![10.0, -20.0]));
        let v = Value::Geometry(Box::new(geom.clone()));
        let rendered = kart_wire_json(&v).unwrap();
        let hex = rendered.as_str().unwrap();
        let bytes = hex::decode(hex).unwrap();

        // Plain WKB, not the geopackage envelope: starts with the byte-order
        // marker (1 = little-endian), not the `GP` magic.
        assert_eq!(bytes[0], 1);
        assert_ne!(&bytes[0..2], b"GP");

        let decoded = geometry::decode_wkb(&bytes).unwrap();
        assert_eq!(decoded.value, geom.value);
    }
}

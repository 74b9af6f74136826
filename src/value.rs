//! The tagged-union value type shared by [`crate::raw_feature::RawFeature`],
//! [`crate::feature::Feature`], and the canonical serializer.
//!
//! Mirrors the role `geozero`'s `ColumnValue` plays for property access, but
//! carries an owned value (raw rows are decoded once per feature, not
//! streamed) and adds the geometry/timestamp variants Table Dataset V3 rows
//! carry on the wire (see `spec.md` §4.4, §6).
use std::fmt;

use geojson::Geometry;
use num_bigint::BigInt;

/// A decoded-but-not-yet-typed column value.
///
/// This is what `RawFeature::to_object` stores in `ids`/`properties` (see
/// `spec.md` §4.4): a value straight off the wire, before a [`crate::schema::Schema`]
/// has told us which logical type it is. Typed accessors in
/// [`crate::feature::Feature`] consume `Value` and coerce it into the native
/// representation their `dataType` calls for.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    /// Arbitrary-precision integer (required to carry 64-bit values losslessly).
    Integer(BigInt),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Geometry(Box<Geometry>),
    /// Instant-in-time produced by the MessagePack timestamp extension (§4.4, §6).
    TimestampInstant(chrono::DateTime<chrono::Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(_) => write!(f, "[BLOB]"),
            Value::Geometry(_) => write!(f, "[GEOMETRY]"),
            Value::TimestampInstant(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

/// Result of a typed accessor call (`spec.md` §4.5, §9): normalized data plus
/// any soft constraint violations. `ok == false` means the value could not be
/// coerced at all; soft violations (numeric precision/scale, text length) are
/// reported in `errors` while `ok` stays `true` and `data` is still populated.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub errors: Vec<crate::error::ValidationIssue>,
}

impl<T> FieldResult<T> {
    pub fn ok(data: Option<T>) -> Self {
        FieldResult {
            ok: true,
            data,
            errors: Vec::new(),
        }
    }

    pub fn ok_with_warnings(data: T, errors: Vec<crate::error::ValidationIssue>) -> Self {
        FieldResult {
            ok: true,
            data: Some(data),
            errors,
        }
    }

    pub fn fail(errors: Vec<crate::error::ValidationIssue>) -> Self {
        FieldResult {
            ok: false,
            data: None,
            errors,
        }
    }
}

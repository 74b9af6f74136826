//! Feature: a RawFeature projected through Schema+Legend+CRS into typed,
//! validated accessors, plus GeoJSON conversion (`spec.md` §3, §4.5).
use std::collections::HashMap;

use geojson::Geometry;
use num_bigint::BigInt;
use num_traits::Num;
use rust_decimal::Decimal;
use serde_json::{json, Map as JsonMap, Value as Json};

use crate::error::{DatasetError, Result, ValidationIssue};
use crate::raw_feature::ProjectedFeature;
use crate::schema::{DataType, Schema};
use crate::value::{FieldResult, Value};

/// CRS reprojection is an external collaborator (`spec.md` §1): "treat as a
/// library callable with (coords, fromCRS, toCRS) -> coords". Implementors
/// plug in a real reprojection backend; [`IdentityReprojector`] is the
/// no-op used when the feature's CRS already matches the target.
pub trait CrsReprojector {
    fn reproject(&self, geometry: &Geometry, from_crs: &str, to_crs: &str) -> Result<Geometry>;
}

/// No-op reprojector: returns the geometry unchanged. Correct whenever
/// `from_crs == to_crs`; callers supplying a real reprojector should prefer
/// it whenever the CRSs differ.
pub struct IdentityReprojector;

impl CrsReprojector for IdentityReprojector {
    fn reproject(&self, geometry: &Geometry, _from_crs: &str, _to_crs: &str) -> Result<Geometry> {
        Ok(geometry.clone())
    }
}

/// A typed, validated row (`spec.md` §3 `Feature`).
#[derive(Debug, Clone)]
pub struct Feature<'a> {
    schema: &'a Schema,
    pub ids: HashMap<String, Value>,
    pub properties: HashMap<String, Value>,
    pub geometry_column: Option<String>,
    pub crs: Option<String>,
    pub dropped_keys: Vec<String>,
    pub eid: String,
}

impl<'a> Feature<'a> {
    pub fn from_projected(projected: ProjectedFeature, schema: &'a Schema) -> Feature<'a> {
        Feature {
            schema,
            ids: projected.ids,
            properties: projected.properties,
            geometry_column: projected.geometry_column,
            crs: projected.crs,
            dropped_keys: projected.dropped_keys,
            eid: projected.eid,
        }
    }

    fn raw_value(&self, name: &str) -> Option<&Value> {
        self.ids.get(name).or_else(|| self.properties.get(name))
    }

    fn entry(&self, name: &str, expected: DataType) -> Result<&crate::schema::SchemaEntry> {
        let entry = self.schema.get(name).ok_or_else(|| DatasetError::TypeMismatch {
            accessor: expected.name(),
            column: name.to_string(),
            actual: "<unknown column>".into(),
        })?;
        if entry.data_type != expected {
            return Err(DatasetError::TypeMismatch {
                accessor: expected.name(),
                column: name.to_string(),
                actual: entry.data_type.name().to_string(),
            });
        }
        Ok(entry)
    }

    pub fn get_boolean(&self, name: &str) -> Result<FieldResult<bool>> {
        self.entry(name, DataType::Boolean)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Boolean(b)) => FieldResult::ok(Some(*b)),
            Some(Value::Integer(n)) if *n == BigInt::from(0) => FieldResult::ok(Some(false)),
            Some(Value::Integer(n)) if *n == BigInt::from(1) => FieldResult::ok(Some(true)),
            Some(Value::Text(s)) if s.eq_ignore_ascii_case("true") => FieldResult::ok(Some(true)),
            Some(Value::Text(s)) if s.eq_ignore_ascii_case("false") => FieldResult::ok(Some(false)),
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid boolean",
            )]),
        })
    }

    pub fn get_blob(&self, name: &str) -> Result<FieldResult<Vec<u8>>> {
        self.entry(name, DataType::Blob)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Blob(b)) => FieldResult::ok(Some(b.clone())),
            Some(Value::Text(s)) => match base64_decode_any(s) {
                Some(bytes) => FieldResult::ok(Some(bytes)),
                None => FieldResult::fail(vec![ValidationIssue::new(
                    name,
                    "invalid_format",
                    "not valid base64",
                )]),
            },
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid blob",
            )]),
        })
    }

    pub fn get_text(&self, name: &str) -> Result<FieldResult<String>> {
        let entry = self.entry(name, DataType::Text)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Text(s)) => {
                if let Some(max) = entry.length {
                    if s.chars().count() > max as usize {
                        return Ok(FieldResult::fail(vec![ValidationIssue::new(
                            name,
                            "too_big",
                            format!("text exceeds max length {max}"),
                        )]));
                    }
                }
                FieldResult::ok(Some(s.clone()))
            }
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid text value",
            )]),
        })
    }

    pub fn get_float(&self, name: &str) -> Result<FieldResult<f64>> {
        self.entry(name, DataType::Float)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Float(f)) => FieldResult::ok(Some(*f)),
            Some(Value::Integer(n)) => FieldResult::ok(Some(bigint_to_f64(n))),
            Some(Value::Text(s)) => match s.parse::<f64>() {
                Ok(f) if f.is_finite() => FieldResult::ok(Some(f)),
                _ => FieldResult::fail(vec![ValidationIssue::new(
                    name,
                    "invalid_format",
                    "not a finite number",
                )]),
            },
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid float",
            )]),
        })
    }

    pub fn get_integer(&self, name: &str) -> Result<FieldResult<BigInt>> {
        let entry = self.entry(name, DataType::Integer)?;
        let size = entry.size.unwrap_or(64);
        let parsed: Option<BigInt> = match self.raw_value(name) {
            None | Some(Value::Null) => None,
            Some(Value::Integer(n)) => Some(n.clone()),
            Some(Value::Text(s)) => {
                let trimmed = s.strip_suffix('n').unwrap_or(s);
                BigInt::from_str_radix(trimmed, 10).ok()
            }
            _ => None,
        };
        let Some(n) = parsed else {
            let had_value = !matches!(self.raw_value(name), None | Some(Value::Null));
            return Ok(if had_value {
                FieldResult::fail(vec![ValidationIssue::new(
                    name,
                    "invalid_format",
                    "not a valid integer",
                )])
            } else {
                FieldResult::ok(None)
            });
        };
        if !fits_signed_bit_size(&n, size) {
            return Ok(FieldResult::fail(vec![ValidationIssue::new(
                name,
                "out_of_range",
                format!("integer does not fit in {size}-bit signed range"),
            )]));
        }
        Ok(FieldResult::ok(Some(n)))
    }

    pub fn get_numeric(&self, name: &str) -> Result<FieldResult<Decimal>> {
        let entry = self.entry(name, DataType::Numeric)?;
        let text = match self.raw_value(name) {
            None | Some(Value::Null) => return Ok(FieldResult::ok(None)),
            Some(Value::Text(s)) => s.clone(),
            Some(Value::Integer(n)) => n.to_string(),
            Some(Value::Float(f)) => f.to_string(),
            _ => {
                return Ok(FieldResult::fail(vec![ValidationIssue::new(
                    name,
                    "invalid_format",
                    "not a valid numeric value",
                )]))
            }
        };
        let Ok(decimal) = text.parse::<Decimal>() else {
            return Ok(FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not parseable as a fixed-point decimal",
            )]));
        };
        if decimal.to_string() != text && decimal.normalize().to_string() != text {
            // round-trip mismatch is tolerated for numeric (unlike date/time/interval);
            // only precision/scale are enforced per spec.md §4.5.
        }
        let mut errors = Vec::new();
        if let Some(precision) = entry.precision {
            if digit_count(&decimal) > precision as usize {
                errors.push(ValidationIssue::new(
                    name,
                    "too_big",
                    format!("exceeds precision {precision}"),
                ));
            }
        }
        if let Some(scale) = entry.scale {
            if decimal.scale() > scale {
                errors.push(ValidationIssue::new(
                    name,
                    "too_precise",
                    format!("exceeds scale {scale}"),
                ));
            }
        }
        Ok(FieldResult::ok_with_warnings(decimal, errors))
    }

    pub fn get_geometry(&self, name: &str) -> Result<FieldResult<Geometry>> {
        self.entry(name, DataType::Geometry)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Geometry(g)) => FieldResult::ok(Some((**g).clone())),
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid geometry",
            )]),
        })
    }

    pub fn get_date(&self, name: &str) -> Result<FieldResult<String>> {
        self.round_trip_text(name, DataType::Date, |s| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok()
        })
    }

    pub fn get_time(&self, name: &str) -> Result<FieldResult<String>> {
        self.round_trip_text(name, DataType::Time, |s| {
            chrono::NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map(|t| t.format("%H:%M:%S%.f").to_string())
                .ok()
        })
    }

    pub fn get_timestamp(&self, name: &str) -> Result<FieldResult<String>> {
        self.round_trip_text(name, DataType::Timestamp, |s| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                .ok()
        })
    }

    pub fn get_interval(&self, name: &str) -> Result<FieldResult<String>> {
        self.round_trip_text(name, DataType::Interval, |s| {
            if crate::iso8601::is_valid_duration(s) {
                Some(s.to_string())
            } else {
                None
            }
        })
    }

    fn round_trip_text(
        &self,
        name: &str,
        expected: DataType,
        parse_and_render: impl Fn(&str) -> Option<String>,
    ) -> Result<FieldResult<String>> {
        self.entry(name, expected)?;
        Ok(match self.raw_value(name) {
            None | Some(Value::Null) => FieldResult::ok(None),
            Some(Value::Text(s)) => match parse_and_render(s) {
                Some(rendered) if &rendered == s => FieldResult::ok(Some(s.clone())),
                _ => FieldResult::fail(vec![ValidationIssue::new(
                    name,
                    "invalid_format",
                    format!("`{s}` does not round-trip as {}", expected.name()),
                )]),
            },
            _ => FieldResult::fail(vec![ValidationIssue::new(
                name,
                "invalid_format",
                "not a valid string value",
            )]),
        })
    }

    /// Run every accessor once; collect all issues. Returns warnings on
    /// success (every field coerced, possibly with soft issues) or
    /// `AggregateValidation` when any field's accessor failed outright
    /// (`spec.md` §7, §9).
    pub fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let mut warnings = Vec::new();
        let mut hard_failures = Vec::new();
        for entry in self.schema.iter() {
            let field = match entry.data_type {
                DataType::Boolean => self.get_boolean(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Blob => self.get_blob(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Date => self.get_date(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Float => self.get_float(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Geometry => self.get_geometry(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Integer => self.get_integer(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Interval => self.get_interval(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Numeric => self.get_numeric(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Text => self.get_text(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Time => self.get_time(&entry.name).map(|r| (r.ok, r.errors)),
                DataType::Timestamp => self.get_timestamp(&entry.name).map(|r| (r.ok, r.errors)),
            }?;
            let (ok, errors) = field;
            if ok {
                warnings.extend(errors);
            } else {
                hard_failures.extend(errors);
            }
        }
        if hard_failures.is_empty() {
            Ok(warnings)
        } else {
            hard_failures.extend(warnings);
            Err(DatasetError::AggregateValidation(hard_failures))
        }
    }

    /// `Feature.toGeoJSON()` (`spec.md` §4.5). Returns `None` when there is
    /// no geometry column or its value is null.
    pub fn to_geojson(&self, reprojector: &dyn CrsReprojector) -> Result<Option<Json>> {
        let Some(geom_col) = &self.geometry_column else {
            return Ok(None);
        };
        let geom_result = self.get_geometry(geom_col)?;
        let Some(geometry) = geom_result.data else {
            return Ok(None);
        };

        let from_crs = self.crs.as_deref().unwrap_or(crate::crs::DEFAULT_CRS);
        let reprojected = if from_crs == crate::crs::DEFAULT_CRS {
            geometry
        } else {
            reprojector.reproject(&geometry, from_crs, crate::crs::DEFAULT_CRS)?
        };

        let mut properties = JsonMap::new();
        for (name, value) in &self.properties {
            if name == geom_col {
                continue;
            }
            properties.insert(name.clone(), value_to_geojson_property(value));
        }

        let ids_json: JsonMap<String, Json> = self
            .ids
            .iter()
            .map(|(k, v)| (k.clone(), value_to_geojson_property(v)))
            .collect();

        Ok(Some(json!({
            "type": "Feature",
            "id": self.eid,
            "_kart": {
                "ids": ids_json,
                "eid": self.eid,
                "geometryColumn": geom_col,
            },
            "properties": properties,
            "geometry": reprojected.value,
        })))
    }

    /// `Feature.fromGeoJSON()` (`spec.md` §4.5): inverts `to_geojson`, then
    /// validates, raising `AggregateValidation` on any hard failure.
    pub fn from_geojson(feature_with_ids: &Json, schema: &'a Schema) -> Result<Feature<'a>> {
        let kart = feature_with_ids.get("_kart").ok_or_else(|| {
            DatasetError::InvalidValue {
                column: "_kart".into(),
                reason: "GeoJSON feature is missing `_kart`".into(),
            }
        })?;
        let ids_json = kart.get("ids").and_then(Json::as_object).ok_or_else(|| {
            DatasetError::InvalidValue {
                column: "_kart.ids".into(),
                reason: "missing or not an object".into(),
            }
        })?;

        let mut ids = HashMap::new();
        for name in schema.primary_key_names() {
            let entry = schema.get(name).expect("name from schema");
            let json_value = ids_json.get(name).cloned().unwrap_or(Json::Null);
            ids.insert(name.to_string(), json_to_value(&json_value, entry.data_type));
        }

        let mut properties = HashMap::new();
        let empty = JsonMap::new();
        let props_json = feature_with_ids
            .get("properties")
            .and_then(Json::as_object)
            .unwrap_or(&empty);
        let geometry_entry = schema.primary_geometry();
        for name in schema.non_primary_key_names() {
            let entry = schema.get(name).expect("name from schema");
            let json_value = props_json.get(name).cloned().unwrap_or(Json::Null);
            properties.insert(name.to_string(), json_to_value(&json_value, entry.data_type));
        }
        if let Some(geom_entry) = geometry_entry {
            if let Some(geom_json) = feature_with_ids.get("geometry") {
                if !geom_json.is_null() {
                    let geom: Geometry =
                        serde_json::from_value(geom_json.clone()).map_err(|e| DatasetError::GeoJson(e.to_string()))?;
                    properties.insert(geom_entry.name.clone(), Value::Geometry(Box::new(geom)));
                }
            }
        }

        let eid = kart
            .get("eid")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let geometry_column = geometry_entry.map(|e| e.name.clone());
        let crs = geometry_entry.and_then(|e| e.geometry_crs.clone());

        let feature = Feature {
            schema,
            ids,
            properties,
            geometry_column,
            crs,
            dropped_keys: Vec::new(),
            eid,
        };
        feature.validate()?;
        Ok(feature)
    }
}

fn value_to_geojson_property(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => json!(b),
        Value::Integer(n) => match i64::try_from(n.clone()) {
            Ok(v) => json!(v),
            Err(_) => json!(n.to_string()),
        },
        Value::Float(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b
        )),
        Value::Geometry(g) => serde_json::to_value(&g.value).unwrap_or(Json::Null),
        Value::TimestampInstant(ts) => json!(ts.to_rfc3339()),
    }
}

fn json_to_value(json: &Json, data_type: DataType) -> Value {
    match (json, data_type) {
        (Json::Null, _) => Value::Null,
        (Json::Bool(b), _) => Value::Boolean(*b),
        (Json::String(s), DataType::Blob) => base64_decode_any(s).map(Value::Blob).unwrap_or(Value::Text(s.clone())),
        (Json::String(s), _) => Value::Text(s.clone()),
        (Json::Number(n), DataType::Integer) => n
            .as_i64()
            .map(BigInt::from)
            .map(Value::Integer)
            .unwrap_or_else(|| Value::Text(n.to_string())),
        (Json::Number(n), _) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        (Json::Array(arr), DataType::Blob) => {
            let bytes: Option<Vec<u8>> = arr
                .iter()
                .map(|v| v.as_u64().filter(|b| *b <= 255).map(|b| b as u8))
                .collect();
            bytes.map(Value::Blob).unwrap_or(Value::Null)
        }
        (other, _) => Value::Text(other.to_string()),
    }
}

fn base64_decode_any(s: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
    use base64::Engine;
    [&STANDARD as &dyn Engine, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(s).ok())
}

fn bigint_to_f64(n: &BigInt) -> f64 {
    n.to_string().parse::<f64>().unwrap_or(f64::NAN)
}

fn fits_signed_bit_size(n: &BigInt, size: u32) -> bool {
    let (min, max): (BigInt, BigInt) = match size {
        8 => (BigInt::from(i8::MIN), BigInt::from(i8::MAX)),
        16 => (BigInt::from(i16::MIN), BigInt::from(i16::MAX)),
        32 => (BigInt::from(i32::MIN), BigInt::from(i32::MAX)),
        _ => (BigInt::from(i64::MIN), BigInt::from(i64::MAX)),
    };
    *n >= min && *n <= max
}

fn digit_count(d: &Decimal) -> usize {
    d.normalize()
        .to_string()
        .chars()
        .filter(char::is_ascii_digit)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;

    fn entry(id: &str, data_type: DataType) -> SchemaEntry {
        SchemaEntry {
            id: id.into(),
            name: id.into(),
            data_type,
            primary_key_index: None,
            size: Some(64),
            length: None,
            precision: Some(10),
            scale: Some(2),
            timezone: None,
            geometry_type: None,
            geometry_crs: None,
        }
    }

    fn feature_with(schema: &Schema, properties: HashMap<String, Value>) -> Feature<'_> {
        Feature {
            schema,
            ids: HashMap::new(),
            properties,
            geometry_column: None,
            crs: None,
            dropped_keys: Vec::new(),
            eid: "x".into(),
        }
    }

    #[test]
    fn integer_round_trips() {
        let schema = Schema::from_entries(vec![entry("n", DataType::Integer)]).unwrap();
        let mut props = HashMap::new();
        props.insert("n".to_string(), Value::Integer(BigInt::from(42)));
        let f = feature_with(&schema, props);
        let result = f.get_integer("n").unwrap();
        assert_eq!(result.data, Some(BigInt::from(42)));
        assert!(result.ok);
    }

    #[test]
    fn integer_out_of_range_is_hard_failure() {
        let mut e = entry("n", DataType::Integer);
        e.size = Some(8);
        let schema = Schema::from_entries(vec![e]).unwrap();
        let mut props = HashMap::new();
        props.insert("n".to_string(), Value::Integer(BigInt::from(1000)));
        let f = feature_with(&schema, props);
        let result = f.get_integer("n").unwrap();
        assert!(!result.ok);
    }

    #[test]
    fn numeric_precision_overflow_is_soft_warning() {
        let schema = Schema::from_entries(vec![entry("amount", DataType::Numeric)]).unwrap();
        let mut props = HashMap::new();
        props.insert("amount".to_string(), Value::Text("123456789012.34".into()));
        let f = feature_with(&schema, props);
        let result = f.get_numeric("amount").unwrap();
        assert!(result.ok);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn text_too_long_is_hard_failure() {
        let mut e = entry("name", DataType::Text);
        e.length = Some(3);
        let schema = Schema::from_entries(vec![e]).unwrap();
        let mut props = HashMap::new();
        props.insert("name".to_string(), Value::Text("abcdef".into()));
        let f = feature_with(&schema, props);
        let result = f.get_text("name").unwrap();
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "too_big");
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let schema = Schema::from_entries(vec![entry("name", DataType::Text)]).unwrap();
        let f = feature_with(&schema, HashMap::new());
        assert!(f.get_integer("name").is_err());
    }
}

//! `schema.json` parsing, the typed column model, and the JSON-Schema
//! projection (`spec.md` §4.1).
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::error::{DatasetError, Result};
use crate::legend::Legend;

/// `dataType` discriminant (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Boolean,
    Blob,
    Date,
    Float,
    Geometry,
    Integer,
    Interval,
    Numeric,
    Text,
    Time,
    Timestamp,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Blob => "blob",
            DataType::Date => "date",
            DataType::Float => "float",
            DataType::Geometry => "geometry",
            DataType::Integer => "integer",
            DataType::Interval => "interval",
            DataType::Numeric => "numeric",
            DataType::Text => "text",
            DataType::Time => "time",
            DataType::Timestamp => "timestamp",
        }
    }
}

/// `timezone` of a `timestamp` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timezone {
    #[serde(rename = "UTC")]
    Utc,
}

/// A single column descriptor (`spec.md` §3 `SchemaEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(rename = "primaryKeyIndex", skip_serializing_if = "Option::is_none")]
    pub primary_key_index: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<Timezone>,
    #[serde(rename = "geometryType", skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    #[serde(rename = "geometryCrs", skip_serializing_if = "Option::is_none")]
    pub geometry_crs: Option<String>,
}

impl SchemaEntry {
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_index.is_some()
    }
}

const GEOMETRY_TYPES: &[&str] = &[
    "GEOMETRY",
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
];

fn validate_entry(e: &SchemaEntry) -> Result<()> {
    let bad = |reason: String| {
        Err(DatasetError::SchemaValidation {
            subject: format!("schema.json column `{}`", e.id),
            reason,
        })
    };
    match e.data_type {
        DataType::Integer => {
            if !matches!(e.size, Some(8 | 16 | 32 | 64)) {
                return bad("integer column must have size in {8,16,32,64}".into());
            }
        }
        DataType::Float => {
            if !matches!(e.size, Some(32 | 64)) {
                return bad("float column must have size in {32,64}".into());
            }
        }
        DataType::Numeric => {
            if e.precision.is_none() || e.scale.is_none() {
                return bad("numeric column requires precision and scale".into());
            }
        }
        DataType::Geometry => {
            let Some(gt) = e.geometry_type.as_deref() else {
                return bad("geometry column requires geometryType".into());
            };
            let base = gt.trim_end_matches(['Z', 'M']).trim_end_matches("ZM");
            let base = if gt.ends_with("ZM") {
                gt.trim_end_matches("ZM")
            } else {
                base
            };
            if !GEOMETRY_TYPES.contains(&base.to_ascii_uppercase().as_str()) {
                return bad(format!("unknown geometryType `{gt}`"));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Ordered sequence of [`SchemaEntry`] parsed from `schema.json` (`spec.md` §3, §4.1).
#[derive(Debug, Clone)]
pub struct Schema {
    entries: Vec<SchemaEntry>,
}

impl Schema {
    /// Parse and validate `schema.json` contents.
    pub fn parse(contents: &str) -> Result<Schema> {
        let entries: Vec<SchemaEntry> =
            serde_json::from_str(contents).map_err(|e| DatasetError::InvalidFileContents {
                path: "schema.json".into(),
                reason: e.to_string(),
            })?;
        Schema::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<SchemaEntry>) -> Result<Schema> {
        if entries.is_empty() {
            return Err(DatasetError::SchemaValidation {
                subject: "schema.json".into(),
                reason: "schema must contain at least one column".into(),
            });
        }
        let mut seen_ids = std::collections::HashSet::new();
        for e in &entries {
            if !seen_ids.insert(e.id.clone()) {
                return Err(DatasetError::SchemaValidation {
                    subject: "schema.json".into(),
                    reason: format!("duplicate column id `{}`", e.id),
                });
            }
            validate_entry(e)?;
        }
        let mut pk_indices: Vec<u32> = entries
            .iter()
            .filter_map(|e| e.primary_key_index)
            .collect();
        pk_indices.sort_unstable();
        for (i, idx) in pk_indices.iter().enumerate() {
            if *idx != i as u32 {
                return Err(DatasetError::SchemaValidation {
                    subject: "schema.json".into(),
                    reason: "primaryKeyIndex values must form a dense 0-based sequence".into(),
                });
            }
        }
        Ok(Schema { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Primary-key column names ordered by `primaryKeyIndex`.
    pub fn primary_key_names(&self) -> Vec<&str> {
        let mut pks: Vec<&SchemaEntry> = self.entries.iter().filter(|e| e.is_primary_key()).collect();
        pks.sort_by_key(|e| e.primary_key_index.unwrap());
        pks.into_iter().map(|e| e.name.as_str()).collect()
    }

    /// Non-primary-key column names in schema order.
    pub fn non_primary_key_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.is_primary_key())
            .map(|e| e.name.as_str())
            .collect()
    }

    /// First `geometry` entry, if any.
    pub fn primary_geometry(&self) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.data_type == DataType::Geometry)
    }

    /// Collapse the current ordering into an immutable [`Legend`].
    pub fn to_legend(&self) -> Legend {
        let primary_key_ids: Vec<String> = {
            let mut pks: Vec<&SchemaEntry> =
                self.entries.iter().filter(|e| e.is_primary_key()).collect();
            pks.sort_by_key(|e| e.primary_key_index.unwrap());
            pks.into_iter().map(|e| e.id.clone()).collect()
        };
        let non_primary_key_ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_primary_key())
            .map(|e| e.id.clone())
            .collect();
        Legend::from_ids(primary_key_ids, non_primary_key_ids)
    }

    /// Closed-world JSON-Schema projection (`spec.md` §4.1).
    pub fn to_json_schema(&self) -> Json {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for e in &self.entries {
            properties.insert(e.name.clone(), entry_json_schema(e));
            required.push(Json::String(e.name.clone()));
        }
        json!({
            "type": "object",
            "properties": Json::Object(properties),
            "required": required,
        })
    }
}

fn entry_json_schema(e: &SchemaEntry) -> Json {
    match e.data_type {
        DataType::Boolean => json!({"type": "boolean"}),
        DataType::Blob => json!({"type": "array", "items": {"type": "integer", "format": "bytes"}}),
        DataType::Date => json!({"type": "string", "format": "date"}),
        DataType::Time => json!({"type": "string", "format": "time"}),
        DataType::Timestamp => json!({"type": "string", "format": "date-time"}),
        DataType::Interval => json!({"type": "string", "format": "duration"}),
        DataType::Float => {
            let size = e.size.unwrap_or(64);
            let (min, max) = if size == 32 {
                (f64::from(f32::MIN), f64::from(f32::MAX))
            } else {
                (f64::MIN, f64::MAX)
            };
            json!({"type": "number", "minimum": min, "maximum": max})
        }
        DataType::Integer => {
            let size = e.size.unwrap_or(64);
            let (min, max): (i128, i128) = match size {
                8 => (i8::MIN as i128, i8::MAX as i128),
                16 => (i16::MIN as i128, i16::MAX as i128),
                32 => (i32::MIN as i128, i32::MAX as i128),
                _ => (i64::MIN as i128, i64::MAX as i128),
            };
            json!({"type": "integer", "minimum": min as f64, "maximum": max as f64})
        }
        DataType::Numeric => {
            json!({
                "type": "string",
                "pattern": r"^-?\d+(\.\d+)?$",
                "precision": e.precision,
                "scale": e.scale,
            })
        }
        DataType::Text => {
            if let Some(len) = e.length {
                json!({"type": "string", "maxLength": len})
            } else {
                json!({"type": "string"})
            }
        }
        DataType::Geometry => json!({"$ref": "#/definitions/Geometry"}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"[
            {"id":"c_id","name":"id","dataType":"integer","size":64,"primaryKeyIndex":0},
            {"id":"c_name","name":"name","dataType":"text"}
        ]"#
    }

    #[test]
    fn parses_and_derives_pk_ordering() {
        let schema = Schema::parse(sample()).unwrap();
        assert_eq!(schema.primary_key_names(), vec!["id"]);
        assert_eq!(schema.non_primary_key_names(), vec!["name"]);
    }

    #[test]
    fn rejects_non_dense_primary_key_indices() {
        let bad = r#"[
            {"id":"a","name":"a","dataType":"integer","size":64,"primaryKeyIndex":1}
        ]"#;
        assert!(Schema::parse(bad).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let bad = r#"[
            {"id":"a","name":"a","dataType":"text"},
            {"id":"a","name":"b","dataType":"text"}
        ]"#;
        assert!(Schema::parse(bad).is_err());
    }

    #[test]
    fn json_schema_projects_text_length() {
        let s = Schema::parse(
            r#"[{"id":"a","name":"a","dataType":"text","length":5,"primaryKeyIndex":0}]"#,
        )
        .unwrap();
        let js = s.to_json_schema();
        assert_eq!(js["properties"]["a"]["maxLength"], 5);
    }
}

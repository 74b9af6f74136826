//! RawFeature: a single on-disk row, decoded but not yet projected through
//! the current schema (`spec.md` §3, §4.4).
use std::collections::HashMap;

use crate::crs::{CrsRegistry, DEFAULT_CRS};
use crate::error::{DatasetError, Result};
use crate::legend::Legend;
use crate::msgpack;
use crate::path_structure::PathStructure;
use crate::schema::Schema;
use crate::value::Value;

/// A row as read straight off disk: key tuple, value tuple, and the legend
/// id it was authored under (`spec.md` §3).
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    pub legend_id: String,
    pub primary_keys: Vec<Value>,
    pub non_primary_key_values: Vec<Value>,
}

/// The result of projecting a [`RawFeature`] through the current
/// Schema+Legend+CRS (`spec.md` §3 `Feature`, §4.4).
#[derive(Debug, Clone)]
pub struct ProjectedFeature {
    pub ids: HashMap<String, Value>,
    pub properties: HashMap<String, Value>,
    pub geometry_column: Option<String>,
    pub crs: Option<String>,
    pub dropped_keys: Vec<String>,
    pub eid: String,
}

impl RawFeature {
    /// Decode a row: `filename_stem` is the (already base64-decoded-by-caller)
    /// primary-key tuple source, `body` is the file contents.
    pub fn decode(filename_stem: &str, body: &[u8]) -> Result<RawFeature> {
        let primary_keys = msgpack::decode_pk_tuple(filename_stem)?;
        let (legend_id, non_primary_key_values) = msgpack::decode_body(body)?;
        Ok(RawFeature {
            legend_id,
            primary_keys,
            non_primary_key_values,
        })
    }

    /// Project this row onto the current schema (`spec.md` §4.4 steps 1-6).
    pub fn to_object(
        &self,
        legends: &HashMap<String, Legend>,
        schema: &Schema,
        path_structure: &PathStructure,
        crss: &CrsRegistry,
    ) -> Result<ProjectedFeature> {
        let legend = legends.get(&self.legend_id).ok_or_else(|| {
            DatasetError::InconsistentState(format!("unknown legend id `{}`", self.legend_id))
        })?;

        // Step 1: columnId -> raw value, using legend ordering.
        let mut raw: HashMap<String, Value> = HashMap::new();
        for col in legend.column_ids() {
            let value = if col.is_primary {
                self.primary_keys.get(col.data_index).cloned()
            } else {
                self.non_primary_key_values.get(col.data_index).cloned()
            };
            if let Some(v) = value {
                raw.insert(col.column_id, v);
            }
        }

        // Step 2: current-schema primary keys, in primaryKeyIndex order.
        let mut ids = HashMap::new();
        for name in schema.primary_key_names() {
            let entry = schema.get(name).expect("name came from schema");
            let value = raw.get(&entry.id).cloned().unwrap_or(Value::Null);
            ids.insert(name.to_string(), value);
        }

        // Step 3: current-schema non-primary keys.
        let mut properties = HashMap::new();
        for name in schema.non_primary_key_names() {
            let entry = schema.get(name).expect("name came from schema");
            let value = raw.get(&entry.id).cloned().unwrap_or(Value::Null);
            properties.insert(name.to_string(), value);
        }

        // Step 4: dropped keys = legend columns absent from the current schema.
        let dropped_keys: Vec<String> = legend
            .column_ids()
            .filter(|col| schema.get_by_id(&col.column_id).is_none())
            .map(|col| col.column_id)
            .collect();

        // Step 5: geometry column + CRS fallback/lookup.
        let geometry_entry = schema.primary_geometry();
        let geometry_column = geometry_entry.map(|e| e.name.clone());
        let crs = geometry_entry.map(|e| {
            let identifier = e.geometry_crs.clone().unwrap_or_else(|| DEFAULT_CRS.to_string());
            if crss.contains(&identifier) || identifier == DEFAULT_CRS {
                Some(identifier)
            } else {
                None
            }
        });
        let crs = crs.flatten();

        // Step 6: encoded ID from the projected ids, in primary-key order.
        let pk_values: Vec<Value> = schema
            .primary_key_names()
            .iter()
            .map(|name| ids.get(*name).cloned().unwrap_or(Value::Null))
            .collect();
        let eid = path_structure.eid(&pk_values)?;

        Ok(ProjectedFeature {
            ids,
            properties,
            geometry_column,
            crs,
            dropped_keys,
            eid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_structure::{Encoding, Scheme};
    use crate::schema::SchemaEntry;
    use num_bigint::BigInt;

    fn schema_with(entries: Vec<SchemaEntry>) -> Schema {
        Schema::from_entries(entries).unwrap()
    }

    #[test]
    fn worked_example_3_schema_evolution() {
        let legend = Legend::from_ids(vec!["id".into()], vec!["name".into(), "age".into()]);
        let mut legends = HashMap::new();
        legends.insert(legend.id().to_string(), legend.clone());

        let schema = schema_with(vec![
            SchemaEntry {
                id: "id".into(),
                name: "id".into(),
                data_type: DataType::Integer,
                primary_key_index: Some(0),
                size: Some(64),
                length: None,
                precision: None,
                scale: None,
                timezone: None,
                geometry_type: None,
                geometry_crs: None,
            },
            SchemaEntry {
                id: "name".into(),
                name: "name".into(),
                data_type: DataType::Text,
                primary_key_index: None,
                size: None,
                length: None,
                precision: None,
                scale: None,
                timezone: None,
                geometry_type: None,
                geometry_crs: None,
            },
            SchemaEntry {
                id: "birth_year".into(),
                name: "birth_year".into(),
                data_type: DataType::Integer,
                primary_key_index: None,
                size: Some(64),
                length: None,
                precision: None,
                scale: None,
                timezone: None,
                geometry_type: None,
                geometry_crs: None,
            },
        ]);

        let path_structure = PathStructure {
            scheme: Scheme::Int,
            branches: 16,
            levels: 2,
            encoding: Encoding::Hex,
        };
        let crss = CrsRegistry::new();

        let raw = RawFeature {
            legend_id: legend.id().to_string(),
            primary_keys: vec![Value::Integer(BigInt::from(1))],
            non_primary_key_values: vec![Value::Text("Alice".into()), Value::Integer(BigInt::from(42))],
        };

        let projected = raw.to_object(&legends, &schema, &path_structure, &crss).unwrap();
        assert_eq!(projected.ids.get("id"), Some(&Value::Integer(BigInt::from(1))));
        assert_eq!(projected.properties.get("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(projected.properties.get("birth_year"), Some(&Value::Null));
        assert_eq!(projected.dropped_keys, vec!["age".to_string()]);
    }

    #[test]
    fn crs_fallback_to_default() {
        let legend = Legend::from_ids(vec!["id".into()], vec![]);
        let mut legends = HashMap::new();
        legends.insert(legend.id().to_string(), legend.clone());
        let schema = schema_with(vec![
            SchemaEntry {
                id: "id".into(),
                name: "id".into(),
                data_type: DataType::Integer,
                primary_key_index: Some(0),
                size: Some(64),
                length: None,
                precision: None,
                scale: None,
                timezone: None,
                geometry_type: None,
                geometry_crs: None,
            },
            SchemaEntry {
                id: "geom".into(),
                name: "geom".into(),
                data_type: DataType::Geometry,
                primary_key_index: None,
                size: None,
                length: None,
                precision: None,
                scale: None,
                timezone: None,
                geometry_type: Some("POINT".into()),
                geometry_crs: None,
            },
        ]);
        let path_structure = PathStructure {
            scheme: Scheme::Int,
            branches: 16,
            levels: 1,
            encoding: Encoding::Hex,
        };
        let crss = CrsRegistry::new();
        let raw = RawFeature {
            legend_id: legend.id().to_string(),
            primary_keys: vec![Value::Integer(BigInt::from(1))],
            non_primary_key_values: vec![],
        };
        let projected = raw.to_object(&legends, &schema, &path_structure, &crss).unwrap();
        assert_eq!(projected.crs.as_deref(), Some(DEFAULT_CRS));
    }
}

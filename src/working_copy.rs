//! WorkingFeatureCollection: an in-memory change tracker over a
//! [`TableDatasetV3`] baseline (`spec.md` §3, §4.7).
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::{json, Map as JsonMap, Value as Json};

use crate::dataset::TableDatasetV3;
use crate::error::{DatasetError, Result};
use crate::events::{EventBus, FeatureEvent};
use crate::feature::{CrsReprojector, Feature};
use crate::geometry::geometry_type_name;
use crate::serializer::kart_wire_json;
use crate::value::Value;

/// Owned row data, independent of any borrowed `Schema` reference — the
/// representation a change tracker stores for inserted/baseline-merged rows
/// (`spec.md` §3 `Feature`, scoped down to the two maps the tracker needs).
#[derive(Debug, Clone, Default)]
pub struct OwnedFeatureData {
    pub ids: HashMap<String, Value>,
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
enum TrackedChange {
    Delete,
    Insert(OwnedFeatureData),
    Update {
        properties: HashMap<String, Option<Value>>,
        geometry: Option<Value>,
    },
}

/// Change tracker over a dataset baseline (`spec.md` §3 `WorkingFeatureCollection`).
/// Never mutates the baseline; at most one tracked entry per encoded ID.
pub struct WorkingFeatureCollection {
    dataset: Arc<TableDatasetV3>,
    tracker: Mutex<HashMap<String, TrackedChange>>,
    events: Arc<EventBus>,
    dominant_geometry_type: Mutex<Option<&'static str>>,
}

impl WorkingFeatureCollection {
    pub fn new(dataset: Arc<TableDatasetV3>) -> WorkingFeatureCollection {
        let dominant = dataset
            .schema
            .primary_geometry()
            .and_then(|e| e.geometry_type.as_deref())
            .and_then(concrete_geometry_type);
        WorkingFeatureCollection {
            dataset,
            tracker: Mutex::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            dominant_geometry_type: Mutex::new(dominant),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn tracked_clone(&self, eid: &str) -> Option<TrackedChange> {
        self.tracker.lock().unwrap().get(eid).cloned()
    }

    async fn load_baseline(&self, eid: &str) -> Result<Option<OwnedFeatureData>> {
        match self.dataset.get(eid).await {
            Ok(feature) => Ok(Some(OwnedFeatureData {
                ids: feature.ids.clone(),
                properties: feature.properties.clone(),
            })),
            Err(DatasetError::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn geometry_column(&self) -> Option<String> {
        self.dataset.schema.primary_geometry().map(|e| e.name.clone())
    }

    fn validate_against_schema(&self, data: &OwnedFeatureData) -> Result<()> {
        let feature = Feature::from_projected(
            crate::raw_feature::ProjectedFeature {
                ids: data.ids.clone(),
                properties: data.properties.clone(),
                geometry_column: self.geometry_column(),
                crs: None,
                dropped_keys: Vec::new(),
                eid: String::new(),
            },
            &self.dataset.schema,
        );
        feature.validate()?;
        Ok(())
    }

    /// `has(eid)` (`spec.md` §4.7).
    pub async fn has(&self, eid: &str) -> Result<bool> {
        match self.tracked_clone(eid) {
            Some(TrackedChange::Delete) => Ok(false),
            Some(_) => Ok(true),
            None => self.dataset.has(eid).await,
        }
    }

    /// `get(eid)` (`spec.md` §4.7): overlay tracker on baseline.
    pub async fn get(&self, eid: &str) -> Result<Option<OwnedFeatureData>> {
        match self.tracked_clone(eid) {
            Some(TrackedChange::Delete) => Ok(None),
            Some(TrackedChange::Insert(data)) => {
                self.validate_against_schema(&data)?;
                Ok(Some(data))
            }
            Some(TrackedChange::Update { properties, geometry }) => {
                let Some(mut base) = self.load_baseline(eid).await? else {
                    return Err(DatasetError::InconsistentState(format!(
                        "update tracked for eid `{eid}` with no baseline row"
                    )));
                };
                for (key, value) in &properties {
                    match value {
                        Some(v) => {
                            base.properties.insert(key.clone(), v.clone());
                        }
                        None => {
                            base.properties.remove(key);
                        }
                    }
                }
                if let (Some(geom_col), Some(geom)) = (self.geometry_column(), geometry) {
                    base.properties.insert(geom_col, geom.clone());
                }
                self.validate_against_schema(&base)?;
                Ok(Some(base))
            }
            None => self.load_baseline(eid).await,
        }
    }

    /// `add(feature)` (`spec.md` §4.7).
    pub async fn add(&self, feature: OwnedFeatureData) -> Result<String> {
        let pk_values: Vec<Value> = self
            .dataset
            .schema
            .primary_key_names()
            .iter()
            .map(|name| feature.ids.get(*name).cloned().unwrap_or(Value::Null))
            .collect();
        let eid = self.dataset.path_structure.eid(&pk_values)?;

        if self.has(&eid).await? {
            return Err(DatasetError::InconsistentState(format!(
                "eid `{eid}` already present"
            )));
        }

        if let Some(geom_col) = self.geometry_column() {
            if let Some(Value::Geometry(g)) = feature.properties.get(&geom_col) {
                self.check_dominant_geometry_type(&g.value)?;
            }
        }
        self.validate_against_schema(&feature)?;

        self.tracker
            .lock()
            .unwrap()
            .insert(eid.clone(), TrackedChange::Insert(feature));
        debug!("working copy: tracked insert for eid `{eid}`");
        self.events.publish(FeatureEvent::Added { eid: eid.clone() });
        Ok(eid)
    }

    fn check_dominant_geometry_type(&self, value: &geojson::Value) -> Result<()> {
        let type_name = geometry_type_name(value);
        if type_name == "GeometryCollection" {
            return Err(DatasetError::Unsupported(
                "GeometryCollection is not a valid feature geometry type".into(),
            ));
        }
        let mut dominant = self.dominant_geometry_type.lock().unwrap();
        match *dominant {
            None => {
                *dominant = Some(type_name);
                Ok(())
            }
            Some(expected) if expected == type_name => Ok(()),
            Some(expected) => Err(DatasetError::Unsupported(format!(
                "geometry type `{type_name}` does not match the collection's dominant type `{expected}`"
            ))),
        }
    }

    /// `delete(eid)` (`spec.md` §4.7).
    pub async fn delete(&self, eid: &str) -> Result<()> {
        let current = self.tracked_clone(eid);
        match current {
            Some(TrackedChange::Insert(_)) => {
                self.tracker.lock().unwrap().remove(eid);
            }
            Some(TrackedChange::Delete) => {
                return Err(DatasetError::InconsistentState(format!(
                    "eid `{eid}` is already deleted"
                )))
            }
            _ => {
                if !self.dataset.has(eid).await? {
                    return Err(DatasetError::InconsistentState(format!(
                        "delete of absent eid `{eid}`"
                    )));
                }
                self.tracker.lock().unwrap().insert(eid.to_string(), TrackedChange::Delete);
            }
        }
        debug!("working copy: tracked delete for eid `{eid}`");
        self.events.publish(FeatureEvent::Deleted { eid: eid.to_string() });
        Ok(())
    }

    /// `updateProperties(eid, props, merge=true)` (`spec.md` §4.7).
    pub async fn update_properties(
        &self,
        eid: &str,
        props: HashMap<String, Option<Value>>,
        merge: bool,
    ) -> Result<()> {
        // `has()` accounts for a tracked delete/insert; `load_baseline()` never
        // does, so check existence through `has()` first and only then pull
        // the true committed row (not `self.get(eid)`, which would return the
        // current overlay when an `Update` is already tracked, making a
        // revert to the original value look like a change).
        if !self.has(eid).await? {
            return Err(DatasetError::InconsistentState(format!("update of absent eid `{eid}`")));
        }
        let baseline = self
            .load_baseline(eid)
            .await?
            .ok_or_else(|| DatasetError::InconsistentState(format!("update of absent eid `{eid}`")))?;

        let mut overlay: HashMap<String, Option<Value>> = if merge {
            self.existing_property_overlay(eid)
        } else {
            baseline
                .properties
                .keys()
                .map(|k| (k.clone(), None))
                .collect()
        };

        for (key, value) in props {
            overlay.insert(key, value);
        }

        // Strip keys that equal the baseline value, and keys the baseline never had when set to None.
        overlay.retain(|key, value| match value {
            Some(v) => baseline.properties.get(key) != Some(v),
            None => baseline.properties.contains_key(key),
        });

        let geometry = self.existing_geometry_overlay(eid);
        if overlay.is_empty() && geometry.is_none() {
            // Net no-op against the baseline (e.g. reverting a prior update) —
            // drop any stale tracked entry rather than leaving it in place.
            self.tracker.lock().unwrap().remove(eid);
            return Ok(());
        }

        self.tracker.lock().unwrap().insert(
            eid.to_string(),
            TrackedChange::Update {
                properties: overlay,
                geometry,
            },
        );
        debug!("working copy: tracked property update for eid `{eid}`");
        self.events.publish(FeatureEvent::Updated { eid: eid.to_string() });
        Ok(())
    }

    fn existing_property_overlay(&self, eid: &str) -> HashMap<String, Option<Value>> {
        match self.tracked_clone(eid) {
            Some(TrackedChange::Update { properties, .. }) => properties,
            _ => HashMap::new(),
        }
    }

    fn existing_geometry_overlay(&self, eid: &str) -> Option<Value> {
        match self.tracked_clone(eid) {
            Some(TrackedChange::Update { geometry, .. }) => geometry,
            _ => None,
        }
    }

    /// `updateGeometry(eid, geom)` (`spec.md` §4.7).
    pub async fn update_geometry(&self, eid: &str, geometry: geojson::Geometry) -> Result<()> {
        let baseline = self
            .get(eid)
            .await?
            .ok_or_else(|| DatasetError::InconsistentState(format!("update of absent eid `{eid}`")))?;
        let Some(geom_col) = self.geometry_column() else {
            return Err(DatasetError::Unsupported(
                "dataset has no geometry column".into(),
            ));
        };
        if let Some(Value::Geometry(existing)) = baseline.properties.get(&geom_col) {
            if geometry_type_name(&existing.value) != geometry_type_name(&geometry.value) {
                return Err(DatasetError::InvalidValue {
                    column: geom_col,
                    reason: "updateGeometry must not change the feature's geometry type".into(),
                });
            }
        }

        let properties = self.existing_property_overlay(eid);
        self.tracker.lock().unwrap().insert(
            eid.to_string(),
            TrackedChange::Update {
                properties,
                geometry: Some(Value::Geometry(Box::new(geometry))),
            },
        );
        debug!("working copy: tracked geometry update for eid `{eid}`");
        self.events.publish(FeatureEvent::Updated { eid: eid.to_string() });
        Ok(())
    }

    /// `toGeoJSON()` (`spec.md` §4.7): clone the baseline, apply tracked
    /// changes in order, return an owned (i.e. immutable-to-the-collection)
    /// `FeatureCollection`.
    pub async fn to_geojson(&self, reprojector: &dyn CrsReprojector) -> Result<Json> {
        let baseline = self.dataset.to_geojson(reprojector).await?;
        let mut features: Vec<Json> = baseline
            .get("features")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        let mut index: HashMap<String, usize> = features
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.get("id").and_then(Json::as_str).map(|id| (id.to_string(), i)))
            .collect();

        let tracker = self.tracker.lock().unwrap().clone();
        for (eid, change) in tracker {
            match change {
                TrackedChange::Delete => {
                    let Some(&i) = index.get(&eid) else {
                        return Err(DatasetError::InconsistentState(format!(
                            "deleting absent eid `{eid}` from the materialized view"
                        )));
                    };
                    features.remove(i);
                    index = reindex(&features);
                }
                TrackedChange::Insert(data) => {
                    let feature = Feature::from_projected(
                        crate::raw_feature::ProjectedFeature {
                            ids: data.ids.clone(),
                            properties: data.properties.clone(),
                            geometry_column: self.geometry_column(),
                            crs: None,
                            dropped_keys: Vec::new(),
                            eid: eid.clone(),
                        },
                        &self.dataset.schema,
                    );
                    if let Some(json_feature) = feature.to_geojson(reprojector)? {
                        features.push(json_feature);
                        index.insert(eid.clone(), features.len() - 1);
                    }
                }
                TrackedChange::Update { properties, geometry } => {
                    let Some(&i) = index.get(&eid) else {
                        return Err(DatasetError::InconsistentState(format!(
                            "updating absent eid `{eid}` in the materialized view"
                        )));
                    };
                    let obj = features[i]
                        .as_object_mut()
                        .and_then(|o| o.get_mut("properties"))
                        .and_then(Json::as_object_mut);
                    if let Some(obj) = obj {
                        for (key, value) in &properties {
                            match value {
                                Some(v) => {
                                    obj.insert(key.clone(), crate::serializer::canonical_json(v));
                                }
                                None => {
                                    obj.remove(key);
                                }
                            }
                        }
                    }
                    if let Some(Value::Geometry(g)) = geometry {
                        if let Some(map) = features[i].as_object_mut() {
                            map.insert("geometry".to_string(), serde_json::to_value(&g.value)?);
                        }
                    }
                }
            }
        }

        Ok(json!({ "type": "FeatureCollection", "features": features }))
    }

    /// `diff()` (`spec.md` §4.7): canonical `kart.diff/v1+hexwkb` document.
    pub async fn diff(&self) -> Result<Json> {
        let mut feature_changes = Vec::new();
        let tracker = self.tracker.lock().unwrap().clone();
        let pk_names = self.dataset.schema.primary_key_names();
        let geom_col = self.geometry_column();

        for (eid, change) in tracker {
            match change {
                TrackedChange::Delete => {
                    let baseline = self.load_baseline(&eid).await?.ok_or_else(|| {
                        DatasetError::InconsistentState(format!("diff: delete of absent eid `{eid}`"))
                    })?;
                    let mut obj = JsonMap::new();
                    for name in &pk_names {
                        let v = baseline.ids.get(*name).cloned().unwrap_or(Value::Null);
                        obj.insert((*name).to_string(), kart_wire_json(&v)?);
                    }
                    feature_changes.push(json!({ "--": obj }));
                }
                TrackedChange::Insert(data) => {
                    let mut obj = JsonMap::new();
                    for name in &pk_names {
                        let v = data.ids.get(*name).cloned().unwrap_or(Value::Null);
                        obj.insert((*name).to_string(), kart_wire_json(&v)?);
                    }
                    if let Some(col) = &geom_col {
                        if let Some(v) = data.properties.get(col) {
                            obj.insert(col.clone(), kart_wire_json(v)?);
                        }
                    }
                    for (name, value) in &data.properties {
                        if !obj.contains_key(name) {
                            obj.insert(name.clone(), kart_wire_json(value)?);
                        }
                    }
                    feature_changes.push(json!({ "++": obj }));
                }
                TrackedChange::Update { properties, geometry } => {
                    let baseline = self.load_baseline(&eid).await?.ok_or_else(|| {
                        DatasetError::InconsistentState(format!("diff: update of absent eid `{eid}`"))
                    })?;
                    let mut obj = JsonMap::new();
                    for name in &pk_names {
                        let v = baseline.ids.get(*name).cloned().unwrap_or(Value::Null);
                        obj.insert((*name).to_string(), kart_wire_json(&v)?);
                    }
                    if let (Some(col), Some(geom)) = (&geom_col, &geometry) {
                        obj.insert(col.clone(), kart_wire_json(geom)?);
                    }
                    for (name, value) in &properties {
                        if let Some(v) = value {
                            obj.insert(name.clone(), kart_wire_json(v)?);
                        }
                    }
                    feature_changes.push(json!({ "+": obj }));
                }
            }
        }

        let mut datasets = JsonMap::new();
        if !feature_changes.is_empty() {
            datasets.insert(self.dataset.id.clone(), json!({ "feature": feature_changes }));
        }
        Ok(json!({
            "kart.patch/v1": { "base": Json::Null, "crs": crate::crs::DEFAULT_CRS },
            "kart.diff/v1+hexwkb": Json::Object(datasets),
        }))
    }
}

fn reindex(features: &[Json]) -> HashMap<String, usize> {
    features
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.get("id").and_then(Json::as_str).map(|id| (id.to_string(), i)))
        .collect()
}

fn concrete_geometry_type(geometry_type: &str) -> Option<&'static str> {
    let base = geometry_type
        .trim_end_matches("ZM")
        .trim_end_matches('Z')
        .trim_end_matches('M');
    match base.to_ascii_uppercase().as_str() {
        "POINT" => Some("Point"),
        "LINESTRING" => Some("LineString"),
        "POLYGON" => Some("Polygon"),
        "MULTIPOINT" => Some("MultiPoint"),
        "MULTILINESTRING" => Some("MultiLineString"),
        "MULTIPOLYGON" => Some("MultiPolygon"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    use crate::fs::LocalDatasetStore;
    use crate::legend::Legend;
    use crate::path_structure::{Encoding, PathStructure, Scheme};

    const SCHEMA: &str = r#"[
        {"id":"c_id","name":"id","dataType":"integer","size":64,"primaryKeyIndex":0},
        {"id":"c_name","name":"name","dataType":"text"}
    ]"#;

    async fn write(root: &std::path::Path, rel: &str, contents: &[u8]) {
        let full = root.join(rel);
        tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
        tokio::fs::write(full, contents).await.unwrap();
    }

    async fn seed_one_row(root: &std::path::Path) {
        let ps = PathStructure {
            scheme: Scheme::Int,
            branches: 16,
            levels: 1,
            encoding: Encoding::Hex,
        };
        write(root, "people/.table-dataset/meta/title", b"People").await;
        write(root, "people/.table-dataset/meta/schema.json", SCHEMA.as_bytes()).await;
        write(
            root,
            "people/.table-dataset/meta/path-structure.json",
            serde_json::to_string(&ps).unwrap().as_bytes(),
        )
        .await;

        let legend = Legend::from_ids(vec!["c_id".into()], vec!["c_name".into()]);
        let legend_bytes =
            rmp_serde::to_vec(&(legend.primary_key_ids().to_vec(), legend.non_primary_key_ids().to_vec())).unwrap();
        write(root, &format!("people/.table-dataset/meta/legend/{}", legend.id()), &legend_bytes).await;

        let pk = vec![Value::Integer(BigInt::from(1))];
        let eid = ps.eid(&pk).unwrap();
        let values = vec![Value::Text("Alice".into())];
        let body = crate::msgpack::encode_body(legend.id(), &values).unwrap();
        write(root, &format!("people/.table-dataset/feature/{eid}"), &body).await;
    }

    async fn load_working_copy(root: &std::path::Path) -> (Arc<TableDatasetV3>, String) {
        let store: Arc<dyn crate::fs::DatasetStore> = Arc::new(LocalDatasetStore::new(root));
        let dataset = Arc::new(TableDatasetV3::load(store, "people").await.unwrap());
        let eid = dataset.path_structure.eid(&[Value::Integer(BigInt::from(1))]).unwrap();
        (dataset, eid)
    }

    #[tokio::test]
    async fn diff_on_untouched_working_copy_has_no_dataset_entries() {
        let dir = tempfile::tempdir().unwrap();
        seed_one_row(dir.path()).await;
        let (dataset, _eid) = load_working_copy(dir.path()).await;
        let wc = dataset.working_copy();

        let diff = wc.diff().await.unwrap();
        let datasets = diff["kart.diff/v1+hexwkb"].as_object().unwrap();
        assert!(datasets.is_empty());
    }

    #[tokio::test]
    async fn reverting_a_property_update_to_the_baseline_value_drops_the_tracked_change() {
        let dir = tempfile::tempdir().unwrap();
        seed_one_row(dir.path()).await;
        let (dataset, eid) = load_working_copy(dir.path()).await;
        let wc = dataset.working_copy();

        let mut to_bob = HashMap::new();
        to_bob.insert("name".to_string(), Some(Value::Text("Bob".into())));
        wc.update_properties(&eid, to_bob, true).await.unwrap();

        let mut back_to_alice = HashMap::new();
        back_to_alice.insert("name".to_string(), Some(Value::Text("Alice".into())));
        wc.update_properties(&eid, back_to_alice, true).await.unwrap();

        let diff = wc.diff().await.unwrap();
        let datasets = diff["kart.diff/v1+hexwkb"].as_object().unwrap();
        assert!(datasets.is_empty(), "reverted update should not appear in the diff");
    }
}

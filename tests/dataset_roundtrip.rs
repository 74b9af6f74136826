//! End-to-end coverage over a real on-disk `.table-dataset/` fixture:
//! load, random access, spatial selection, GeoJSON materialization, the
//! working copy's add/update/delete tracking, and diff synthesis
//! (`spec.md` §8).
use std::path::Path;
use std::sync::Arc;

use num_bigint::BigInt;
use table_dataset::fs::{DatasetStore, LocalDatasetStore};
use table_dataset::legend;
use table_dataset::msgpack;
use table_dataset::path_structure::{Encoding, PathStructure, Scheme};
use table_dataset::repository::Repository;
use table_dataset::value::Value;
use table_dataset::{OwnedFeatureData, TableDatasetV3};

const PEOPLE_SCHEMA: &str = r#"[
    {"id":"c_id","name":"id","dataType":"integer","size":64,"primaryKeyIndex":0},
    {"id":"c_name","name":"name","dataType":"text"},
    {"id":"c_geom","name":"geom","dataType":"geometry","geometryType":"POINT"}
]"#;

async fn write(root: &Path, rel: &str, contents: &[u8]) {
    let full = root.join(rel);
    tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
    tokio::fs::write(full, contents).await.unwrap();
}

fn path_structure() -> PathStructure {
    PathStructure {
        scheme: Scheme::Int,
        branches: 16,
        levels: 1,
        encoding: Encoding::Hex,
    }
}

async fn seed_dataset(root: &Path, name: &str) -> String {
    let ps = path_structure();
    write(root, &format!("{name}/.table-dataset/meta/title"), b"People").await;
    write(root, &format!("{name}/.table-dataset/meta/schema.json"), PEOPLE_SCHEMA.as_bytes()).await;
    write(
        root,
        &format!("{name}/.table-dataset/meta/path-structure.json"),
        serde_json::to_string(&ps).unwrap().as_bytes(),
    )
    .await;

    let legend = legend::Legend::from_ids(vec!["c_id".into()], vec!["c_name".into(), "c_geom".into()]);
    let legend_bytes = rmp_serde::to_vec(&(legend.primary_key_ids().to_vec(), legend.non_primary_key_ids().to_vec())).unwrap();
    write(
        root,
        &format!("{name}/.table-dataset/meta/legend/{}", legend.id()),
        &legend_bytes,
    )
    .await;

    for (id, person_name, point) in [(1i64, "Alice", [10.0, 20.0]), (2i64, "Bob", [-5.0, 5.0])] {
        let pk = vec![Value::Integer(BigInt::from(id))];
        let eid = ps.eid(&pk).unwrap();
        let geom = geojson::Geometry::new(geojson::Value::Point(point.to_vec()));
        let values = vec![Value::Text(person_name.to_string()), Value::Geometry(Box::new(geom))];
        let body = msgpack::encode_body(legend.id(), &values).unwrap();
        write(root, &format!("{name}/.table-dataset/feature/{eid}"), &body).await;
    }

    legend.id().to_string()
}

#[tokio::test]
async fn loads_and_projects_features() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_dataset(root, "people").await;

    let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
    let dataset = TableDatasetV3::load(store, "people").await.unwrap();
    assert_eq!(dataset.feature_count, 2);

    let alice_eid = dataset.path_structure.eid(&[Value::Integer(BigInt::from(1))]).unwrap();
    assert!(dataset.has(&alice_eid).await.unwrap());
    let alice = dataset.get(&alice_eid).await.unwrap();
    assert_eq!(alice.properties.get("name"), Some(&Value::Text("Alice".into())));

    let collection = dataset.to_geojson(&table_dataset::IdentityReprojector).await.unwrap();
    let features = collection["features"].as_array().unwrap();
    assert_eq!(features.len(), 2);
}

#[tokio::test]
async fn spatial_selection_returns_intersecting_features_only() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_dataset(root, "people").await;

    let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
    let dataset = TableDatasetV3::load(store, "people").await.unwrap();

    let hits = dataset.select_intersection([0.0, 0.0, 50.0, 50.0]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].properties.get("name"), Some(&Value::Text("Alice".into())));
}

#[tokio::test]
async fn working_copy_tracks_add_update_delete_and_synthesizes_diff() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_dataset(root, "people").await;

    let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
    let dataset = Arc::new(TableDatasetV3::load(store, "people").await.unwrap());
    let wc = dataset.clone().working_copy();

    let bob_eid = dataset.path_structure.eid(&[Value::Integer(BigInt::from(2))]).unwrap();
    wc.delete(&bob_eid).await.unwrap();
    assert!(!wc.has(&bob_eid).await.unwrap());

    let alice_eid = dataset.path_structure.eid(&[Value::Integer(BigInt::from(1))]).unwrap();
    let mut props = std::collections::HashMap::new();
    props.insert("name".to_string(), Some(Value::Text("Alicia".into())));
    wc.update_properties(&alice_eid, props, true).await.unwrap();
    let alicia = wc.get(&alice_eid).await.unwrap().unwrap();
    assert_eq!(alicia.properties.get("name"), Some(&Value::Text("Alicia".into())));

    let mut new_ids = std::collections::HashMap::new();
    new_ids.insert("id".to_string(), Value::Integer(BigInt::from(3)));
    let mut new_props = std::collections::HashMap::new();
    new_props.insert("name".to_string(), Value::Text("Carol".into()));
    new_props.insert(
        "geom".to_string(),
        Value::Geometry(Box::new(geojson::Geometry::new(geojson::Value::Point(vec![1.0, 1.0])))),
    );
    let carol_eid = wc
        .add(OwnedFeatureData {
            ids: new_ids,
            properties: new_props,
        })
        .await
        .unwrap();
    assert!(wc.has(&carol_eid).await.unwrap());

    let diff = wc.diff().await.unwrap();
    let dataset_diff = &diff["kart.diff/v1+hexwkb"]["people"]["feature"];
    let changes = dataset_diff.as_array().unwrap();
    assert_eq!(changes.len(), 3);
    let has_delete = changes.iter().any(|c| c.get("--").is_some());
    let has_update = changes.iter().any(|c| c.get("+").is_some());
    let has_insert = changes.iter().any(|c| c.get("++").is_some());
    assert!(has_delete && has_update && has_insert);
}

#[tokio::test]
async fn repository_lists_and_loads_valid_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_dataset(root, "people").await;

    let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
    let repo = Repository::new(store);
    assert!(repo.has("people").await);
    assert_eq!(repo.dataset_names().await.unwrap(), vec!["people".to_string()]);

    let dataset = repo.get("people").await.unwrap();
    assert_eq!(dataset.feature_count, 2);
}

//! TableDatasetV3: dataset metadata loading, lazy feature enumeration,
//! random access, and spatial selection (`spec.md` §3, §4.6).
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde_json::{json, Value as Json};
use tokio::sync::RwLock;

use crate::crs::CrsRegistry;
use crate::error::{DatasetError, Result};
use crate::feature::{CrsReprojector, Feature};
use crate::fs::DatasetStore;
use crate::legend::Legend;
use crate::path_structure::PathStructure;
use crate::raw_feature::RawFeature;
use crate::schema::Schema;
use crate::working_copy::WorkingFeatureCollection;

const META_DIR: &str = ".table-dataset/meta";
const FEATURE_DIR: &str = ".table-dataset/feature";

#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedEid {
    row: usize,
    bbox: (f64, f64, f64, f64),
}

impl RTreeObject for IndexedEid {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.bbox.0, self.bbox.1], [self.bbox.2, self.bbox.3])
    }
}

/// A loaded, validated dataset: metadata + a lazy handle onto its feature
/// files (`spec.md` §3 `Dataset`).
pub struct TableDatasetV3 {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub schema: Schema,
    legends: HashMap<String, Legend>,
    pub path_structure: PathStructure,
    pub crss: CrsRegistry,
    /// Baseline statistic, not updated by the working copy (`spec.md` §9 Open Questions).
    pub feature_count: u64,
    store: Arc<dyn DatasetStore>,
    base_dir: PathBuf,
    spatial_index: RwLock<Option<(RTree<IndexedEid>, Vec<String>)>>,
    geojson_cache: RwLock<Option<Json>>,
}

impl TableDatasetV3 {
    /// `spec.md` §4.6 "Layout validation".
    pub async fn is_valid_dataset(store: &dyn DatasetStore, id: &str) -> bool {
        let base = PathBuf::from(id);
        let meta = base.join(META_DIR);
        let checks = [
            store.stat(&meta.join("title")).await,
            store.stat(&meta.join("schema.json")).await,
            store.stat(&meta.join("path-structure.json")).await,
        ];
        if checks.iter().any(|r| !matches!(r, Ok(true))) {
            return false;
        }
        matches!(store.list(&meta.join("legend")).await, Ok(entries) if !entries.is_empty())
    }

    /// `spec.md` §4.6 "Load".
    pub async fn load(store: Arc<dyn DatasetStore>, id: &str) -> Result<TableDatasetV3> {
        let base = PathBuf::from(id);
        let meta = base.join(META_DIR);

        debug!("loading dataset `{id}`: reading title");
        let title = read_utf8_trimmed(store.as_ref(), &meta.join("title")).await?;
        let description = match store.read(&meta.join("description")).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).trim().to_string()),
            Err(DatasetError::FileNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        debug!("loading dataset `{id}`: parsing path-structure.json");
        let ps_bytes = store.read(&meta.join("path-structure.json")).await?;
        let path_structure = PathStructure::parse(&String::from_utf8_lossy(&ps_bytes))?;

        debug!("loading dataset `{id}`: parsing schema.json");
        let schema_bytes = store.read(&meta.join("schema.json")).await?;
        let schema = Schema::parse(&String::from_utf8_lossy(&schema_bytes))?;

        debug!("loading dataset `{id}`: loading legends");
        let mut legends = HashMap::new();
        for entry in store.list(&meta.join("legend")).await? {
            if entry.is_dir {
                continue;
            }
            let bytes = store.read(&meta.join("legend").join(&entry.name)).await?;
            let legend = Legend::parse(&bytes, &entry.name)?;
            legends.insert(legend.id().to_string(), legend);
        }

        debug!("loading dataset `{id}`: loading CRS definitions");
        let mut crss = CrsRegistry::new();
        if let Ok(entries) = store.list(&meta.join("crs")).await {
            for entry in entries {
                if let Some(identifier) = entry.name.strip_suffix(".wkt") {
                    let bytes = store.read(&meta.join("crs").join(&entry.name)).await?;
                    crss.insert(identifier, String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }

        let feature_count = count_feature_files(store.as_ref(), &base.join(FEATURE_DIR), path_structure.levels).await?;

        Ok(TableDatasetV3 {
            id: id.to_string(),
            title,
            description,
            schema,
            legends,
            path_structure,
            crss,
            feature_count,
            store,
            base_dir: base,
            spatial_index: RwLock::new(None),
            geojson_cache: RwLock::new(None),
        })
    }

    fn feature_dir(&self) -> PathBuf {
        self.base_dir.join(FEATURE_DIR)
    }

    /// Lazy terminal-branch walk over every feature path (`spec.md` §4.6,
    /// §5: never loads more than one file's worth of data at a time).
    pub fn walk(&self) -> FeatureWalker<'_> {
        FeatureWalker::new(self.store.as_ref(), self.feature_dir(), self.path_structure.levels)
    }

    pub async fn has(&self, eid: &str) -> Result<bool> {
        self.store.stat(&self.feature_dir().join(eid)).await
    }

    pub async fn get_raw(&self, eid: &str) -> Result<RawFeature> {
        let path = self.feature_dir().join(eid);
        let bytes = self.store.read(&path).await?;
        let filename_stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DatasetError::InconsistentState(format!("eid `{eid}` has no filename")))?;
        RawFeature::decode(filename_stem, &bytes)
    }

    pub async fn get(&self, eid: &str) -> Result<Feature<'_>> {
        let raw = self.get_raw(eid).await?;
        let projected = raw.to_object(&self.legends, &self.schema, &self.path_structure, &self.crss)?;
        Ok(Feature::from_projected(projected, &self.schema))
    }

    /// `spec.md` §4.6 "Spatial selection".
    pub async fn select_intersection(&self, bbox: [f64; 4]) -> Result<Vec<Feature<'_>>> {
        self.ensure_spatial_index().await?;
        let guard = self.spatial_index.read().await;
        let (tree, eids) = guard.as_ref().expect("index just ensured");
        let query = AABB::from_corners([bbox[0], bbox[1]], [bbox[2], bbox[3]]);
        let rows: Vec<usize> = tree
            .locate_in_envelope_intersecting(&query)
            .map(|hit| hit.row)
            .collect();
        let eids: Vec<String> = rows.into_iter().map(|i| eids[i].clone()).collect();
        drop(guard);

        let mut out = Vec::with_capacity(eids.len());
        for eid in eids {
            out.push(self.get(&eid).await?);
        }
        Ok(out)
    }

    async fn ensure_spatial_index(&self) -> Result<()> {
        {
            let guard = self.spatial_index.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }
        let mut entries = Vec::new();
        let mut eids = Vec::new();
        let mut walker = self.walk();
        while let Some(path) = walker.next().await? {
            let eid = path
                .strip_prefix(&self.feature_dir())
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let feature = self.get(&eid).await?;
            let Some(geom_col) = feature.geometry_column.clone() else {
                continue;
            };
            let Ok(result) = feature.get_geometry(&geom_col) else {
                continue;
            };
            let Some(geom) = result.data else {
                continue;
            };
            let Some(bbox) = crate::geometry::bbox_of(&geom) else {
                continue;
            };
            entries.push(IndexedEid {
                row: eids.len(),
                bbox,
            });
            eids.push(eid);
        }
        let tree = RTree::bulk_load(entries);
        let mut guard = self.spatial_index.write().await;
        *guard = Some((tree, eids));
        Ok(())
    }

    /// `spec.md` §4.6 "GeoJSON materialization". Cached after first call;
    /// callers are warned this is memory-heavy for large datasets.
    pub async fn to_geojson(&self, reprojector: &dyn CrsReprojector) -> Result<Json> {
        {
            let guard = self.geojson_cache.read().await;
            if let Some(cached) = guard.as_ref() {
                return Ok(cached.clone());
            }
        }
        warn!(
            "materializing TableDatasetV3::to_geojson for `{}` ({} features) — memory-heavy for large datasets",
            self.id, self.feature_count
        );
        let mut features = Vec::new();
        let mut walker = self.walk();
        while let Some(path) = walker.next().await? {
            let eid = path
                .strip_prefix(&self.feature_dir())
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let feature = self.get(&eid).await?;
            if let Some(geojson_feature) = feature.to_geojson(reprojector)? {
                features.push(geojson_feature);
            }
        }
        let collection = json!({
            "type": "FeatureCollection",
            "features": features,
        });
        let mut guard = self.geojson_cache.write().await;
        *guard = Some(collection.clone());
        Ok(collection)
    }

    pub fn legends(&self) -> &HashMap<String, Legend> {
        &self.legends
    }

    /// Materialize the change tracker bound to this dataset (`spec.md` §3, §4.6 "Load").
    pub fn working_copy(self: Arc<Self>) -> WorkingFeatureCollection {
        WorkingFeatureCollection::new(self)
    }
}

async fn read_utf8_trimmed(store: &dyn DatasetStore, path: &Path) -> Result<String> {
    let bytes = store.read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

async fn count_feature_files(store: &dyn DatasetStore, feature_dir: &Path, levels: u32) -> Result<u64> {
    let mut walker = FeatureWalker::new(store, feature_dir.to_path_buf(), levels);
    let mut count = 0u64;
    while walker.next().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

struct Frame {
    dir: PathBuf,
    entries: VecDeque<crate::fs::DirEntry>,
    is_branch: bool,
    depth: u32,
}

/// Lazy, pull-based walker over feature paths (`spec.md` §4.6, §5:
/// "dropping the iterator is the cancellation signal").
pub struct FeatureWalker<'a> {
    store: &'a dyn DatasetStore,
    levels: u32,
    stack: Vec<Frame>,
    started: bool,
    root: PathBuf,
}

impl<'a> FeatureWalker<'a> {
    fn new(store: &'a dyn DatasetStore, root: PathBuf, levels: u32) -> FeatureWalker<'a> {
        FeatureWalker {
            store,
            levels,
            stack: Vec::new(),
            started: false,
            root,
        }
    }

    async fn push_dir(&mut self, dir: PathBuf, depth: u32) -> Result<()> {
        let entries: VecDeque<crate::fs::DirEntry> = self.store.list(&dir).await?.into();
        let is_branch = depth < self.levels && entries.front().map(|e| e.is_dir).unwrap_or(false);
        self.stack.push(Frame {
            dir,
            entries,
            is_branch,
            depth,
        });
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<PathBuf>> {
        if !self.started {
            self.started = true;
            let root = self.root.clone();
            self.push_dir(root, 0).await?;
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = frame.entries.pop_front() else {
                self.stack.pop();
                continue;
            };
            let is_branch = frame.is_branch;
            let dir = frame.dir.clone();
            let depth = frame.depth;
            if is_branch {
                self.push_dir(dir.join(&entry.name), depth + 1).await?;
            } else {
                return Ok(Some(dir.join(&entry.name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalDatasetStore;

    async fn write(root: &Path, rel: &str, contents: &[u8]) {
        let full = root.join(rel);
        tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
        tokio::fs::write(full, contents).await.unwrap();
    }

    #[tokio::test]
    async fn detects_valid_dataset_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "ds/.table-dataset/meta/title", b"My Dataset").await;
        write(root, "ds/.table-dataset/meta/schema.json", b"[]").await;
        write(root, "ds/.table-dataset/meta/path-structure.json", b"{}").await;
        write(root, "ds/.table-dataset/meta/legend/abc", b"x").await;

        let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
        assert!(TableDatasetV3::is_valid_dataset(store.as_ref(), "ds").await);
    }

    #[tokio::test]
    async fn missing_legend_dir_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "ds/.table-dataset/meta/title", b"x").await;
        write(root, "ds/.table-dataset/meta/schema.json", b"[]").await;
        write(root, "ds/.table-dataset/meta/path-structure.json", b"{}").await;

        let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
        assert!(!TableDatasetV3::is_valid_dataset(store.as_ref(), "ds").await);
    }
}

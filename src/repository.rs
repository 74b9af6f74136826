//! Repository: a Kart-style binding of a working-tree root to its valid
//! Table Dataset V3 datasets (`spec.md` §3, §4.8).
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde_json::{Map as JsonMap, Value as Json};
use tokio::sync::RwLock;

use crate::dataset::TableDatasetV3;
use crate::error::{DatasetError, Result};
use crate::fs::DatasetStore;
use crate::working_copy::WorkingFeatureCollection;

/// A cloned working-tree root, exposing only the dataset IDs that pass
/// [`TableDatasetV3::is_valid_dataset`] (`spec.md` §4.8).
pub struct Repository {
    store: Arc<dyn DatasetStore>,
    datasets: RwLock<HashMap<String, Arc<TableDatasetV3>>>,
}

impl Repository {
    pub fn new(store: Arc<dyn DatasetStore>) -> Repository {
        Repository {
            store,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// `data.has(name)` (`spec.md` §4.8).
    pub async fn has(&self, name: &str) -> bool {
        TableDatasetV3::is_valid_dataset(self.store.as_ref(), name).await
    }

    /// `data.get(name)` (`spec.md` §4.8): loads and caches on first access.
    pub async fn get(&self, name: &str) -> Result<Arc<TableDatasetV3>> {
        {
            let guard = self.datasets.read().await;
            if let Some(dataset) = guard.get(name) {
                return Ok(dataset.clone());
            }
        }
        if !self.has(name).await {
            return Err(DatasetError::InconsistentState(format!(
                "`{name}` is not a valid Table Dataset V3 layout"
            )));
        }
        debug!("repository: loading dataset `{name}`");
        let dataset = Arc::new(TableDatasetV3::load(self.store.clone(), name).await?);
        let mut guard = self.datasets.write().await;
        guard.insert(name.to_string(), dataset.clone());
        Ok(dataset)
    }

    /// Names of every top-level directory that is a valid dataset
    /// (`spec.md` §4.8 "iteration over all valid dataset names").
    pub async fn dataset_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.store.list(std::path::Path::new(".")).await? {
            if entry.is_dir && self.has(&entry.name).await {
                names.push(entry.name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn working_copy(&self, name: &str) -> Result<WorkingFeatureCollection> {
        let dataset = self.get(name).await?;
        Ok(dataset.working_copy())
    }

    /// `diff.toDiff()` (`spec.md` §4.8): merges every dataset's working-copy
    /// diff under the `kart.diff/v1+hexwkb` key.
    pub async fn to_diff(&self, working_copies: &HashMap<String, WorkingFeatureCollection>) -> Result<Json> {
        let mut merged = JsonMap::new();
        for (name, wc) in working_copies {
            let diff = wc.diff().await?;
            if let Some(datasets) = diff.get("kart.diff/v1+hexwkb").and_then(Json::as_object) {
                for (dataset_id, body) in datasets {
                    merged.insert(dataset_id.clone(), body.clone());
                }
            } else {
                debug!("repository: dataset `{name}` produced an empty diff");
            }
        }
        Ok(serde_json::json!({ "kart.diff/v1+hexwkb": Json::Object(merged) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalDatasetStore;

    async fn write(root: &std::path::Path, rel: &str, contents: &[u8]) {
        let full = root.join(rel);
        tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
        tokio::fs::write(full, contents).await.unwrap();
    }

    #[tokio::test]
    async fn lists_only_valid_dataset_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "good/.table-dataset/meta/title", b"Good").await;
        write(root, "good/.table-dataset/meta/schema.json", b"[]").await;
        write(root, "good/.table-dataset/meta/path-structure.json", b"{}").await;
        write(root, "good/.table-dataset/meta/legend/abc", b"x").await;
        write(root, "bad/.table-dataset/meta/title", b"Bad").await;

        let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(root));
        let repo = Repository::new(store);
        assert_eq!(repo.dataset_names().await.unwrap(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn get_rejects_invalid_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DatasetStore> = Arc::new(LocalDatasetStore::new(dir.path()));
        let repo = Repository::new(store);
        assert!(repo.get("nope").await.is_err());
    }
}

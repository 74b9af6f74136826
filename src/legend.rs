//! Legend: an immutable snapshot of a past schema's column ordering
//! (`spec.md` §3, §4.2).
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DatasetError, Result};

/// Column identity plus its position in the on-wire ordering, as returned by
/// [`Legend::column_ids`].
#[derive(Debug, Clone, PartialEq)]
pub struct LegendColumn {
    pub column_id: String,
    pub is_primary: bool,
    /// Index into the raw `primaryKeys`/`nonPrimaryKeyValues` tuple this column came from.
    pub data_index: usize,
}

#[derive(Serialize, Deserialize)]
struct PackedLegend(Vec<String>, Vec<String>);

/// Immutable column-ordering snapshot (`spec.md` §4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct Legend {
    id: String,
    primary_key_ids: Vec<String>,
    non_primary_key_ids: Vec<String>,
}

impl Legend {
    pub fn from_ids(primary_key_ids: Vec<String>, non_primary_key_ids: Vec<String>) -> Legend {
        let bytes = pack_legend_bytes(&primary_key_ids, &non_primary_key_ids);
        let id = legend_hash(&bytes);
        Legend {
            id,
            primary_key_ids,
            non_primary_key_ids,
        }
    }

    /// Parse a legend blob, verifying `filename_stem == hash(bytes)` (`spec.md` §4.2, §8).
    pub fn parse(bytes: &[u8], filename_stem: &str) -> Result<Legend> {
        let computed = legend_hash(bytes);
        if computed != filename_stem.to_ascii_lowercase() {
            return Err(DatasetError::InvalidFileContents {
                path: filename_stem.to_string(),
                reason: format!(
                    "legend hash mismatch: filename says `{filename_stem}`, bytes hash to `{computed}`"
                ),
            });
        }
        let PackedLegend(primary_key_ids, non_primary_key_ids) = rmp_serde::from_slice(bytes)
            .map_err(|e| DatasetError::InvalidFileContents {
                path: filename_stem.to_string(),
                reason: format!("malformed legend body: {e}"),
            })?;
        Ok(Legend {
            id: computed,
            primary_key_ids,
            non_primary_key_ids,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn primary_key_ids(&self) -> &[String] {
        &self.primary_key_ids
    }

    pub fn non_primary_key_ids(&self) -> &[String] {
        &self.non_primary_key_ids
    }

    /// On-wire column ordering: primary keys first, then non-primary keys,
    /// each tagged with its index into the raw value tuple it belongs to.
    pub fn column_ids(&self) -> impl Iterator<Item = LegendColumn> + '_ {
        self.primary_key_ids
            .iter()
            .enumerate()
            .map(|(i, id)| LegendColumn {
                column_id: id.clone(),
                is_primary: true,
                data_index: i,
            })
            .chain(self.non_primary_key_ids.iter().enumerate().map(|(i, id)| LegendColumn {
                column_id: id.clone(),
                is_primary: false,
                data_index: i,
            }))
    }
}

fn pack_legend_bytes(primary_key_ids: &[String], non_primary_key_ids: &[String]) -> Vec<u8> {
    rmp_serde::to_vec(&PackedLegend(
        primary_key_ids.to_vec(),
        non_primary_key_ids.to_vec(),
    ))
    .expect("legend body is always serializable")
}

/// hex(sha256(bytes)[0..20]) (`spec.md` §4.2, §6).
pub fn legend_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[0..20])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips_through_from_ids() {
        let legend = Legend::from_ids(vec!["id".into()], vec!["name".into(), "age".into()]);
        let bytes = pack_legend_bytes(legend.primary_key_ids(), legend.non_primary_key_ids());
        let reparsed = Legend::parse(&bytes, legend.id()).unwrap();
        assert_eq!(reparsed, legend);
    }

    #[test]
    fn rejects_hash_mismatch() {
        let legend = Legend::from_ids(vec!["id".into()], vec!["name".into()]);
        let bytes = pack_legend_bytes(legend.primary_key_ids(), legend.non_primary_key_ids());
        assert!(Legend::parse(&bytes, "0000000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn column_ids_orders_primary_first() {
        let legend = Legend::from_ids(vec!["a".into(), "b".into()], vec!["c".into()]);
        let ids: Vec<_> = legend.column_ids().map(|c| c.column_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}

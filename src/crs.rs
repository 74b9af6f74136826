//! CRS Registry: per-dataset coordinate reference system definitions loaded
//! from `meta/crs/*.wkt` (`spec.md` §2, §3, §6).
use std::collections::HashMap;

/// Fallback CRS identifier used when a geometry column doesn't declare one
/// (`spec.md` §4.4 step 5).
pub const DEFAULT_CRS: &str = "EPSG:4326";

/// Read-only `identifier -> WKT text` map, populated once per dataset
/// (`spec.md` §5: "populated once per dataset and read-only thereafter").
#[derive(Debug, Clone, Default)]
pub struct CrsRegistry {
    entries: HashMap<String, String>,
}

impl CrsRegistry {
    pub fn new() -> CrsRegistry {
        CrsRegistry::default()
    }

    pub fn insert(&mut self, identifier: impl Into<String>, wkt: impl Into<String>) {
        self.entries.insert(identifier.into(), wkt.into());
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.entries.get(identifier).map(String::as_str)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_return_none() {
        let reg = CrsRegistry::new();
        assert_eq!(reg.get("EPSG:4326"), None);
    }

    #[test]
    fn lookup_hits_after_insert() {
        let mut reg = CrsRegistry::new();
        reg.insert("EPSG:3857", "PROJCS[...]");
        assert_eq!(reg.get("EPSG:3857"), Some("PROJCS[...]"));
    }
}

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ReduceOptions;
use crate::error::Result;

/// Measured seconds keyed by bucketed dimensions.
///
/// Only measured points exist; a stored `0.0` marks a point whose measurement failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTable {
    Pair(BTreeMap<u32, BTreeMap<u32, f64>>),
    Triple(BTreeMap<u32, BTreeMap<u32, BTreeMap<u32, f64>>>),
}

impl CostTable {
    pub fn empty(arity: usize) -> Self {
        if arity >= 3 {
            CostTable::Triple(BTreeMap::new())
        } else {
            CostTable::Pair(BTreeMap::new())
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            CostTable::Pair(_) => 2,
            CostTable::Triple(_) => 3,
        }
    }

    /// Stored value at exactly `key` (already bucketed).
    pub fn get(&self, key: &[u32]) -> Option<f64> {
        match (self, key) {
            (CostTable::Pair(t), [r, c]) => t.get(r)?.get(c).copied(),
            (CostTable::Triple(t), [r, c, k]) => t.get(r)?.get(c)?.get(k).copied(),
            _ => None,
        }
    }

    /// Returns false when `key` does not match the table's arity.
    pub fn insert(&mut self, key: &[u32], seconds: f64) -> bool {
        match (self, key) {
            (CostTable::Pair(t), [r, c]) => {
                t.entry(*r).or_default().insert(*c, seconds);
                true
            }
            (CostTable::Triple(t), [r, c, k]) => {
                t.entry(*r)
                    .or_default()
                    .entry(*c)
                    .or_default()
                    .insert(*k, seconds);
                true
            }
            _ => false,
        }
    }

    /// Every stored point in key order.
    pub fn points(&self) -> Vec<(Vec<u32>, f64)> {
        let mut out = Vec::new();
        match self {
            CostTable::Pair(t) => {
                for (r, cols) in t {
                    for (c, v) in cols {
                        out.push((vec![*r, *c], *v));
                    }
                }
            }
            CostTable::Triple(t) => {
                for (r, cols) in t {
                    for (c, classes) in cols {
                        for (k, v) in classes {
                            out.push((vec![*r, *c, *k], *v));
                        }
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.points().len()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CostTable::Pair(t) => t.is_empty(),
            CostTable::Triple(t) => t.is_empty(),
        }
    }
}

#[derive(Default, Deserialize)]
struct PackagedTables {
    #[serde(default)]
    tables: BTreeMap<String, CostTable>,
}

static PACKAGED: Lazy<PackagedTables> = Lazy::new(|| {
    serde_json::from_str(include_str!("../../tables/default.json")).unwrap_or_else(|err| {
        log::warn!("packaged cost tables are unreadable: {err}");
        PackagedTables::default()
    })
});

fn packaged_key(op: &str, mode: u8) -> String {
    format!("{op}/mode{mode}")
}

/// Per-user cost table files: `<root>/<device-tag>/<op>/mode<k>.json`.
#[derive(Clone, Debug)]
pub struct TableStore {
    root: Option<PathBuf>,
    device_tag: String,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>, device_tag: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            device_tag: device_tag.into(),
        }
    }

    /// Store that only ever serves the packaged tables.
    pub fn packaged_only(device_tag: impl Into<String>) -> Self {
        Self {
            root: None,
            device_tag: device_tag.into(),
        }
    }

    pub fn from_options(options: &ReduceOptions, device_tag: &str) -> Self {
        let tag = options
            .device_tag
            .clone()
            .unwrap_or_else(|| device_tag.to_string());
        let root = options.table_dir.clone().or_else(|| {
            dirs::config_dir().map(|mut dir| {
                dir.push("runmat");
                dir.push("reduce");
                dir
            })
        });
        Self {
            root,
            device_tag: tag,
        }
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn path_for(&self, op: &str, mode: u8) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(&self.device_tag)
                .join(op)
                .join(format!("mode{mode}.json"))
        })
    }

    /// Calibration progress file for `op`, next to its mode tables.
    pub fn resume_path(&self, op: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(&self.device_tag).join(op).join("resume.json"))
    }

    /// User table if present, otherwise the packaged fallback.
    pub fn load(&self, op: &str, mode: u8) -> Result<Option<CostTable>> {
        if let Some(path) = self.path_for(op, mode) {
            if path.exists() {
                let data = std::fs::read_to_string(&path)?;
                let table: CostTable = serde_json::from_str(&data)?;
                log::debug!("loaded cost table {}", path.display());
                return Ok(Some(table));
            }
        }
        Ok(PACKAGED.tables.get(&packaged_key(op, mode)).cloned())
    }

    pub fn save(&self, op: &str, mode: u8, table: &CostTable) -> Result<PathBuf> {
        let path = self.path_for(op, mode).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no per-user configuration directory for cost tables",
            )
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(table)?;
        std::fs::write(&path, payload)?;
        log::info!("cost table saved to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_requires_matching_arity() {
        let mut t = CostTable::empty(2);
        assert!(t.insert(&[8, 16], 0.5));
        assert!(!t.insert(&[8, 16, 32], 0.5));
        assert_eq!(t.get(&[8, 16]), Some(0.5));
        assert_eq!(t.get(&[8, 16, 32]), None);
        assert_eq!(t.points(), vec![(vec![8, 16], 0.5)]);
    }

    #[test]
    fn packaged_fallback_parses() {
        let store = TableStore::packaged_only("host");
        assert!(store.path_for("reduce_sum", 0).is_none());
        assert!(store.load("reduce_sum", 0).unwrap().is_none());
    }
}

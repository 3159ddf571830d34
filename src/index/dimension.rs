//! Dimension entries - inverted index from `label=value` to series
//!
//! Maps `label=value` → set of canonical series keys. One [`Dimension`]
//! per pair is cached and persisted like any other object; the
//! [`LabelCatalog`] is a small always-resident view of which labels and
//! values exist, rebuilt from the persisted dimension keys on open.
//!
//! # Example
//! ```ignore
//! // Series carrying env=prod
//! let dim = dimensions.get(&dimension_id("env", "prod"))?;
//! ```

use crate::storage::cache::Persist;
use crate::storage::codec::Kind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Cache / store id of the dimension for one label pair
pub fn dimension_id(label: &str, value: &str) -> String {
    format!("{}={}", label, value)
}

/// Split a dimension id back into `(label, value)`
///
/// Label names never contain `=`, so the first one is the separator.
pub fn parse_dimension_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('=')
}

/// Set of series sharing one `label=value` pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    keys: BTreeSet<String>,
}

impl Dimension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series; returns false if it was already a member
    pub fn insert(&mut self, series: &str) -> bool {
        if self.keys.contains(series) {
            return false;
        }
        self.keys.insert(series.to_string())
    }

    pub fn contains(&self, series: &str) -> bool {
        self.keys.contains(series)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Member series in canonical key order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl Persist for Dimension {
    const KIND: Kind = Kind::Dimension;

    fn size_hint(&self) -> usize {
        self.keys.iter().map(|k| k.len() + 48).sum::<usize>() + 64
    }
}

/// Series present in every one of `dims`
///
/// Walks the smallest set and looks each member up in the others.
pub fn intersect(dims: &[Dimension]) -> Vec<String> {
    let Some(smallest) = dims.iter().min_by_key(|d| d.len()) else {
        return Vec::new();
    };
    smallest
        .keys()
        .filter(|key| dims.iter().all(|d| d.contains(key)))
        .map(str::to_string)
        .collect()
}

/// Every known label name and the values it has taken
#[derive(Debug, Default)]
pub struct LabelCatalog {
    labels: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl LabelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pair; returns false if it was already known
    pub fn insert(&self, label: &str, value: &str) -> bool {
        // Common case: already present, no write lock needed
        if self
            .labels
            .read()
            .get(label)
            .is_some_and(|values| values.contains(value))
        {
            return false;
        }

        self.labels
            .write()
            .entry(label.to_string())
            .or_default()
            .insert(value.to_string())
    }

    /// Record a pair from a persisted dimension id
    ///
    /// `None` when the id is not of the form `label=value`.
    pub fn insert_id(&self, id: &str) -> Option<bool> {
        let (label, value) = parse_dimension_id(id)?;
        Some(self.insert(label, value))
    }

    /// Label names in sorted order
    pub fn labels(&self) -> Vec<String> {
        self.labels.read().keys().cloned().collect()
    }

    /// Visit the values of `label` in sorted order until `visit` returns false
    ///
    /// The visitor runs under a read lock: concurrent inserts wait, but
    /// it sees a consistent snapshot.
    pub fn values<F>(&self, label: &str, mut visit: F)
    where
        F: FnMut(&str) -> bool,
    {
        let labels = self.labels.read();
        if let Some(values) = labels.get(label) {
            for value in values {
                if !visit(value) {
                    break;
                }
            }
        }
    }

    /// Number of distinct `label=value` pairs
    pub fn pair_count(&self) -> usize {
        self.labels.read().values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut dim = Dimension::new();
        assert!(dim.insert("app{env=prod}"));
        assert!(!dim.insert("app{env=prod}"));
        assert_eq!(dim.len(), 1);
    }

    #[test]
    fn test_intersect() {
        let mut prod = Dimension::new();
        prod.insert("a{env=prod,host=x}");
        prod.insert("b{env=prod,host=y}");
        let mut host_x = Dimension::new();
        host_x.insert("a{env=prod,host=x}");
        host_x.insert("c{env=dev,host=x}");

        assert_eq!(intersect(&[prod.clone(), host_x]), vec!["a{env=prod,host=x}"]);
        assert_eq!(intersect(&[prod.clone(), Dimension::new()]), Vec::<String>::new());
        assert!(intersect(&[]).is_empty());
        assert_eq!(intersect(&[prod]).len(), 2);
    }

    #[test]
    fn test_dimension_id_roundtrip() {
        let id = dimension_id("url", "/a=b");
        assert_eq!(parse_dimension_id(&id), Some(("url", "/a=b")));
    }

    #[test]
    fn test_catalog_values_sorted_and_short_circuit() {
        let catalog = LabelCatalog::new();
        catalog.insert("env", "staging");
        catalog.insert("env", "dev");
        catalog.insert("env", "prod");
        assert!(!catalog.insert("env", "dev"));
        assert_eq!(catalog.insert_id("host=web-1"), Some(true));
        assert_eq!(catalog.insert_id("host=web-1"), Some(false));
        assert_eq!(catalog.insert_id("no-separator"), None);

        assert_eq!(catalog.labels(), vec!["env", "host"]);
        assert_eq!(catalog.pair_count(), 4);

        let mut all = Vec::new();
        catalog.values("env", |v| {
            all.push(v.to_string());
            true
        });
        assert_eq!(all, vec!["dev", "prod", "staging"]);

        let mut seen = 0;
        catalog.values("env", |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);

        let mut none = 0;
        catalog.values("missing", |_| {
            none += 1;
            true
        });
        assert_eq!(none, 0);
    }
}

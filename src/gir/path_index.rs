//! Multimap from path identity (or anchor) to the graph nodes carrying it.
//!
//! Used by prefix extraction and reference rewiring to find every node that
//! stands for the same navigation. Direct assignment (`set`) *replaces* an
//! entry; `add` and `update` *union* into it. Both behaviors are relied on
//! by different callers, so the distinction is part of the contract.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::linear_path::LinearPath;
use super::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathKey {
    Anchor(String),
    Path(LinearPath),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathIndex {
    entries: BTreeMap<PathKey, BTreeSet<NodeId>>,
}

impl PathIndex {
    pub fn new() -> PathIndex {
        PathIndex::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replace whatever is stored under `key`.
    pub fn set(&mut self, key: PathKey, nodes: BTreeSet<NodeId>) {
        self.entries.insert(key, nodes);
    }

    /// Union a single node into the entry under `key`.
    pub fn add(&mut self, key: PathKey, node: NodeId) {
        self.entries.entry(key).or_default().insert(node);
    }

    /// Union-merge another index into this one.
    pub fn update(&mut self, other: PathIndex) {
        for (key, nodes) in other.entries {
            self.entries.entry(key).or_default().extend(nodes);
        }
    }

    pub fn get(&self, key: &PathKey) -> Option<&BTreeSet<NodeId>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathKey, &BTreeSet<NodeId>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept_catalog::FullName;

    fn key() -> PathKey {
        PathKey::Path(LinearPath::from_origin(FullName::new("test", "User")))
    }

    #[test]
    fn set_replaces_but_add_unions() {
        let mut index = PathIndex::new();
        index.add(key(), NodeId(1));
        index.add(key(), NodeId(2));
        assert_eq!(index.get(&key()).unwrap().len(), 2);

        index.set(key(), [NodeId(3)].into_iter().collect());
        assert_eq!(index.get(&key()).unwrap().len(), 1);
        assert!(index.get(&key()).unwrap().contains(&NodeId(3)));
    }

    #[test]
    fn update_unions_entries() {
        let mut left = PathIndex::new();
        left.add(key(), NodeId(1));
        let mut right = PathIndex::new();
        right.add(key(), NodeId(2));
        right.add(PathKey::Anchor("u".to_string()), NodeId(3));

        left.update(right);
        assert_eq!(left.get(&key()).unwrap().len(), 2);
        assert!(left.contains(&PathKey::Anchor("u".to_string())));
    }
}

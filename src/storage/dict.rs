//! Frame dictionary
//!
//! Each series interns its frame labels into compact `u32` ids so stored
//! chunks carry integers instead of repeated function names. The mapping
//! is append-only: an id, once handed out, always resolves to the same
//! label, so every chunk serialized earlier stays readable.
//!
//! Id 0 is reserved as the root sentinel; real frames start at 1.

use crate::storage::cache::Persist;
use crate::storage::codec::{decode_record, Kind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::{ChunkTree, Tree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Id reserved for the tree root
pub const ROOT_ID: u32 = 0;

/// Append-only interner for frame labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dictionary {
    /// Id → label; index 0 is the root sentinel
    labels: Vec<String>,
    /// Label → id, rebuilt on load
    #[serde(skip)]
    ids: HashMap<String, u32>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self {
            labels: vec![String::new()],
            ids: HashMap::new(),
        }
    }

    /// Return the id for `label`, assigning the next one if unseen
    pub fn get_or_create(&mut self, label: &str) -> u32 {
        if let Some(&id) = self.ids.get(label) {
            return id;
        }

        let id = self.labels.len() as u32;
        self.labels.push(label.to_string());
        self.ids.insert(label.to_string(), id);
        id
    }

    /// Look up an id without assigning one
    pub fn lookup(&self, label: &str) -> Option<u32> {
        self.ids.get(label).copied()
    }

    /// Resolve an id back to its label
    pub fn resolve(&self, id: u32) -> StorageResult<&str> {
        if id == ROOT_ID {
            return Err(StorageError::UnknownId(id));
        }
        self.labels
            .get(id as usize)
            .map(String::as_str)
            .ok_or(StorageError::UnknownId(id))
    }

    /// Number of interned labels
    pub fn len(&self) -> usize {
        self.labels.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert a label tree into an id tree, interning new labels
    pub fn intern_tree(&mut self, tree: &Tree) -> ChunkTree {
        let result: Result<ChunkTree, std::convert::Infallible> =
            tree.relabel(|label| Ok(self.get_or_create(label)));
        match result {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }

    /// Convert an id tree back into a label tree
    pub fn resolve_tree(&self, tree: &ChunkTree) -> StorageResult<Tree> {
        tree.relabel(|id| self.resolve(*id).map(str::to_string))
    }

    fn rebuild_index(&mut self) {
        self.ids = self
            .labels
            .iter()
            .enumerate()
            .skip(1)
            .map(|(id, label)| (label.clone(), id as u32))
            .collect();
    }
}

impl Persist for Dictionary {
    const KIND: Kind = Kind::Dictionary;

    fn size_hint(&self) -> usize {
        // Each label is held twice (vector + map key) plus bookkeeping
        self.labels.iter().map(|l| l.len() * 2 + 64).sum::<usize>() + 64
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let mut dict: Dictionary = decode_record(Self::KIND, bytes)?;
        if dict.labels.is_empty() {
            return Err(StorageError::Corruption(
                "Dictionary is missing its root sentinel".to_string(),
            ));
        }
        dict.rebuild_index();
        Ok(dict)
    }
}

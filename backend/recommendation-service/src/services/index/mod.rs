//! Identifier index, item catalog and interaction matrix
//!
//! Every matrix operation works on dense `u32` indices; this module owns the
//! mapping back and forth. Assignment is fixed for the lifetime of one build.

mod catalog;
mod matrix;

pub use catalog::Catalog;
pub use matrix::{build_interactions, interaction_weight, IndexedInteractions, InteractionMatrix};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bidirectional `id <-> dense index` mapping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityIndex {
    ids: Vec<String>,
    positions: HashMap<String, u32>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `id`, assigning the next free one on first sight
    pub fn get_or_insert(&mut self, id: &str) -> u32 {
        if let Some(&idx) = self.positions.get(id) {
            return idx;
        }
        let idx = self.ids.len() as u32;
        self.ids.push(id.to_string());
        self.positions.insert(id.to_string(), idx);
        idx
    }

    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.positions.get(id).copied()
    }

    pub fn id_of(&self, idx: u32) -> Option<&str> {
        self.ids.get(idx as usize).map(|s| s.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in index order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl<S: AsRef<str>> FromIterator<S> for EntityIndex {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut index = EntityIndex::new();
        for id in iter {
            index.get_or_insert(id.as_ref());
        }
        index
    }
}

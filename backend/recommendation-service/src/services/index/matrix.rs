use super::{Catalog, EntityIndex};
use crate::config::WeightingConfig;
use crate::error::{EngineError, Result};
use crate::models::{InteractionKind, InteractionRow, KindSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Sparse user x item matrix in CSR layout. Column indices within a row are
/// ascending; shape is fixed at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionMatrix {
    n_users: usize,
    n_items: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<u32>,
    values: Vec<f64>,
}

impl InteractionMatrix {
    /// Build from aggregated `(user, item) -> weight` entries
    pub fn from_entries(n_users: usize, n_items: usize, entries: &BTreeMap<(u32, u32), f64>) -> Self {
        let mut row_ptr = vec![0usize; n_users + 1];
        let mut col_idx = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());

        for (&(user, item), &weight) in entries {
            row_ptr[user as usize + 1] += 1;
            col_idx.push(item);
            values.push(weight);
        }
        for row in 0..n_users {
            row_ptr[row + 1] += row_ptr[row];
        }

        Self {
            n_users,
            n_items,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// `(item indices, weights)` of one user row
    pub fn row(&self, user: u32) -> (&[u32], &[f64]) {
        let user = user as usize;
        if user >= self.n_users {
            return (&[], &[]);
        }
        let (start, end) = (self.row_ptr[user], self.row_ptr[user + 1]);
        (&self.col_idx[start..end], &self.values[start..end])
    }

    pub fn row_len(&self, user: u32) -> usize {
        self.row(user).0.len()
    }

    pub fn get(&self, user: u32, item: u32) -> f64 {
        let (cols, vals) = self.row(user);
        match cols.binary_search(&item) {
            Ok(pos) => vals[pos],
            Err(_) => 0.0,
        }
    }

    /// All nonzero entries as `(user, item, weight)`
    pub fn entries(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        (0..self.n_users as u32).flat_map(move |user| {
            let (cols, vals) = self.row(user);
            cols.iter().zip(vals).map(move |(&item, &w)| (user, item, w))
        })
    }

    /// The `limit` heaviest items of a user row, heaviest first (ties by index)
    pub fn top_row_items(&self, user: u32, limit: usize) -> Vec<(u32, f64)> {
        let (cols, vals) = self.row(user);
        let mut pairs: Vec<(u32, f64)> = cols.iter().copied().zip(vals.iter().copied()).collect();
        pairs.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        pairs.truncate(limit);
        pairs
    }

    /// Column-major view: for each item, the `(user, weight)` pairs
    pub fn columns(&self) -> Vec<Vec<(u32, f64)>> {
        let mut columns = vec![Vec::new(); self.n_items];
        for (user, item, weight) in self.entries() {
            columns[item as usize].push((user, weight));
        }
        columns
    }
}

/// `ln(1 + play_count)` plus a bonus for each categorical signal
pub fn interaction_weight(play_count: u32, kinds: KindSet, weighting: &WeightingConfig) -> f64 {
    let mut weight = (1.0 + play_count as f64).ln();
    if kinds.contains(InteractionKind::Like) {
        weight += weighting.like_bonus;
    }
    if kinds.contains(InteractionKind::Collect) {
        weight += weighting.collect_bonus;
    }
    if kinds.contains(InteractionKind::Share) {
        weight += weighting.share_bonus;
    }
    weight.max(0.0)
}

/// User index plus the matrix built against a catalog's item index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedInteractions {
    pub users: EntityIndex,
    pub matrix: InteractionMatrix,
    pub filtered_rows: usize,
}

/// Build the user index and interaction matrix.
///
/// Rows naming an item outside the catalog, or a user outside `known_users`
/// when that set is given, are dropped and counted. Duplicate pairs are summed.
pub fn build_interactions(
    rows: &[InteractionRow],
    catalog: &Catalog,
    known_users: Option<&HashSet<String>>,
    weighting: &WeightingConfig,
) -> Result<IndexedInteractions> {
    let mut users = EntityIndex::new();
    let mut entries: BTreeMap<(u32, u32), f64> = BTreeMap::new();
    let mut filtered_rows = 0usize;

    for row in rows {
        let Some(item) = catalog.items.index_of(&row.item_id) else {
            filtered_rows += 1;
            continue;
        };
        if let Some(known) = known_users {
            if !known.contains(&row.user_id) {
                filtered_rows += 1;
                continue;
            }
        }

        let user = users.get_or_insert(&row.user_id);
        let kinds: KindSet = row.kinds.iter().copied().collect();
        let weight = interaction_weight(row.play_count, kinds, weighting);

        *entries.entry((user, item)).or_insert(0.0) += weight;
    }

    if filtered_rows > 0 {
        warn!(filtered_rows, "Interaction rows with unknown ids filtered");
    }

    if entries.is_empty() {
        return Err(EngineError::Dataset(format!(
            "no valid interaction rows ({} filtered of {})",
            filtered_rows,
            rows.len()
        )));
    }

    let matrix = InteractionMatrix::from_entries(users.len(), catalog.len(), &entries);

    info!(
        users = matrix.n_users(),
        items = matrix.n_items(),
        nnz = matrix.nnz(),
        "Interaction matrix built"
    );

    Ok(IndexedInteractions {
        users,
        matrix,
        filtered_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColdStartConfig;
    use crate::models::ItemRecord;

    fn catalog(ids: &[&str]) -> Catalog {
        let records: Vec<ItemRecord> = ids
            .iter()
            .map(|id| ItemRecord {
                item_id: id.to_string(),
                category: "c".to_string(),
                popularity: 1.0,
                features: vec![],
                tier: None,
            })
            .collect();
        Catalog::build(&records, &ColdStartConfig::default())
    }

    fn row(user: &str, item: &str, plays: u32, kinds: &[InteractionKind]) -> InteractionRow {
        InteractionRow {
            user_id: user.to_string(),
            item_id: item.to_string(),
            play_count: plays,
            kinds: kinds.to_vec(),
        }
    }

    #[test]
    fn test_duplicates_are_summed_and_unknown_filtered() {
        let catalog = catalog(&["i1", "i2"]);
        let rows = vec![
            row("u1", "i1", 1, &[InteractionKind::Play]),
            row("u1", "i1", 1, &[InteractionKind::Like]),
            row("u1", "i9", 5, &[]),
            row("u2", "i2", 0, &[InteractionKind::Collect]),
        ];
        let built = build_interactions(&rows, &catalog, None, &WeightingConfig::default()).unwrap();

        assert_eq!(built.filtered_rows, 1);
        assert_eq!(built.matrix.nnz(), 2);

        let u1 = built.users.index_of("u1").unwrap();
        let expected = 2.0 * 2.0_f64.ln() + 1.0;
        assert!((built.matrix.get(u1, 0) - expected).abs() < 1e-12);

        let u2 = built.users.index_of("u2").unwrap();
        assert!((built.matrix.get(u2, 1) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_kinds_fold_into_weight() {
        let catalog = catalog(&["i1"]);
        let rows = vec![
            row("u1", "i1", 4, &[]),
            row("u2", "i1", 4, &[InteractionKind::Like, InteractionKind::Share]),
        ];
        let weighting = WeightingConfig::default();
        let built = build_interactions(&rows, &catalog, None, &weighting).unwrap();

        let plain = built.matrix.get(built.users.index_of("u1").unwrap(), 0);
        let liked = built.matrix.get(built.users.index_of("u2").unwrap(), 0);
        assert!((liked - plain - weighting.like_bonus - weighting.share_bonus).abs() < 1e-12);
    }

    #[test]
    fn test_every_entry_resolves() {
        let catalog = catalog(&["i1", "i2", "i3"]);
        let rows = vec![
            row("u1", "i1", 3, &[]),
            row("u2", "i3", 1, &[]),
            row("u3", "i2", 2, &[]),
            row("u3", "i3", 2, &[]),
        ];
        let built = build_interactions(&rows, &catalog, None, &WeightingConfig::default()).unwrap();
        for (user, item, _) in built.matrix.entries() {
            assert!(built.users.id_of(user).is_some());
            assert!(catalog.items.id_of(item).is_some());
        }
        assert_eq!(built.matrix.columns()[2].len(), 2);
    }

    #[test]
    fn test_user_filter_and_empty_dataset() {
        let catalog = catalog(&["i1"]);
        let known: HashSet<String> = ["u2".to_string()].into_iter().collect();
        let rows = vec![row("u1", "i1", 1, &[])];
        let err = build_interactions(&rows, &catalog, Some(&known), &WeightingConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Dataset(_)));
    }

    #[test]
    fn test_top_row_items() {
        let catalog = catalog(&["i1", "i2", "i3"]);
        let rows = vec![
            row("u1", "i1", 1, &[]),
            row("u1", "i2", 10, &[]),
            row("u1", "i3", 5, &[]),
        ];
        let built = build_interactions(&rows, &catalog, None, &WeightingConfig::default()).unwrap();
        let top = built.matrix.top_row_items(0, 2);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
    }
}

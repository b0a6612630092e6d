// ============================================
// Neighbor / Co-occurrence Tables
// ============================================
//
// Built once per epoch, immutable afterwards:
// - item -> items: cosine between item interaction columns (co-occurrence)
// - user -> users: cosine between user factor vectors, or between sparse
//   interaction rows when the latent model is disabled for the epoch
// - user -> items: UserCF aggregate, score[i] = Σ sim(u, v) × w(v, i) over the
//   top-K similar users v, excluding items u already knows

use crate::models::{NeighborTable, ScoredItems};
use crate::services::index::{EntityIndex, InteractionMatrix};
use crate::services::latent::{normalize_rows, LatentFactors};
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Item-item co-occurrence table.
///
/// Each user contributes at most `max_items_per_user` of their heaviest items,
/// which bounds the quadratic pair expansion for very active users.
pub fn build_item_neighbors(
    matrix: &InteractionMatrix,
    items: &EntityIndex,
    k: usize,
    min_similarity: f64,
    max_items_per_user: usize,
) -> NeighborTable {
    let mut norms = vec![0.0f64; matrix.n_items()];
    let mut dots: HashMap<(u32, u32), f64> = HashMap::new();

    for user in 0..matrix.n_users() as u32 {
        let mut row = matrix.top_row_items(user, max_items_per_user);
        row.sort_by_key(|(item, _)| *item);

        for (a, &(item_a, w_a)) in row.iter().enumerate() {
            norms[item_a as usize] += w_a * w_a;
            for &(item_b, w_b) in &row[a + 1..] {
                *dots.entry((item_a, item_b)).or_insert(0.0) += w_a * w_b;
            }
        }
    }

    let mut lists: HashMap<u32, ScoredItems> = HashMap::new();
    for ((a, b), dot) in dots {
        let denom = (norms[a as usize] * norms[b as usize]).sqrt();
        if denom <= f64::EPSILON {
            continue;
        }
        let similarity = dot / denom;
        if similarity <= min_similarity {
            continue;
        }
        if let (Some(id_a), Some(id_b)) = (items.id_of(a), items.id_of(b)) {
            lists.entry(a).or_default().push((id_b.to_string(), similarity));
            lists.entry(b).or_default().push((id_a.to_string(), similarity));
        }
    }

    let mut table = NeighborTable::new(k);
    for (item, list) in lists {
        if let Some(id) = items.id_of(item) {
            table.insert(id, list);
        }
    }

    info!(items_with_neighbors = table.len(), k, "Item co-occurrence table built");
    table
}

/// User-user similarity table, from factors when available
pub fn build_user_neighbors(
    matrix: &InteractionMatrix,
    users: &EntityIndex,
    factors: Option<&LatentFactors>,
    k: usize,
) -> NeighborTable {
    let table = match factors {
        Some(factors) => user_neighbors_from_factors(factors, users, k),
        None => user_neighbors_from_rows(matrix, users, k),
    };
    info!(
        users_with_neighbors = table.len(),
        source = if factors.is_some() { "factors" } else { "interactions" },
        "User similarity table built"
    );
    table
}

fn user_neighbors_from_factors(factors: &LatentFactors, users: &EntityIndex, k: usize) -> NeighborTable {
    let normalized = normalize_rows(&factors.user_factors);
    let mut table = NeighborTable::new(k);

    for (u, row) in normalized.rows().into_iter().enumerate() {
        let similarities = normalized.dot(&row);
        let list: ScoredItems = similarities
            .iter()
            .enumerate()
            .filter(|&(v, s)| v != u && *s > 0.0)
            .filter_map(|(v, s)| users.id_of(v as u32).map(|id| (id.to_string(), *s)))
            .collect();
        if let Some(id) = users.id_of(u as u32) {
            table.insert(id, crate::utils::top_k(list, k));
        }
    }
    table
}

fn user_neighbors_from_rows(matrix: &InteractionMatrix, users: &EntityIndex, k: usize) -> NeighborTable {
    let columns = matrix.columns();
    let norms: Vec<f64> = (0..matrix.n_users() as u32)
        .map(|u| matrix.row(u).1.iter().map(|w| w * w).sum::<f64>().sqrt())
        .collect();

    let mut table = NeighborTable::new(k);
    for u in 0..matrix.n_users() as u32 {
        let mut dots: HashMap<u32, f64> = HashMap::new();
        let (cols, vals) = matrix.row(u);
        for (&item, &w_u) in cols.iter().zip(vals) {
            for &(v, w_v) in &columns[item as usize] {
                if v != u {
                    *dots.entry(v).or_insert(0.0) += w_u * w_v;
                }
            }
        }

        let list: ScoredItems = dots
            .into_iter()
            .filter_map(|(v, dot)| {
                let denom = norms[u as usize] * norms[v as usize];
                if denom <= f64::EPSILON || dot <= 0.0 {
                    return None;
                }
                users.id_of(v).map(|id| (id.to_string(), dot / denom))
            })
            .collect();
        if let Some(id) = users.id_of(u) {
            table.insert(id, crate::utils::top_k(list, k));
        }
    }
    table
}

/// Per-user UserCF candidates, precomputed so a request is a single lookup
pub fn build_user_cf_aggregates(
    matrix: &InteractionMatrix,
    users: &EntityIndex,
    items: &EntityIndex,
    user_neighbors: &NeighborTable,
    limit: usize,
) -> NeighborTable {
    let mut table = NeighborTable::new(limit);

    for u in 0..matrix.n_users() as u32 {
        let Some(user_id) = users.id_of(u) else {
            continue;
        };
        let known: HashSet<u32> = matrix.row(u).0.iter().copied().collect();
        let mut scores: HashMap<u32, f64> = HashMap::new();

        for (neighbor_id, similarity) in user_neighbors.get(user_id) {
            let Some(v) = users.index_of(neighbor_id) else {
                continue;
            };
            let (cols, vals) = matrix.row(v);
            for (&item, &weight) in cols.iter().zip(vals) {
                if !known.contains(&item) {
                    *scores.entry(item).or_insert(0.0) += similarity * weight;
                }
            }
        }

        let list: ScoredItems = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(item, score)| items.id_of(item).map(|id| (id.to_string(), score)))
            .collect();
        table.insert(user_id, crate::utils::top_k(list, limit));
    }

    info!(users_with_candidates = table.len(), limit, "UserCF aggregates built");
    table
}

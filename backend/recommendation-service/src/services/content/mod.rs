// ============================================
// Content Similarity Index
// ============================================
//
// Per-item nearest neighbours over scaled feature vectors.
//
// Data Flow:
//   Item features → z-score per dimension → L2 per row → cosine (dot)
//                                                     ↓
//                       top-(K+1) → drop self → keep score > threshold
//
// Items whose similarity to every other item stays below the threshold get no
// list at all and simply contribute no content candidates.

use crate::models::NeighborTable;
use crate::services::index::Catalog;
use crate::services::latent::normalize_rows;
use ndarray::{Array2, Axis};
use tracing::{info, warn};

/// Scale raw feature rows into comparable ranges: each dimension to zero mean
/// and unit variance, then each row to unit length. Shorter rows are padded
/// with zeros to the widest row.
pub fn scale_features(features: &[Vec<f64>]) -> Array2<f64> {
    let n = features.len();
    let dim = features.iter().map(|f| f.len()).max().unwrap_or(0);

    let ragged = features.iter().filter(|f| f.len() != dim).count();
    if ragged > 0 {
        warn!(ragged, dim, "Feature vectors padded to common dimension");
    }

    let mut matrix = Array2::<f64>::zeros((n, dim));
    for (i, row) in features.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            matrix[[i, j]] = if value.is_finite() { *value } else { 0.0 };
        }
    }
    if n == 0 || dim == 0 {
        return matrix;
    }

    for mut column in matrix.axis_iter_mut(Axis(1)) {
        let mean = column.sum() / n as f64;
        let variance = column.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt();
        if std > f64::EPSILON {
            column.mapv_inplace(|x| (x - mean) / std);
        } else {
            column.fill(0.0);
        }
    }

    normalize_rows(&matrix)
}

/// Build the content neighbour table for every catalog item
pub fn build_content_neighbors(catalog: &Catalog, k: usize, min_similarity: f64) -> NeighborTable {
    let scaled = scale_features(&catalog.features);
    let mut table = NeighborTable::new(k);

    if scaled.ncols() == 0 {
        warn!("No item features available; content recall disabled for this epoch");
        return table;
    }

    for (i, row) in scaled.rows().into_iter().enumerate() {
        let similarities = scaled.dot(&row);

        // K+1 so that dropping the item itself still leaves K
        let mut ranked: Vec<(usize, f64)> = similarities
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .map(|(j, s)| (j, *s))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k + 1);

        let neighbors = ranked
            .into_iter()
            .filter(|&(j, s)| j != i && s > min_similarity)
            .filter_map(|(j, s)| catalog.items.id_of(j as u32).map(|id| (id.to_string(), s)))
            .collect();

        if let Some(id) = catalog.items.id_of(i as u32) {
            table.insert(id, neighbors);
        }
    }

    info!(
        items = catalog.len(),
        with_neighbors = table.len(),
        k,
        "Content similarity index built"
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColdStartConfig;
    use crate::models::ItemRecord;

    fn catalog(features: &[(&str, Vec<f64>)]) -> Catalog {
        let records: Vec<ItemRecord> = features
            .iter()
            .map(|(id, f)| ItemRecord {
                item_id: id.to_string(),
                category: "c".into(),
                popularity: 1.0,
                features: f.clone(),
                tier: None,
            })
            .collect();
        Catalog::build(&records, &ColdStartConfig::default())
    }

    #[test]
    fn test_neighbors_exclude_self_and_are_sorted() {
        let catalog = catalog(&[
            ("a", vec![1.0, 0.0, 10.0]),
            ("b", vec![0.9, 0.1, 9.0]),
            ("c", vec![0.8, 0.2, 8.5]),
            ("d", vec![0.0, 1.0, 1.0]),
            ("e", vec![0.1, 0.9, 0.5]),
        ]);
        let table = build_content_neighbors(&catalog, 3, 0.1);

        for (id, list) in table.iter() {
            assert!(list.iter().all(|(other, _)| other != id));
            for pair in list.windows(2) {
                assert!(pair[0].1 >= pair[1].1);
            }
            assert!(list.iter().all(|(_, s)| *s > 0.1));
        }
        assert_eq!(table.get("a")[0].0, "b");
        assert_eq!(table.get("d")[0].0, "e");
    }

    #[test]
    fn test_isolated_item_gets_empty_list() {
        // Constant features carry no information after z-scoring
        let catalog = catalog(&[("a", vec![1.0, 1.0]), ("b", vec![1.0, 1.0])]);
        let table = build_content_neighbors(&catalog, 5, 0.1);
        assert!(table.get("a").is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_scale_features_pads_ragged_rows() {
        let scaled = scale_features(&[vec![1.0, 2.0], vec![3.0]]);
        assert_eq!(scaled.dim(), (2, 2));
        for row in scaled.rows() {
            let norm = row.dot(&row).sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-9);
        }
    }
}

use super::normalize_rows;
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Random-hyperplane LSH over normalized item factors.
///
/// Each table hashes a vector to the sign pattern of `hyperplanes` random
/// projections. A query unions the buckets it lands in across tables (plus
/// the one-bit neighbours when that is not enough) and re-scores the union
/// by exact cosine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LshIndex {
    /// One (hyperplanes x dim) projection matrix per table
    planes: Vec<Array2<f64>>,
    buckets: Vec<HashMap<u64, Vec<u32>>>,
    vectors: Array2<f64>,
    hyperplanes: usize,
}

impl LshIndex {
    pub fn build(item_factors: &Array2<f64>, hyperplanes: usize, tables: usize, seed: u64) -> Self {
        let hyperplanes = hyperplanes.clamp(1, 63);
        let tables = tables.max(1);
        let dim = item_factors.ncols();
        let vectors = normalize_rows(item_factors);

        let mut rng = StdRng::seed_from_u64(seed);
        let planes: Vec<Array2<f64>> = (0..tables)
            .map(|_| Array2::from_shape_fn((hyperplanes, dim), |_| rng.gen_range(-1.0..1.0)))
            .collect();

        let mut buckets = vec![HashMap::new(); tables];
        for (idx, row) in vectors.rows().into_iter().enumerate() {
            if row.iter().all(|x| *x == 0.0) {
                continue;
            }
            for (table, plane) in planes.iter().enumerate() {
                buckets[table]
                    .entry(signature(plane, row))
                    .or_insert_with(Vec::new)
                    .push(idx as u32);
            }
        }

        Self {
            planes,
            buckets,
            vectors,
            hyperplanes,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.nrows() == 0
    }

    /// Approximate top-`k` items by cosine to `query`, skipping `exclude`
    pub fn query(&self, query: ArrayView1<'_, f64>, k: usize, exclude: &HashSet<u32>) -> Vec<(u32, f64)> {
        let norm = query.dot(&query).sqrt();
        if k == 0 || norm <= f64::EPSILON {
            return Vec::new();
        }
        let query = query.mapv(|x| x / norm);

        let mut candidates: HashSet<u32> = HashSet::new();
        let mut signatures = Vec::with_capacity(self.planes.len());
        for (table, plane) in self.planes.iter().enumerate() {
            let sig = signature(plane, query.view());
            if let Some(bucket) = self.buckets[table].get(&sig) {
                candidates.extend(bucket.iter().filter(|idx| !exclude.contains(*idx)));
            }
            signatures.push(sig);
        }

        // Multi-probe: flip one bit at a time when the exact buckets are thin
        if candidates.len() < k {
            for (table, &sig) in signatures.iter().enumerate() {
                for bit in 0..self.hyperplanes {
                    if let Some(bucket) = self.buckets[table].get(&(sig ^ (1u64 << bit))) {
                        candidates.extend(bucket.iter().filter(|idx| !exclude.contains(*idx)));
                    }
                }
            }
        }

        let mut scored: Vec<(u32, f64)> = candidates
            .into_iter()
            .map(|idx| (idx, self.vectors.row(idx as usize).dot(&query)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

fn signature(plane: &Array2<f64>, v: ArrayView1<'_, f64>) -> u64 {
    plane
        .dot(&v)
        .iter()
        .enumerate()
        .fold(0u64, |acc, (bit, proj)| if *proj >= 0.0 { acc | (1u64 << bit) } else { acc })
}

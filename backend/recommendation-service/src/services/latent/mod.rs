//! Latent factor model
//!
//! Seeded randomized truncated SVD of the interaction matrix:
//! 1. Project the matrix onto a random subspace and orthonormalize (range finder)
//! 2. Sharpen the subspace with a few power iterations
//! 3. Eigen-decompose the small projected Gram matrix with Jacobi rotations
//!
//! `user_factors = U * Sigma`, `item_factors = V`, so `user . item`
//! approximates the interaction weight.

mod ann;

pub use ann::LshIndex;

use crate::config::LatentConfig;
use crate::error::{EngineError, Result};
use crate::services::index::InteractionMatrix;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const OVERSAMPLING: usize = 8;
const JACOBI_MAX_SWEEPS: usize = 64;
const JACOBI_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentFactors {
    /// n_users x rank
    pub user_factors: Array2<f64>,
    /// n_items x rank
    pub item_factors: Array2<f64>,
    pub singular_values: Vec<f64>,
}

impl LatentFactors {
    pub fn rank(&self) -> usize {
        self.singular_values.len()
    }

    pub fn user_vector(&self, user: u32) -> Option<ArrayView1<'_, f64>> {
        ((user as usize) < self.user_factors.nrows()).then(|| self.user_factors.row(user as usize))
    }

    pub fn item_vector(&self, item: u32) -> Option<ArrayView1<'_, f64>> {
        ((item as usize) < self.item_factors.nrows()).then(|| self.item_factors.row(item as usize))
    }

    /// Dot products of a user vector against every item
    pub fn score_all_items(&self, user: u32) -> Option<Array1<f64>> {
        self.user_vector(user).map(|u| self.item_factors.dot(&u))
    }
}

/// `min(requested, min(rows, cols) - 1)`
pub fn clamp_rank(requested: usize, rows: usize, cols: usize) -> usize {
    requested.min(rows.min(cols).saturating_sub(1))
}

/// Factorize `matrix` at the configured rank. A clamped rank below
/// `config.min_rank` yields `RankTooLow`; callers disable latent recall.
pub fn factorize(matrix: &InteractionMatrix, config: &LatentConfig) -> Result<LatentFactors> {
    let (m, n) = (matrix.n_users(), matrix.n_items());
    let rank = clamp_rank(config.rank, m, n);
    if rank < config.min_rank || rank == 0 {
        return Err(EngineError::RankTooLow {
            requested: config.rank,
            clamped: rank,
            minimum: config.min_rank,
        });
    }

    let sketch = (rank + OVERSAMPLING).min(m.min(n));
    let mut rng = StdRng::seed_from_u64(config.seed);
    let omega = Array2::from_shape_fn((n, sketch), |_| rng.gen_range(-1.0..1.0));

    // Range finder: Q spans the dominant column space of A
    let mut q = orthonormalize(sparse_mul(matrix, &omega));
    for _ in 0..config.power_iters {
        let z = orthonormalize(sparse_t_mul(matrix, &q));
        q = orthonormalize(sparse_mul(matrix, &z));
    }

    // B = Q^T A, kept transposed as (n x sketch)
    let b_t = sparse_t_mul(matrix, &q);
    let gram = b_t.t().dot(&b_t);
    let (eigenvalues, eigenvectors) = jacobi_eigen(gram);

    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(rank);

    let mut singular_values = Vec::with_capacity(rank);
    let mut user_factors = Array2::<f64>::zeros((m, rank));
    let mut item_factors = Array2::<f64>::zeros((n, rank));

    for (col, &src) in order.iter().enumerate() {
        let sigma = eigenvalues[src].max(0.0).sqrt();
        singular_values.push(sigma);

        let w = eigenvectors.column(src);
        // U_k = Q w, so U_k * sigma = Q w sigma
        let u = q.dot(&w);
        user_factors.column_mut(col).assign(&(&u * sigma));

        if sigma > JACOBI_TOLERANCE {
            let v = b_t.dot(&w) / sigma;
            item_factors.column_mut(col).assign(&v);
        }
    }

    info!(
        users = m,
        items = n,
        rank,
        top_singular_value = singular_values.first().copied().unwrap_or(0.0),
        "Latent factors computed"
    );

    Ok(LatentFactors {
        user_factors,
        item_factors,
        singular_values,
    })
}

/// A (m x n, sparse) times X (n x l)
fn sparse_mul(matrix: &InteractionMatrix, x: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((matrix.n_users(), x.ncols()));
    for user in 0..matrix.n_users() as u32 {
        let (cols, vals) = matrix.row(user);
        let mut out_row = out.row_mut(user as usize);
        for (&item, &w) in cols.iter().zip(vals) {
            out_row.scaled_add(w, &x.row(item as usize));
        }
    }
    out
}

/// A^T (n x m, sparse) times Y (m x l)
fn sparse_t_mul(matrix: &InteractionMatrix, y: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((matrix.n_items(), y.ncols()));
    for user in 0..matrix.n_users() as u32 {
        let (cols, vals) = matrix.row(user);
        let y_row = y.row(user as usize);
        for (&item, &w) in cols.iter().zip(vals) {
            out.row_mut(item as usize).scaled_add(w, &y_row);
        }
    }
    out
}

/// Modified Gram-Schmidt over columns. Columns that collapse numerically are
/// zeroed rather than normalized.
fn orthonormalize(mut a: Array2<f64>) -> Array2<f64> {
    let cols = a.ncols();
    for j in 0..cols {
        for i in 0..j {
            let qi = a.column(i).to_owned();
            let proj = qi.dot(&a.column(j));
            a.column_mut(j).scaled_add(-proj, &qi);
        }
        let norm = a.column(j).dot(&a.column(j)).sqrt();
        if norm > 1e-10 {
            a.column_mut(j).mapv_inplace(|x| x / norm);
        } else {
            a.column_mut(j).fill(0.0);
        }
    }
    a
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
/// Returns eigenvalues and eigenvectors (as columns), unsorted.
fn jacobi_eigen(mut a: Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);

    for sweep in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| (p + 1..n).map(move |q| (p, q)))
            .map(|(p, q)| a[[p, q]] * a[[p, q]])
            .sum();
        if off < JACOBI_TOLERANCE {
            debug!(sweep, "Jacobi converged");
            break;
        }

        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues = a.diag().to_vec();
    (eigenvalues, v)
}

/// Row-normalized copy (zero rows stay zero)
pub(crate) fn normalize_rows(m: &Array2<f64>) -> Array2<f64> {
    let mut out = m.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f64::EPSILON {
            row.mapv_inplace(|x| x / norm);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColdStartConfig, WeightingConfig};
    use crate::models::{InteractionRow, ItemRecord};
    use crate::services::index::{build_interactions, Catalog};
    use ndarray::array;

    fn random_matrix(users: usize, items: usize, seed: u64) -> InteractionMatrix {
        let records: Vec<ItemRecord> = (0..items)
            .map(|i| ItemRecord {
                item_id: format!("i{}", i),
                category: "c".into(),
                popularity: 1.0,
                features: vec![],
                tier: None,
            })
            .collect();
        let catalog = Catalog::build(&records, &ColdStartConfig::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::new();
        for u in 0..users {
            for i in 0..items {
                if i == u % items || rng.gen_bool(0.3) {
                    rows.push(InteractionRow {
                        user_id: format!("u{}", u),
                        item_id: format!("i{}", i),
                        play_count: rng.gen_range(1..20),
                        kinds: vec![],
                    });
                }
            }
        }
        build_interactions(&rows, &catalog, None, &WeightingConfig::default())
            .unwrap()
            .matrix
    }

    #[test]
    fn test_clamp_rank() {
        assert_eq!(clamp_rank(32, 3, 5), 2);
        assert_eq!(clamp_rank(32, 100, 200), 32);
        assert_eq!(clamp_rank(32, 0, 5), 0);
    }

    #[test]
    fn test_rank_too_low_is_reported() {
        let matrix = random_matrix(3, 5, 7);
        let err = factorize(&matrix, &LatentConfig::default()).unwrap_err();
        match err {
            EngineError::RankTooLow {
                requested,
                clamped,
                minimum,
            } => {
                assert_eq!(requested, 32);
                assert!(clamped <= 2);
                assert_eq!(minimum, 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_factorization_is_deterministic() {
        let matrix = random_matrix(40, 30, 11);
        let config = LatentConfig {
            rank: 12,
            ..LatentConfig::default()
        };
        let a = factorize(&matrix, &config).unwrap();
        let b = factorize(&matrix, &config).unwrap();
        assert_eq!(a.rank(), 12);
        assert_eq!(a.user_factors, b.user_factors);
        assert_eq!(a.item_factors, b.item_factors);
    }

    #[test]
    fn test_singular_values_descending_and_reconstruction_improves() {
        let matrix = random_matrix(40, 30, 3);
        let config = LatentConfig {
            rank: 12,
            ..LatentConfig::default()
        };
        let factors = factorize(&matrix, &config).unwrap();
        for pair in factors.singular_values.windows(2) {
            assert!(pair[0] + 1e-9 >= pair[1]);
        }

        // Reconstruction error must be smaller than the matrix norm itself
        let approx = factors.user_factors.dot(&factors.item_factors.t());
        let mut err = 0.0;
        let mut total = 0.0;
        for u in 0..matrix.n_users() {
            for i in 0..matrix.n_items() {
                let actual = matrix.get(u as u32, i as u32);
                err += (actual - approx[[u, i]]).powi(2);
                total += actual * actual;
            }
        }
        assert!(err < total);
    }

    #[test]
    fn test_jacobi_diagonalizes() {
        let m = array![[4.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 2.0]];
        let (values, vectors) = jacobi_eigen(m.clone());
        for (k, value) in values.iter().enumerate() {
            let v = vectors.column(k);
            let mv = m.dot(&v);
            for i in 0..3 {
                assert!((mv[i] - value * v[i]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_orthonormalize() {
        let a = array![[1.0, 1.0], [0.0, 1.0], [1.0, 0.0]];
        let q = orthonormalize(a);
        let gram = q.t().dot(&q);
        assert!((gram[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(gram[[0, 1]].abs() < 1e-12);
    }
}

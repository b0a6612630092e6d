// ============================================
// Fusion Weight Tuning (offline)
// ============================================
//
// 1. Hold out a seeded fraction of each user's interactions
// 2. Build a training epoch on the rest
// 3. Search the tunable weights over the simplex left by the fixed ones:
//    exhaustive grid, then coordinate refinement with a halving step
// 4. Score each candidate by mean NDCG@k on the held-out items
//
// `SimplexSearch` knows nothing about generators; it maximizes any objective
// over non-negative vectors with a fixed sum.

use crate::error::Result;
use crate::models::{GeneratorKind, InteractionRow, ScoredItems};
use crate::services::engine::HybridEngine;
use crate::services::fusion::FusionWeights;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Grid + coordinate search over `{x in R^d : x >= 0, sum(x) = total}`
#[derive(Debug, Clone)]
pub struct SimplexSearch {
    pub dimensions: usize,
    pub total: f64,
    pub step: f64,
    pub refine_rounds: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub best: Vec<f64>,
    pub score: f64,
    pub evaluations: usize,
}

impl SimplexSearch {
    fn divisions(&self) -> usize {
        if self.step <= 0.0 || self.total <= 0.0 {
            return 1;
        }
        ((self.total / self.step).round() as usize).max(1)
    }

    /// Every grid point whose coordinates are multiples of `total / divisions`
    pub fn grid(&self) -> Vec<Vec<f64>> {
        if self.dimensions == 0 {
            return Vec::new();
        }
        let divisions = self.divisions();
        let unit = self.total / divisions as f64;
        let mut points = Vec::new();
        let mut current = vec![0usize; self.dimensions];
        compositions(divisions, 0, &mut current, &mut |parts| {
            points.push(parts.iter().map(|&p| p as f64 * unit).collect());
        });
        points
    }

    pub fn search<F>(&self, mut objective: F) -> SearchResult
    where
        F: FnMut(&[f64]) -> f64,
    {
        let mut best: Vec<f64> = Vec::new();
        let mut best_score = f64::NEG_INFINITY;
        let mut evaluations = 0;

        for point in self.grid() {
            let score = objective(&point);
            evaluations += 1;
            if score > best_score {
                best_score = score;
                best = point;
            }
        }

        if best.is_empty() {
            return SearchResult {
                best,
                score: best_score,
                evaluations,
            };
        }

        // Shift mass between coordinate pairs while it helps
        let mut delta = self.total / self.divisions() as f64 / 2.0;
        for round in 0..self.refine_rounds {
            let mut improved = false;
            for from in 0..self.dimensions {
                for to in 0..self.dimensions {
                    if from == to || best[from] < delta {
                        continue;
                    }
                    let mut candidate = best.clone();
                    candidate[from] -= delta;
                    candidate[to] += delta;
                    let score = objective(&candidate);
                    evaluations += 1;
                    if score > best_score {
                        best_score = score;
                        best = candidate;
                        improved = true;
                    }
                }
            }
            debug!(round, delta, score = best_score, improved, "Coordinate refinement round");
            delta /= 2.0;
        }

        SearchResult {
            best,
            score: best_score,
            evaluations,
        }
    }
}

fn compositions<F: FnMut(&[usize])>(remaining: usize, index: usize, current: &mut Vec<usize>, emit: &mut F) {
    if index == current.len() - 1 {
        current[index] = remaining;
        emit(current);
        return;
    }
    for part in 0..=remaining {
        current[index] = part;
        compositions(remaining - part, index + 1, current, emit);
    }
}

pub fn ndcg_at_k(ranked: &[String], relevant: &HashSet<String>, k: usize) -> f64 {
    if relevant.is_empty() || k == 0 {
        return 0.0;
    }
    let dcg: f64 = ranked
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, id)| relevant.contains(*id))
        .map(|(rank, _)| 1.0 / (rank as f64 + 2.0).log2())
        .sum();
    let ideal: f64 = (0..relevant.len().min(k))
        .map(|rank| 1.0 / (rank as f64 + 2.0).log2())
        .sum();
    dcg / ideal
}

pub fn precision_at_k(ranked: &[String], relevant: &HashSet<String>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let hits = ranked.iter().take(k).filter(|id| relevant.contains(*id)).count();
    hits as f64 / k as f64
}

pub fn hit_rate_at_k(ranked: &[String], relevant: &HashSet<String>, k: usize) -> f64 {
    if ranked.iter().take(k).any(|id| relevant.contains(id)) {
        1.0
    } else {
        0.0
    }
}

/// Training rows plus, per user, the held-out item ids. Users with fewer than
/// two distinct items keep everything for training.
#[derive(Debug, Clone)]
pub struct HoldoutSplit {
    pub train: Vec<InteractionRow>,
    pub holdout: HashMap<String, HashSet<String>>,
}

pub fn holdout_split(rows: &[InteractionRow], fraction: f64, seed: u64) -> HoldoutSplit {
    let mut by_user: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for row in rows {
        let items = by_user.entry(row.user_id.as_str()).or_default();
        if !items.contains(&row.item_id.as_str()) {
            items.push(row.item_id.as_str());
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut holdout: HashMap<String, HashSet<String>> = HashMap::new();
    for (user, mut items) in by_user {
        if items.len() < 2 {
            continue;
        }
        items.sort_unstable();
        items.shuffle(&mut rng);
        let count = ((items.len() as f64 * fraction).ceil() as usize).clamp(1, items.len() - 1);
        holdout.insert(
            user.to_string(),
            items.into_iter().take(count).map(str::to_string).collect(),
        );
    }

    let train = rows
        .iter()
        .filter(|row| {
            holdout
                .get(&row.user_id)
                .map(|held| !held.contains(&row.item_id))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    HoldoutSplit { train, holdout }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningReport {
    pub weights: FusionWeights,
    pub k: usize,
    pub ndcg: f64,
    pub precision: f64,
    pub hit_rate: f64,
    pub validation_users: usize,
    pub evaluations: usize,
}

struct ValidationCase {
    contributions: Vec<(GeneratorKind, ScoredItems)>,
    known: HashSet<String>,
    relevant: HashSet<String>,
}

/// Tunes the Content/Latent weights of a training-epoch engine against the
/// held-out items
pub struct WeightTuner<'a> {
    engine: &'a HybridEngine,
    cases: Vec<ValidationCase>,
    k: usize,
}

impl<'a> WeightTuner<'a> {
    /// Recall runs once per validation user here; the search only re-fuses
    pub fn new(engine: &'a HybridEngine, holdout: &HashMap<String, HashSet<String>>, k: usize) -> Self {
        let mut users: Vec<&String> = holdout.keys().collect();
        users.sort();

        let cases = users
            .into_iter()
            .filter(|user| !engine.known_item_ids(user).is_empty())
            .map(|user| ValidationCase {
                contributions: engine.recall_offline(user),
                known: engine.known_item_ids(user),
                relevant: holdout[user].clone(),
            })
            .collect::<Vec<_>>();

        info!(validation_users = cases.len(), k, "Weight tuner prepared");
        Self { engine, cases, k }
    }

    pub fn validation_users(&self) -> usize {
        self.cases.len()
    }

    /// Mean (NDCG, precision, hit rate) @k for `weights`
    pub fn evaluate(&self, weights: FusionWeights) -> (f64, f64, f64) {
        if self.cases.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut totals = (0.0, 0.0, 0.0);
        for case in &self.cases {
            let ranked: Vec<String> = self
                .engine
                .rank_contributions(&case.contributions, weights, &case.known, self.k)
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            totals.0 += ndcg_at_k(&ranked, &case.relevant, self.k);
            totals.1 += precision_at_k(&ranked, &case.relevant, self.k);
            totals.2 += hit_rate_at_k(&ranked, &case.relevant, self.k);
        }
        let n = self.cases.len() as f64;
        (totals.0 / n, totals.1 / n, totals.2 / n)
    }

    pub fn tune(&self, step: f64, refine_rounds: usize) -> Result<TuningReport> {
        let base = self.engine.fusion_weights();
        let search = SimplexSearch {
            dimensions: base.tunable().len(),
            total: base.tunable_budget(),
            step,
            refine_rounds,
        };

        let result = search.search(|tunable| match base.with_tunable(tunable) {
            Ok(weights) => self.evaluate(weights).0,
            Err(_) => f64::NEG_INFINITY,
        });

        let weights = if result.best.is_empty() {
            base
        } else {
            base.with_tunable(&result.best)?
        };
        let (ndcg, precision, hit_rate) = self.evaluate(weights);

        info!(
            content = weights.content,
            latent = weights.latent,
            ndcg,
            evaluations = result.evaluations,
            "Weight tuning finished"
        );

        Ok(TuningReport {
            weights,
            k: self.k,
            ndcg,
            precision,
            hit_rate,
            validation_users: self.cases.len(),
            evaluations: result.evaluations,
        })
    }
}

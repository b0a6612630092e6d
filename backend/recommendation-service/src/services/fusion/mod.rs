//! Score fusion
//!
//! Each generator's raw scores are normalized to [0, 1] independently, blended
//! with one non-negative weight per generator, then penalized by item
//! popularity:
//!
//! `fused[i] = Σ_g weight[g] * norm[g][i] - penalty * popularity[i]`
//!
//! When even the best fused score is under the floor the pool is padded with
//! hot items so reranking never works on a degenerate, low-confidence list.

use crate::config::FusionSettings;
use crate::error::{EngineError, Result};
use crate::models::{GeneratorKind, ScoredItems};
use crate::utils::{normalize_score, sort_scored};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Per-generator fusion weights. ItemCF and UserCF are fixed by
/// configuration; Content and Latent are the tunable share.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub item_cf: f64,
    pub user_cf: f64,
    pub content: f64,
    pub latent: f64,
}

impl FusionWeights {
    pub fn new(item_cf: f64, user_cf: f64, content: f64, latent: f64) -> Result<Self> {
        let weights = Self {
            item_cf,
            user_cf,
            content,
            latent,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// Combine the fixed weights with a tunable vector `[content, latent]`
    pub fn with_tunable(&self, tunable: &[f64]) -> Result<Self> {
        match tunable {
            [content, latent] => Self::new(self.item_cf, self.user_cf, *content, *latent),
            _ => Err(EngineError::InvalidWeights(format!(
                "expected 2 tunable weights, got {}",
                tunable.len()
            ))),
        }
    }

    /// Share of the simplex left to the tunable generators
    pub fn tunable_budget(&self) -> f64 {
        1.0 - self.item_cf - self.user_cf
    }

    pub fn tunable(&self) -> [f64; 2] {
        [self.content, self.latent]
    }

    pub fn get(&self, kind: GeneratorKind) -> f64 {
        match kind {
            GeneratorKind::ItemCf => self.item_cf,
            GeneratorKind::UserCf => self.user_cf,
            GeneratorKind::Content => self.content,
            GeneratorKind::Latent => self.latent,
        }
    }

    pub fn sum(&self) -> f64 {
        self.item_cf + self.user_cf + self.content + self.latent
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.item_cf, self.user_cf, self.content, self.latent];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::InvalidWeights(format!(
                "weights must be non-negative: {:?}",
                all
            )));
        }
        if (self.sum() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::InvalidWeights(format!(
                "weights must sum to 1.0, got {:.6}",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    /// Divide by the list maximum
    Max,
    /// Map [min, max] onto [0, 1]
    MinMax,
}

impl Normalization {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "max" => Ok(Normalization::Max),
            "minmax" => Ok(Normalization::MinMax),
            other => Err(EngineError::InvalidWeights(format!(
                "unknown normalization {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub weights: FusionWeights,
    pub normalization: Normalization,
    pub popularity_penalty: f64,
    pub score_floor: f64,
}

impl FusionConfig {
    pub fn from_settings(settings: &FusionSettings) -> Result<Self> {
        Ok(Self {
            weights: FusionWeights::new(
                settings.weight_item_cf,
                settings.weight_user_cf,
                settings.weight_content,
                settings.weight_latent,
            )?,
            normalization: Normalization::parse(&settings.normalization)?,
            popularity_penalty: settings.popularity_penalty,
            score_floor: settings.score_floor,
        })
    }
}

/// Normalize one generator's list into [0, 1]. Order is preserved.
pub fn normalize(list: &[(String, f64)], mode: Normalization) -> ScoredItems {
    if list.is_empty() {
        return Vec::new();
    }
    let max = list.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let min = list.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);

    list.iter()
        .map(|(id, score)| {
            let normalized = match mode {
                Normalization::Max if max > 0.0 => (score / max).clamp(0.0, 1.0),
                Normalization::Max => 0.0,
                Normalization::MinMax => normalize_score(*score, min, max),
            };
            (id.clone(), normalized)
        })
        .collect()
}

/// Blend per-generator lists into one pool, highest fused score first
/// (ties by item id). `popularity` returns an item's normalized popularity.
pub fn fuse<P>(contributions: &[(GeneratorKind, ScoredItems)], config: &FusionConfig, popularity: P) -> ScoredItems
where
    P: Fn(&str) -> f64,
{
    let mut fused: HashMap<String, f64> = HashMap::new();

    for (kind, list) in contributions {
        let weight = config.weights.get(*kind);
        if list.is_empty() {
            continue;
        }
        for (item, score) in normalize(list, config.normalization) {
            *fused.entry(item).or_insert(0.0) += weight * score;
        }
    }

    let mut pool: ScoredItems = fused
        .into_iter()
        .map(|(item, score)| {
            let penalty = config.popularity_penalty * popularity(&item);
            (item, score - penalty)
        })
        .collect();
    sort_scored(&mut pool);

    debug!(candidates = pool.len(), "Fusion completed");
    pool
}

/// Pad `pool` with hot items. A weak pool (empty, or best score below
/// `floor`) is filled up to `target_len`; a strong pool shorter than `min_len`
/// is filled up to `min_len` so the caller can still serve a full page.
/// Padded items score `floor * popularity` and never repeat an item in `pool`
/// or in `exclude`. Returns how many items were added.
pub fn pad_with_hot_items(
    pool: &mut ScoredItems,
    hot_items: &[(String, f64)],
    floor: f64,
    min_len: usize,
    target_len: usize,
    exclude: &HashSet<String>,
) -> usize {
    let top = pool.first().map(|(_, s)| *s);
    let weak = !matches!(top, Some(score) if score >= floor);
    let wanted = if weak { target_len.max(min_len) } else { min_len };
    if pool.len() >= wanted {
        return 0;
    }

    let present: HashSet<String> = pool.iter().map(|(id, _)| id.clone()).collect();
    let mut added = 0;
    for (item, popularity) in hot_items {
        if pool.len() >= wanted {
            break;
        }
        if present.contains(item) || exclude.contains(item) {
            continue;
        }
        pool.push((item.clone(), floor * popularity));
        added += 1;
    }
    sort_scored(pool);

    if added > 0 {
        debug!(added, weak, top_score = ?top, "Candidate pool padded with hot items");
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[(&str, f64)]) -> ScoredItems {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn config() -> FusionConfig {
        FusionConfig::from_settings(&FusionSettings::default()).unwrap()
    }

    #[test]
    fn test_weights_validation() {
        assert!(FusionWeights::new(0.3, 0.2, 0.25, 0.25).is_ok());
        assert!(FusionWeights::new(0.3, 0.2, 0.3, 0.25).is_err());
        assert!(FusionWeights::new(0.3, 0.2, 0.6, -0.1).is_err());

        let base = FusionWeights::new(0.3, 0.2, 0.25, 0.25).unwrap();
        let tuned = base.with_tunable(&[0.4, 0.1]).unwrap();
        assert!((tuned.sum() - 1.0).abs() < 1e-6);
        assert!((base.tunable_budget() - 0.5).abs() < 1e-12);
        assert!(base.with_tunable(&[0.5]).is_err());
    }

    #[test]
    fn test_normalization_modes() {
        let raw = list(&[("a", 4.0), ("b", 2.0), ("c", 1.0)]);
        let max = normalize(&raw, Normalization::Max);
        assert_eq!(max[0].1, 1.0);
        assert_eq!(max[1].1, 0.5);

        let minmax = normalize(&raw, Normalization::MinMax);
        assert_eq!(minmax[2].1, 0.0);
        assert!((minmax[1].1 - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_scale_does_not_dominate() {
        // ItemCF scores are 100x larger but normalization equalizes them
        let contributions = vec![
            (GeneratorKind::ItemCf, list(&[("a", 100.0)])),
            (GeneratorKind::UserCf, list(&[("b", 1.0)])),
        ];
        let mut cfg = config();
        cfg.popularity_penalty = 0.0;
        let pool = fuse(&contributions, &cfg, |_| 0.0);
        assert_eq!(pool[0], ("a".to_string(), 0.3));
        assert_eq!(pool[1], ("b".to_string(), 0.2));
    }

    #[test]
    fn test_popularity_penalty_reorders() {
        let contributions = vec![(GeneratorKind::ItemCf, list(&[("hot", 1.0), ("niche", 0.9)]))];
        let mut cfg = config();
        cfg.popularity_penalty = 0.5;
        let pool = fuse(&contributions, &cfg, |id| if id == "hot" { 1.0 } else { 0.0 });
        assert_eq!(pool[0].0, "niche");
    }

    #[test]
    fn test_padding_only_below_floor() {
        let hot = list(&[("h1", 1.0), ("h2", 0.8), ("a", 0.5)]);
        let exclude: HashSet<String> = ["h2".to_string()].into_iter().collect();

        let mut strong = list(&[("a", 0.4)]);
        assert_eq!(pad_with_hot_items(&mut strong, &hot, 0.05, 1, 10, &exclude), 0);

        let mut weak = list(&[("a", 0.01)]);
        assert_eq!(pad_with_hot_items(&mut weak, &hot, 0.05, 1, 10, &exclude), 1);
        assert_eq!(weak[0].0, "h1");

        let mut empty = Vec::new();
        assert_eq!(pad_with_hot_items(&mut empty, &hot, 0.05, 0, 2, &HashSet::new()), 2);
    }

    #[test]
    fn test_short_strong_pool_padded_to_min_len() {
        let hot = list(&[("h1", 1.0), ("h2", 0.8), ("h3", 0.6), ("a", 0.5), ("h4", 0.4)]);
        let exclude: HashSet<String> = ["h2".to_string()].into_iter().collect();

        let mut pool = list(&[("a", 0.4), ("b", 0.3)]);
        let added = pad_with_hot_items(&mut pool, &hot, 0.05, 4, 10, &exclude);
        assert_eq!(added, 2);
        assert_eq!(pool.len(), 4);

        // Fused candidates keep their lead over padding
        assert_eq!(pool[0].0, "a");
        assert_eq!(pool[1].0, "b");
        let ids: Vec<&str> = pool.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(&ids[2..], &["h1", "h3"]);
        assert!(!ids.contains(&"h2"));

        let mut full = list(&[("a", 0.4), ("b", 0.3), ("c", 0.2), ("d", 0.1)]);
        assert_eq!(pad_with_hot_items(&mut full, &hot, 0.05, 4, 10, &exclude), 0);
    }
}

use super::EntityIndex;
use crate::config::ColdStartConfig;
use crate::models::{ItemRecord, PopularityTier, ScoredItems};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Item-side feature table for one epoch, indexed by the item `EntityIndex`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub items: EntityIndex,
    pub categories: Vec<String>,
    pub popularity: Vec<f64>,
    /// Popularity divided by the catalogue maximum, in [0, 1]
    pub normalized_popularity: Vec<f64>,
    pub tiers: Vec<PopularityTier>,
    pub features: Vec<Vec<f64>>,
}

impl Catalog {
    /// Build from item rows. Duplicate ids keep the first row.
    pub fn build(records: &[ItemRecord], tiers: &ColdStartConfig) -> Self {
        let mut items = EntityIndex::new();
        let mut categories = Vec::with_capacity(records.len());
        let mut popularity = Vec::with_capacity(records.len());
        let mut explicit_tiers = Vec::with_capacity(records.len());
        let mut features = Vec::with_capacity(records.len());
        let mut duplicates = 0usize;

        for record in records {
            if items.contains(&record.item_id) {
                duplicates += 1;
                continue;
            }
            items.get_or_insert(&record.item_id);
            categories.push(record.category.clone());
            popularity.push(if record.popularity.is_finite() {
                record.popularity.max(0.0)
            } else {
                0.0
            });
            explicit_tiers.push(record.tier);
            features.push(record.features.clone());
        }

        if duplicates > 0 {
            warn!(duplicates, "Duplicate item rows ignored");
        }

        let max_popularity = popularity.iter().cloned().fold(0.0_f64, f64::max);
        let normalized_popularity = popularity
            .iter()
            .map(|p| {
                if max_popularity > 0.0 {
                    p / max_popularity
                } else {
                    0.0
                }
            })
            .collect();

        let tiers = assign_tiers(&items, &popularity, &explicit_tiers, tiers);

        debug!(items = items.len(), "Catalog built");

        Self {
            items,
            categories,
            popularity,
            normalized_popularity,
            tiers,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn category_of(&self, item_id: &str) -> Option<&str> {
        self.items
            .index_of(item_id)
            .map(|idx| self.categories[idx as usize].as_str())
    }

    pub fn normalized_popularity_of(&self, item_id: &str) -> f64 {
        self.items
            .index_of(item_id)
            .map(|idx| self.normalized_popularity[idx as usize])
            .unwrap_or(0.0)
    }

    /// Item indices of one tier, most popular first
    pub fn tier_members(&self, tier: PopularityTier) -> Vec<u32> {
        let mut members: Vec<u32> = (0..self.len() as u32)
            .filter(|&idx| self.tiers[idx as usize] == tier)
            .collect();
        members.sort_by(|&a, &b| self.popularity_order(a, b));
        members
    }

    /// Most popular items with their normalized popularity
    pub fn hot_items(&self, limit: usize) -> ScoredItems {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.sort_by(|&a, &b| self.popularity_order(a, b));
        order
            .into_iter()
            .take(limit)
            .filter_map(|idx| {
                self.items
                    .id_of(idx)
                    .map(|id| (id.to_string(), self.normalized_popularity[idx as usize]))
            })
            .collect()
    }

    fn popularity_order(&self, a: u32, b: u32) -> Ordering {
        self.popularity[b as usize]
            .partial_cmp(&self.popularity[a as usize])
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.items.id_of(a).cmp(&self.items.id_of(b)))
    }
}

/// Explicit tiers win; the rest are ranked by popularity: the top
/// `hit_tier_fraction` become hits, the next `popular_tier_fraction` popular.
fn assign_tiers(
    items: &EntityIndex,
    popularity: &[f64],
    explicit: &[Option<PopularityTier>],
    config: &ColdStartConfig,
) -> Vec<PopularityTier> {
    let n = popularity.len();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        popularity[b]
            .partial_cmp(&popularity[a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| items.id_of(a as u32).cmp(&items.id_of(b as u32)))
    });

    let hit_count = ((n as f64 * config.hit_tier_fraction).ceil() as usize).clamp(1, n);
    let popular_count =
        ((n as f64 * config.popular_tier_fraction).ceil() as usize).min(n - hit_count);

    let mut tiers = vec![PopularityTier::Normal; n];
    for (rank, &idx) in order.iter().enumerate() {
        tiers[idx] = match explicit[idx] {
            Some(tier) => tier,
            None if rank < hit_count => PopularityTier::Hit,
            None if rank < hit_count + popular_count => PopularityTier::Popular,
            None => PopularityTier::Normal,
        };
    }
    tiers
}

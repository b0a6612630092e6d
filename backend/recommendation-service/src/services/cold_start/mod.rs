// ============================================
// Cold-Start Handler
// ============================================
//
// Serves users with no usable history from the hit and popular tiers.
//
// - Without a profile: ~hit_ratio of the list from `hit`, the rest from
//   `popular`, each drawn at random so cold users do not all see one list.
// - With a profile: the draw is restricted to the preferred categories and
//   the hit share leans towards the user's popularity bias. Shortfalls are
//   topped up from the unrestricted tiers.
//
// Never fails; an empty catalogue yields an empty list.

use crate::models::{PopularityTier, Recommendation, UserProfile};
use crate::services::index::Catalog;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct ColdStartHandler {
    catalog: Arc<Catalog>,
    hit_ratio: f64,
}

impl ColdStartHandler {
    pub fn new(catalog: Arc<Catalog>, hit_ratio: f64) -> Self {
        Self {
            catalog,
            hit_ratio: hit_ratio.clamp(0.0, 1.0),
        }
    }

    /// Hit share for this user
    pub fn effective_hit_ratio(&self, profile: Option<&UserProfile>) -> f64 {
        match profile.and_then(|p| p.popularity_bias) {
            Some(bias) => ((self.hit_ratio + bias.clamp(0.0, 1.0)) / 2.0).clamp(0.0, 1.0),
            None => self.hit_ratio,
        }
    }

    /// Up to `n` items, all marked cold-start, never repeating `exclude`
    pub fn recommend<R: Rng + ?Sized>(
        &self,
        profile: Option<&UserProfile>,
        n: usize,
        exclude: &HashSet<String>,
        rng: &mut R,
    ) -> Vec<Recommendation> {
        if n == 0 {
            return Vec::new();
        }

        let ratio = self.effective_hit_ratio(profile);
        let hits = self.pool(PopularityTier::Hit, exclude);
        let popular = self.pool(PopularityTier::Popular, exclude);

        let categories: HashSet<&str> = profile
            .map(|p| p.top_categories.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let mut chosen: Vec<u32> = Vec::with_capacity(n);
        if !categories.is_empty() {
            let in_categories = |idx: &u32| categories.contains(self.catalog.categories[*idx as usize].as_str());
            let restricted_hits: Vec<u32> = hits.iter().copied().filter(in_categories).collect();
            let restricted_popular: Vec<u32> = popular.iter().copied().filter(in_categories).collect();
            chosen = draw(&restricted_hits, &restricted_popular, n, ratio, rng);
        }

        if chosen.len() < n {
            let taken: HashSet<u32> = chosen.iter().copied().collect();
            let rest_hits: Vec<u32> = hits.into_iter().filter(|i| !taken.contains(i)).collect();
            let rest_popular: Vec<u32> = popular.into_iter().filter(|i| !taken.contains(i)).collect();
            let top_up = draw(&rest_hits, &rest_popular, n - chosen.len(), ratio, rng);
            chosen.extend(top_up);
        }

        let mut recommendations: Vec<Recommendation> = chosen
            .into_iter()
            .filter_map(|idx| {
                self.catalog.items.id_of(idx).map(|id| Recommendation {
                    item_id: id.to_string(),
                    score: self.catalog.normalized_popularity[idx as usize],
                    is_cold_start: true,
                })
            })
            .collect();
        recommendations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        debug!(
            requested = n,
            returned = recommendations.len(),
            hit_ratio = ratio,
            restricted = !categories.is_empty(),
            "Cold-start recommendations"
        );
        recommendations
    }

    fn pool(&self, tier: PopularityTier, exclude: &HashSet<String>) -> Vec<u32> {
        self.catalog
            .tier_members(tier)
            .into_iter()
            .filter(|idx| {
                self.catalog
                    .items
                    .id_of(*idx)
                    .map(|id| !exclude.contains(id))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Random draw of `n` items: `round(n * ratio)` from `hits`, the rest from
/// `popular`, each side's shortfall filled from the other.
fn draw<R: Rng + ?Sized>(hits: &[u32], popular: &[u32], n: usize, ratio: f64, rng: &mut R) -> Vec<u32> {
    let hit_target = (((n as f64) * ratio).round() as usize).min(n);
    let popular_fit = (n - hit_target).min(popular.len());
    let hit_take = (n - popular_fit).min(hits.len());
    let popular_take = (n - hit_take).min(popular.len());

    let mut out: Vec<u32> = hits.choose_multiple(rng, hit_take).copied().collect();
    out.extend(popular.choose_multiple(rng, popular_take).copied());
    out.truncate(n);
    out
}

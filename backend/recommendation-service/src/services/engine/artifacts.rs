use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::models::{NeighborTable, UserProfile, UserRecord};
use crate::services::content::build_content_neighbors;
use crate::services::index::{build_interactions, Catalog, EntityIndex, IndexedInteractions, InteractionMatrix};
use crate::services::latent::{factorize, LatentFactors, LshIndex};
use crate::services::neighbors::{build_item_neighbors, build_user_cf_aggregates, build_user_neighbors};
use crate::services::recall::InteractionView;
use crate::services::snapshot::Snapshot;
use artifact_cache::{ArtifactCache, ArtifactKey};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything derived from one snapshot. Immutable once built; a new epoch
/// builds a new value and the handle swaps it in whole.
pub struct EpochArtifacts {
    pub epoch_id: String,
    pub catalog: Arc<Catalog>,
    pub users: Arc<EntityIndex>,
    pub matrix: Arc<InteractionMatrix>,
    pub profiles: Arc<HashMap<String, UserRecord>>,
    /// `None` when the rank was too low for this epoch
    pub factors: Option<Arc<LatentFactors>>,
    pub ann: Option<Arc<LshIndex>>,
    pub content_neighbors: Arc<NeighborTable>,
    pub item_neighbors: Arc<NeighborTable>,
    pub user_neighbors: Arc<NeighborTable>,
    pub user_cf: Arc<NeighborTable>,
}

impl EpochArtifacts {
    /// Build every artifact for `snapshot`, reusing cached ones. Cache keys
    /// carry the epoch id plus a fingerprint of the parameters that shaped
    /// the artifact, so a config change never reads a stale layout.
    pub fn build(snapshot: &Snapshot, config: &Config, cache: &ArtifactCache) -> Result<Self> {
        let started = Instant::now();
        let epoch = snapshot.epoch_id.as_str();

        let catalog = Arc::new(Catalog::build(&snapshot.items, &config.cold_start));
        if catalog.is_empty() {
            return Err(EngineError::Dataset("catalog is empty".to_string()));
        }

        let known_users: Option<HashSet<String>> = snapshot
            .users
            .as_ref()
            .map(|users| users.iter().map(|u| u.user_id.clone()).collect());

        let interactions: IndexedInteractions = cache.load_or_build(
            &key(epoch, "interactions", &config.weighting),
            || {
                build_interactions(
                    &snapshot.interactions,
                    &catalog,
                    known_users.as_ref(),
                    &config.weighting,
                )
            },
        )?;
        let IndexedInteractions { users, matrix, .. } = interactions;

        let latent_key = key(epoch, "latent_factors", &(&config.weighting, &config.latent));
        let factors: Option<LatentFactors> = match cache.load_or_build(&latent_key, || {
            factorize(&matrix, &config.latent)
        }) {
            Ok(factors) => Some(factors),
            Err(EngineError::RankTooLow {
                requested,
                clamped,
                minimum,
            }) => {
                warn!(
                    requested,
                    clamped, minimum, "Rank too low, latent recall disabled for this epoch"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let ann = match (&factors, config.latent.use_ann) {
            (Some(factors), true) => {
                let index: LshIndex = cache.load_or_build(
                    &key(epoch, "latent_ann", &(&config.weighting, &config.latent)),
                    || -> Result<LshIndex> {
                        Ok(LshIndex::build(
                            &factors.item_factors,
                            config.latent.ann_hyperplanes,
                            config.latent.ann_tables,
                            config.latent.seed,
                        ))
                    },
                )?;
                Some(Arc::new(index))
            }
            _ => None,
        };

        let recall = &config.recall;
        let content_neighbors: NeighborTable = cache.load_or_build(
            &key(epoch, "content_neighbors", &(recall.neighbor_k, recall.content_min_similarity)),
            || -> Result<NeighborTable> {
                Ok(build_content_neighbors(
                    &catalog,
                    recall.neighbor_k,
                    recall.content_min_similarity,
                ))
            },
        )?;

        let item_neighbors: NeighborTable = cache.load_or_build(
            &key(
                epoch,
                "item_neighbors",
                &(
                    &config.weighting,
                    recall.neighbor_k,
                    recall.item_min_similarity,
                    recall.max_items_per_user,
                ),
            ),
            || -> Result<NeighborTable> {
                Ok(build_item_neighbors(
                    &matrix,
                    &catalog.items,
                    recall.neighbor_k,
                    recall.item_min_similarity,
                    recall.max_items_per_user,
                ))
            },
        )?;

        let user_neighbor_params = (
            &config.weighting,
            factors.as_ref().map(|_| &config.latent),
            recall.neighbor_k,
        );
        let user_neighbors: NeighborTable = cache.load_or_build(
            &key(epoch, "user_neighbors", &user_neighbor_params),
            || -> Result<NeighborTable> {
                Ok(build_user_neighbors(
                    &matrix,
                    &users,
                    factors.as_ref(),
                    recall.neighbor_k,
                ))
            },
        )?;

        let user_cf: NeighborTable = cache.load_or_build(
            &key(
                epoch,
                "user_cf",
                &(user_neighbor_params, recall.user_cf_candidates),
            ),
            || -> Result<NeighborTable> {
                Ok(build_user_cf_aggregates(
                    &matrix,
                    &users,
                    &catalog.items,
                    &user_neighbors,
                    recall.user_cf_candidates,
                ))
            },
        )?;

        let profiles: HashMap<String, UserRecord> = snapshot
            .users
            .iter()
            .flatten()
            .map(|u| (u.user_id.clone(), u.clone()))
            .collect();

        info!(
            epoch_id = %epoch,
            users = users.len(),
            items = catalog.len(),
            latent_rank = factors.as_ref().map(|f| f.rank()),
            ann = ann.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Epoch artifacts ready"
        );

        Ok(Self {
            epoch_id: snapshot.epoch_id.clone(),
            catalog,
            users: Arc::new(users),
            matrix: Arc::new(matrix),
            profiles: Arc::new(profiles),
            factors: factors.map(Arc::new),
            ann,
            content_neighbors: Arc::new(content_neighbors),
            item_neighbors: Arc::new(item_neighbors),
            user_neighbors: Arc::new(user_neighbors),
            user_cf: Arc::new(user_cf),
        })
    }

    pub fn view(&self) -> Arc<InteractionView> {
        Arc::new(InteractionView {
            users: Arc::clone(&self.users),
            items: Arc::new(self.catalog.items.clone()),
            matrix: Arc::clone(&self.matrix),
        })
    }

    /// Derived profile: interaction count from the matrix, preferences from
    /// the user table
    pub fn profile(&self, user_id: &str) -> UserProfile {
        let known_interactions = self
            .users
            .index_of(user_id)
            .map(|u| self.matrix.row_len(u))
            .unwrap_or(0);
        match self.profiles.get(user_id) {
            Some(record) => UserProfile {
                known_interactions,
                top_categories: record.top_categories.clone(),
                popularity_bias: Some(record.popularity_bias),
            },
            None => UserProfile {
                known_interactions,
                ..UserProfile::default()
            },
        }
    }
}

fn key<P: Debug>(epoch_id: &str, kind: &str, params: &P) -> ArtifactKey {
    let digest = Sha256::digest(format!("{:?}", params).as_bytes());
    let mut fingerprint = hex::encode(digest);
    fingerprint.truncate(8);
    ArtifactKey::new(epoch_id, format!("{}_{}", kind, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatentConfig;
    use crate::models::{InteractionKind, InteractionRow, ItemRecord};

    fn snapshot(epoch: &str) -> Snapshot {
        let items = (0..6)
            .map(|i| ItemRecord {
                item_id: format!("i{}", i),
                category: if i < 3 { "rock".into() } else { "jazz".into() },
                popularity: (10 - i) as f64,
                features: vec![i as f64, (i % 3) as f64],
                tier: None,
            })
            .collect();
        let pairs = [("u1", "i0"), ("u1", "i1"), ("u2", "i1"), ("u2", "i2"), ("u3", "i3"), ("ghost", "zz")];
        let interactions = pairs
            .iter()
            .map(|(u, i)| InteractionRow {
                user_id: u.to_string(),
                item_id: i.to_string(),
                play_count: 3,
                kinds: vec![],
            })
            .collect();
        Snapshot {
            epoch_id: epoch.to_string(),
            items,
            users: None,
            interactions,
        }
    }

    #[test]
    fn test_small_dataset_disables_latent() {
        let cache = ArtifactCache::in_memory();
        let artifacts = EpochArtifacts::build(&snapshot("e1"), &Config::for_snapshot("/tmp"), &cache).unwrap();

        // 3 users x 6 items clamps rank to 2 < 10
        assert!(artifacts.factors.is_none());
        assert_eq!(artifacts.users.len(), 3);
        assert!(!artifacts.item_neighbors.get("i1").is_empty());
        assert_eq!(artifacts.profile("u1").known_interactions, 2);
        assert_eq!(artifacts.profile("nobody").known_interactions, 0);
    }

    #[test]
    fn test_second_build_hits_cache() {
        let cache = ArtifactCache::in_memory();
        let mut config = Config::for_snapshot("/tmp");
        config.latent = LatentConfig {
            min_rank: 1,
            ..LatentConfig::default()
        };

        let first = EpochArtifacts::build(&snapshot("e1"), &config, &cache).unwrap();
        let misses = cache.stats().misses;
        let second = EpochArtifacts::build(&snapshot("e1"), &config, &cache).unwrap();

        assert!(first.factors.is_some());
        assert_eq!(cache.stats().misses, misses);
        assert!(cache.stats().hits > 0);
        assert_eq!(first.item_neighbors.get("i1"), second.item_neighbors.get("i1"));
    }

    #[test]
    fn test_weighting_change_rebuilds_factors() {
        let cache = ArtifactCache::in_memory();
        let mut snap = snapshot("e1");
        for row in snap.interactions.iter_mut() {
            if (row.user_id == "u1" && row.item_id == "i0") || (row.user_id == "u2" && row.item_id == "i2") {
                row.kinds = vec![InteractionKind::Like];
            }
        }
        let mut config = Config::for_snapshot("/tmp");
        config.latent = LatentConfig {
            min_rank: 1,
            ..LatentConfig::default()
        };

        let first = EpochArtifacts::build(&snap, &config, &cache).unwrap();
        let misses = cache.stats().misses;

        config.weighting.like_bonus = 10.0;
        let second = EpochArtifacts::build(&snap, &config, &cache).unwrap();
        assert!(cache.stats().misses > misses);

        let before = &first.factors.as_ref().unwrap().singular_values;
        let after = &second.factors.as_ref().unwrap().singular_values;
        assert!((before[0] - after[0]).abs() > 1e-6);

        let fresh = EpochArtifacts::build(&snap, &config, &ArtifactCache::in_memory()).unwrap();
        let expected = &fresh.factors.as_ref().unwrap().singular_values;
        assert!((expected[0] - after[0]).abs() < 1e-9);
    }

    #[test]
    fn test_no_valid_rows_is_dataset_error() {
        let mut snap = snapshot("e2");
        snap.interactions.retain(|row| row.user_id == "ghost");
        let result = EpochArtifacts::build(&snap, &Config::for_snapshot("/tmp"), &ArtifactCache::in_memory());
        assert!(matches!(result, Err(EngineError::Dataset(_))));
    }
}

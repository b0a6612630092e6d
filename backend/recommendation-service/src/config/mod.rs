use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be a valid {expected} (got {value:?})")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub data: DataConfig,
    pub cache: CacheConfig,
    pub weighting: WeightingConfig,
    pub latent: LatentConfig,
    pub recall: RecallConfig,
    pub fusion: FusionSettings,
    pub cold_start: ColdStartConfig,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Hybrid,
    Popularity,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(EngineKind::Hybrid),
            "popularity" => Ok(EngineKind::Popularity),
            other => Err(format!("unknown engine kind {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub worker_threads: usize,
    pub max_in_flight_requests: usize,
    pub request_timeout_ms: u64,
    pub init_wait_timeout_ms: u64,
    pub engine_kind: EngineKind,
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.init_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub snapshot_dir: PathBuf,
    pub fallback_hot_list_path: PathBuf,
    pub epoch_refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Fs,
    Redis,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fs" | "file" => Ok(CacheBackend::Fs),
            "redis" => Ok(CacheBackend::Redis),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(format!("unknown cache backend {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub dir: PathBuf,
    pub redis_url: String,
    pub user_memo_ttl_secs: u64,
}

/// Categorical bonuses added on top of `ln(1 + play_count)`
#[derive(Debug, Clone, Deserialize)]
pub struct WeightingConfig {
    pub like_bonus: f64,
    pub collect_bonus: f64,
    pub share_bonus: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            like_bonus: 1.0,
            collect_bonus: 1.5,
            share_bonus: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatentConfig {
    pub rank: usize,
    pub min_rank: usize,
    pub seed: u64,
    pub power_iters: usize,
    pub use_ann: bool,
    pub ann_hyperplanes: usize,
    pub ann_tables: usize,
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            rank: 32,
            min_rank: 10,
            seed: 42,
            power_iters: 2,
            use_ann: false,
            ann_hyperplanes: 12,
            ann_tables: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecallConfig {
    pub neighbor_k: usize,
    pub content_min_similarity: f64,
    pub item_min_similarity: f64,
    pub content_seed_items: usize,
    pub user_cf_candidates: usize,
    pub generator_limit: usize,
    pub max_items_per_user: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            neighbor_k: 20,
            content_min_similarity: 0.1,
            item_min_similarity: 0.0,
            content_seed_items: 10,
            user_cf_candidates: 100,
            generator_limit: 200,
            max_items_per_user: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionSettings {
    pub weight_item_cf: f64,
    pub weight_user_cf: f64,
    pub weight_content: f64,
    pub weight_latent: f64,
    /// `max` or `minmax`
    pub normalization: String,
    pub popularity_penalty: f64,
    pub score_floor: f64,
    pub mmr_lambda: f64,
    pub mmr_pool_multiplier: usize,
    pub same_category_similarity: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            weight_item_cf: 0.3,
            weight_user_cf: 0.2,
            weight_content: 0.25,
            weight_latent: 0.25,
            normalization: "max".to_string(),
            popularity_penalty: 0.1,
            score_floor: 0.05,
            mmr_lambda: 0.6,
            mmr_pool_multiplier: 3,
            same_category_similarity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColdStartConfig {
    pub min_interactions: usize,
    pub hit_ratio: f64,
    pub hit_tier_fraction: f64,
    pub popular_tier_fraction: f64,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            min_interactions: 3,
            hit_ratio: 0.6,
            hit_tier_fraction: 0.05,
            popular_tier_fraction: 0.20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Config {
            service: ServiceConfig {
                service_name: env::var("SERVICE_NAME")
                    .unwrap_or_else(|_| "recommendation-service".to_string()),
                worker_threads: parse_env("WORKER_THREADS", 4, "usize")?,
                max_in_flight_requests: parse_env("MAX_IN_FLIGHT_REQUESTS", 64, "usize")?,
                request_timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 250, "u64")?,
                init_wait_timeout_ms: parse_env("INIT_WAIT_TIMEOUT_MS", 30_000, "u64")?,
                engine_kind: parse_env("ENGINE_KIND", EngineKind::Hybrid, "engine kind")?,
            },
            data: DataConfig {
                snapshot_dir: env::var("SNAPSHOT_DIR")
                    .unwrap_or_else(|_| "./data/snapshot".to_string())
                    .into(),
                fallback_hot_list_path: env::var("FALLBACK_HOT_LIST_PATH")
                    .unwrap_or_else(|_| "./data/fallback_hot_items.json".to_string())
                    .into(),
                epoch_refresh_interval_secs: parse_env("EPOCH_REFRESH_INTERVAL_SECS", 900, "u64")?,
            },
            cache: CacheConfig {
                backend: parse_env("ARTIFACT_CACHE_BACKEND", CacheBackend::Fs, "cache backend")?,
                dir: env::var("ARTIFACT_CACHE_DIR")
                    .unwrap_or_else(|_| "./data/artifacts".to_string())
                    .into(),
                redis_url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                user_memo_ttl_secs: parse_env("USER_MEMO_TTL_SECS", 300, "u64")?,
            },
            weighting: WeightingConfig {
                like_bonus: parse_env("LIKE_BONUS", 1.0, "f64")?,
                collect_bonus: parse_env("COLLECT_BONUS", 1.5, "f64")?,
                share_bonus: parse_env("SHARE_BONUS", 0.5, "f64")?,
            },
            latent: LatentConfig {
                rank: parse_env("LATENT_RANK", 32, "usize")?,
                min_rank: parse_env("LATENT_MIN_RANK", 10, "usize")?,
                seed: parse_env("LATENT_SEED", 42, "u64")?,
                power_iters: parse_env("LATENT_POWER_ITERS", 2, "usize")?,
                use_ann: parse_env("LATENT_USE_ANN", false, "bool")?,
                ann_hyperplanes: parse_env("ANN_HYPERPLANES", 12, "usize")?,
                ann_tables: parse_env("ANN_TABLES", 4, "usize")?,
            },
            recall: RecallConfig {
                neighbor_k: parse_env("NEIGHBOR_K", 20, "usize")?,
                content_min_similarity: parse_env("CONTENT_MIN_SIMILARITY", 0.1, "f64")?,
                item_min_similarity: parse_env("ITEM_MIN_SIMILARITY", 0.0, "f64")?,
                content_seed_items: parse_env("CONTENT_SEED_ITEMS", 10, "usize")?,
                user_cf_candidates: parse_env("USER_CF_CANDIDATES", 100, "usize")?,
                generator_limit: parse_env("GENERATOR_LIMIT", 200, "usize")?,
                max_items_per_user: parse_env("MAX_ITEMS_PER_USER", 200, "usize")?,
            },
            fusion: FusionSettings {
                weight_item_cf: parse_env("WEIGHT_ITEM_CF", 0.3, "f64")?,
                weight_user_cf: parse_env("WEIGHT_USER_CF", 0.2, "f64")?,
                weight_content: parse_env("WEIGHT_CONTENT", 0.25, "f64")?,
                weight_latent: parse_env("WEIGHT_LATENT", 0.25, "f64")?,
                normalization: env::var("FUSION_NORMALIZATION")
                    .unwrap_or_else(|_| "max".to_string()),
                popularity_penalty: parse_env("POPULARITY_PENALTY", 0.1, "f64")?,
                score_floor: parse_env("SCORE_FLOOR", 0.05, "f64")?,
                mmr_lambda: parse_env("MMR_LAMBDA", 0.6, "f64")?,
                mmr_pool_multiplier: parse_env("MMR_POOL_MULTIPLIER", 3, "usize")?,
                same_category_similarity: parse_env("SAME_CATEGORY_SIMILARITY", 0.5, "f64")?,
            },
            cold_start: ColdStartConfig {
                min_interactions: parse_env("COLD_START_MIN_INTERACTIONS", 3, "usize")?,
                hit_ratio: parse_env("COLD_START_HIT_RATIO", 0.6, "f64")?,
                hit_tier_fraction: parse_env("HIT_TIER_FRACTION", 0.05, "f64")?,
                popular_tier_fraction: parse_env("POPULAR_TIER_FRACTION", 0.20, "f64")?,
            },
            breaker: BreakerConfig {
                failure_threshold: parse_env("BREAKER_FAILURE_THRESHOLD", 5, "u32")?,
                cooldown_ms: parse_env("BREAKER_COOLDOWN_MS", 30_000, "u64")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults for every section, with data paths rooted at `snapshot_dir`.
    /// Used by tests and the tuning job.
    pub fn for_snapshot(snapshot_dir: impl Into<PathBuf>) -> Self {
        let snapshot_dir = snapshot_dir.into();
        let fallback_hot_list_path = snapshot_dir.join("fallback_hot_items.json");
        Config {
            service: ServiceConfig {
                service_name: "recommendation-service".to_string(),
                worker_threads: 4,
                max_in_flight_requests: 64,
                request_timeout_ms: 250,
                init_wait_timeout_ms: 30_000,
                engine_kind: EngineKind::Hybrid,
            },
            data: DataConfig {
                snapshot_dir,
                fallback_hot_list_path,
                epoch_refresh_interval_secs: 900,
            },
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                dir: PathBuf::from("./data/artifacts"),
                redis_url: "redis://localhost:6379".to_string(),
                user_memo_ttl_secs: 300,
            },
            weighting: WeightingConfig::default(),
            latent: LatentConfig::default(),
            recall: RecallConfig::default(),
            fusion: FusionSettings::default(),
            cold_start: ColdStartConfig::default(),
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown_ms: 30_000,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.fusion;
        let weights = [
            f.weight_item_cf,
            f.weight_user_cf,
            f.weight_content,
            f.weight_latent,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ConfigError::Invalid(
                "fusion weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "fusion weights must sum to 1.0 (got {:.6})",
                sum
            )));
        }
        if !matches!(f.normalization.as_str(), "max" | "minmax") {
            return Err(ConfigError::InvalidValue {
                key: "FUSION_NORMALIZATION",
                value: f.normalization.clone(),
                expected: "normalization (max|minmax)",
            });
        }
        if !(0.0..=1.0).contains(&f.mmr_lambda) {
            return Err(ConfigError::Invalid("MMR_LAMBDA must be within [0, 1]".to_string()));
        }
        if f.mmr_pool_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "MMR_POOL_MULTIPLIER must be at least 1".to_string(),
            ));
        }

        let c = &self.cold_start;
        for (key, value) in [
            ("COLD_START_HIT_RATIO", c.hit_ratio),
            ("HIT_TIER_FRACTION", c.hit_tier_fraction),
            ("POPULAR_TIER_FRACTION", c.popular_tier_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{} must be within [0, 1]", key)));
            }
        }

        if self.recall.neighbor_k == 0 {
            return Err(ConfigError::Invalid("NEIGHBOR_K must be at least 1".to_string()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "BREAKER_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.service.max_in_flight_requests == 0 || self.service.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_THREADS and MAX_IN_FLIGHT_REQUESTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value,
            expected,
        }),
        Err(_) => Ok(default),
    }
}

use crate::config::ConfigError;
use thiserror::Error;

/// Engine error taxonomy.
///
/// Only `Dataset` is fatal for an epoch build; `RankTooLow` disables latent
/// recall. A forced single generator that fails reports `TransientGenerator`
/// and an id missing from the index reports `UnknownEntity`; the engine turns
/// both into cold start. Callers of `recommend` see `ServiceUnavailable` or
/// `EmptyCandidatePool` at most.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Rank too low: requested {requested}, clamped to {clamped}, minimum {minimum}")]
    RankTooLow {
        requested: usize,
        clamped: usize,
        minimum: usize,
    },

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Generator {generator} failed: {reason}")]
    TransientGenerator {
        generator: &'static str,
        reason: String,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("No candidates available for user {0}")]
    EmptyCandidatePool(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Artifact cache error: {0}")]
    Cache(#[from] artifact_cache::CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Invalid fusion weights: {0}")]
    InvalidWeights(String),
}

impl EngineError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ServiceUnavailable(_) | EngineError::TransientGenerator { .. }
        )
    }

    /// Errors that say nothing about the engine's health. They do not count
    /// against the circuit breaker.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyCandidatePool(_) | EngineError::UnknownEntity(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Snapshot(err.to_string())
    }
}

/// Failure of a single candidate generator. Always contained by the recall
/// layer and turned into an empty contribution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("generator failed: {0}")]
    Failed(String),

    #[error("generator cancelled")]
    Cancelled,

    #[error("generator timed out")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, EngineError>;

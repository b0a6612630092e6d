pub mod cold_start;
pub mod content;
pub mod diversity;
pub mod engine;
pub mod fusion;
pub mod handle;
pub mod index;
pub mod latent;
pub mod neighbors;
pub mod recall;
pub mod snapshot;
pub mod tuning;

pub use cold_start::ColdStartHandler;
pub use diversity::DiversityLayer;
pub use engine::{factory_for, EngineFactory, HybridEngine, RecommendationEngine};
pub use handle::{EngineHandle, EngineState, HealthReport};
pub use recall::RecallLayer;

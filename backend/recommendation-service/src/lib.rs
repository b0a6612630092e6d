pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, Result};
pub use services::{
    factory_for, ColdStartHandler, DiversityLayer, EngineFactory, EngineHandle, EngineState, HealthReport,
    HybridEngine, RecallLayer, RecommendationEngine,
};

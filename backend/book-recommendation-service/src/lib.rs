pub mod config;
pub mod consumers;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use engine::RecommendationEngine;
pub use error::{RecommendationError, Result};
pub use services::{
    BookCatalog, FeedbackTracker, HttpScoringOracle, Orchestrator, RecommendationCache,
    ScoringOracle, SignalHandler, SimilarityIndex, UserProfileStore,
};

pub mod cache;
pub mod catalog;
pub mod feedback;
pub mod oracle;
pub mod orchestrator;
pub mod profile_store;
pub mod signals;
pub mod similarity;
pub mod strategies;

pub use cache::{InvalidationSink, RecommendationCache};
pub use catalog::BookCatalog;
pub use feedback::FeedbackTracker;
pub use oracle::{HttpScoringOracle, ScoringOracle};
pub use orchestrator::Orchestrator;
pub use profile_store::UserProfileStore;
pub use signals::{SignalHandler, SignalOutcome, TrainingSignal};
pub use similarity::SimilarityIndex;

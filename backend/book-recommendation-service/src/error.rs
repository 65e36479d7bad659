use crate::models::StrategyKind;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecommendationError>;

/// Errors surfaced by the recommendation core.
///
/// `Clone` so one single-flight outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecommendationError {
    /// Malformed request or ingestion input; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// A generator or oracle call exceeded its budget
    #[error("Upstream timeout: {strategy} exceeded {budget:?}")]
    UpstreamTimeout {
        strategy: &'static str,
        budget: Duration,
    },

    /// Every selected generator failed or timed out; retryable
    #[error("Recommendations unavailable: {0}")]
    RecommendationUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecommendationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecommendationError::RecommendationUnavailable(_)
                | RecommendationError::UpstreamTimeout { .. }
        )
    }
}

impl From<validator::ValidationErrors> for RecommendationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        RecommendationError::Validation(errors.to_string())
    }
}

/// Failure of a single generator; contained by the orchestrator.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("{0} strategy is missing required input: {1}")]
    MissingInput(&'static str, String),

    #[error("{strategy} strategy failed: {source}")]
    Failed {
        strategy: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl StrategyError {
    pub fn failed(kind: StrategyKind, source: impl Into<anyhow::Error>) -> Self {
        StrategyError::Failed {
            strategy: kind.as_str(),
            source: source.into(),
        }
    }
}

/// Reject empty identifiers at ingestion boundaries.
pub fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RecommendationError::Validation(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

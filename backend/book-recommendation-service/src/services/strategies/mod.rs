mod contextual;
mod exploratory;
mod multi_objective;
mod personalized;
mod sequential;
mod social;

use crate::error::StrategyError;
use crate::models::{Book, BookId, RecommendationRequest, StrategyKind, UserProfile};
use crate::services::catalog::CatalogSnapshot;
use crate::services::similarity::SimilaritySnapshot;
use crate::utils::rank_order;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub use contextual::{ContextBoosts, ContextualStrategy};
pub use exploratory::ExploratoryStrategy;
pub use multi_objective::{MultiObjectiveStrategy, ObjectiveWeights};
pub use personalized::PersonalizedStrategy;
pub use sequential::SequentialStrategy;
pub use social::{GroupStrategy, SocialStrategy};

/// Everything a generator may read during one orchestration run
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub profile: UserProfile,
    pub request: RecommendationRequest,
    pub catalog: Arc<CatalogSnapshot>,
    pub similarity: Arc<SimilaritySnapshot>,
    /// Books that must not be proposed (completed, rejected, ...)
    pub excluded: HashSet<BookId>,
    /// Max candidates one generator emits
    pub limit: usize,
}

impl GenerationContext {
    /// Not excluded and admitted by the request filters
    pub fn is_eligible(&self, book: &Book) -> bool {
        !self.excluded.contains(&book.id) && self.request.filters.admits(book)
    }

    pub fn eligible_books(&self) -> impl Iterator<Item = &Book> {
        self.catalog.books().filter(move |b| self.is_eligible(b))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBook {
    pub book_id: BookId,
    pub score: f64,
    pub explanation: String,
}

impl ScoredBook {
    pub fn new(book_id: impl Into<BookId>, score: f64, explanation: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            score,
            explanation: explanation.into(),
        }
    }
}

/// Ranked generator output
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub candidates: Vec<ScoredBook>,
    /// Produced with a fallback (e.g. oracle unavailable)
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl StrategyOutput {
    pub fn ranked(candidates: Vec<ScoredBook>, limit: usize) -> Self {
        Self {
            candidates: rank_and_truncate(candidates, limit),
            ..Default::default()
        }
    }
}

/// Scoring strategy feature
#[async_trait]
pub trait StrategyGenerator: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError>;
}

/// Drop non-finite scores, order by score desc then id asc, keep `limit`
pub(crate) fn rank_and_truncate(mut candidates: Vec<ScoredBook>, limit: usize) -> Vec<ScoredBook> {
    candidates.retain(|c| c.score.is_finite());
    candidates.sort_by(|a, b| rank_order(a.score, &a.book_id, b.score, &b.book_id));
    candidates.truncate(limit);
    candidates
}

use super::{GenerationContext, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::StrategyKind;
use crate::utils::seed_from;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Floor weight so books unrelated to the top interest can still be drawn
const BASE_WEIGHT: f64 = 0.05;

/// Exploratory Strategy - 長尾探索
///
/// Weighted sampling without replacement over the long tail (books at or
/// below the configured popularity percentile). A book's weight grows with its
/// feature on the reader's strongest interest dimension. The draw is seeded by
/// the request (or the user id), so one request is reproducible.
pub struct ExploratoryStrategy {
    long_tail_quantile: f64,
}

impl ExploratoryStrategy {
    pub fn new(long_tail_quantile: f64) -> Self {
        Self {
            long_tail_quantile: long_tail_quantile.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl StrategyGenerator for ExploratoryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exploratory
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let seed = ctx
            .request
            .seed
            .unwrap_or_else(|| seed_from(&ctx.profile.user_id));
        let mut rng = StdRng::seed_from_u64(seed);
        let top_dimension = ctx.profile.top_dimension().map(|(dim, _)| dim.to_string());

        // Efraimidis-Spirakis: key = u^(1/w), keep the largest keys
        let candidates = ctx
            .eligible_books()
            .filter(|book| ctx.catalog.popularity_percentile(&book.id) <= self.long_tail_quantile)
            .map(|book| {
                let affinity = top_dimension
                    .as_ref()
                    .and_then(|dim| book.features.get(dim))
                    .copied()
                    .unwrap_or(0.0)
                    .max(0.0);
                let weight = BASE_WEIGHT + affinity;
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                ScoredBook::new(book.id.clone(), u.powf(1.0 / weight), "long_tail_discovery")
            })
            .collect();

        Ok(StrategyOutput::ranked(candidates, ctx.limit))
    }
}

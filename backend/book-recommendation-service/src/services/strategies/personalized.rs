use super::{rank_and_truncate, GenerationContext, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::{Book, BookId, StrategyKind, UserProfile};
use crate::services::oracle::{score_with_budget, ScoringOracle};
use crate::utils::dot_product;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Personalized Strategy - 個性化推薦
///
/// Baseline: dot product of the interest vector against book features.
/// When an oracle is configured, the top of the baseline is re-scored by it
/// and blended; any oracle failure keeps the baseline and flags degradation.
/// Readers without interests get a popularity-ranked cold start.
pub struct PersonalizedStrategy {
    oracle: Option<Arc<dyn ScoringOracle>>,
    oracle_timeout: Duration,
    /// Share of the oracle score in [0, 1]
    oracle_blend: f64,
}

impl PersonalizedStrategy {
    pub fn new(
        oracle: Option<Arc<dyn ScoringOracle>>,
        oracle_timeout: Duration,
        oracle_blend: f64,
    ) -> Self {
        Self {
            oracle,
            oracle_timeout,
            oracle_blend: oracle_blend.clamp(0.0, 1.0),
        }
    }

    /// Dot-product (or cold-start) scores for `profile` over eligible books
    pub fn baseline(profile: &UserProfile, ctx: &GenerationContext) -> Vec<ScoredBook> {
        let has_interests = profile.interests.values().any(|w| *w > 0.0);
        let scored = ctx.eligible_books().filter_map(|book| {
            if has_interests {
                interest_match(profile, book)
            } else {
                let popularity = ctx.catalog.popularity_percentile(&book.id).max(0.01);
                Some(ScoredBook::new(
                    book.id.clone(),
                    popularity,
                    "popular_with_readers",
                ))
            }
        });
        rank_and_truncate(scored.collect(), ctx.limit)
    }

    /// Score an arbitrary profile; shared with group recommendations
    pub async fn score_profile(
        &self,
        profile: &UserProfile,
        ctx: &GenerationContext,
    ) -> StrategyOutput {
        let baseline = Self::baseline(profile, ctx);
        let oracle = match &self.oracle {
            Some(oracle) if !baseline.is_empty() => oracle,
            _ => {
                return StrategyOutput {
                    candidates: baseline,
                    ..Default::default()
                }
            }
        };

        let max = baseline
            .iter()
            .map(|c| c.score)
            .fold(f64::MIN_POSITIVE, f64::max);
        let book_ids: Vec<BookId> = baseline.iter().map(|c| c.book_id.clone()).collect();

        match score_with_budget(oracle.as_ref(), profile, &book_ids, self.oracle_timeout).await {
            Ok(refined) => {
                let mut output = StrategyOutput {
                    degraded: refined.is_partial(),
                    ..Default::default()
                };
                if refined.is_partial() {
                    output.warnings.push(format!(
                        "scoring oracle omitted {} of {} books",
                        refined.missing,
                        book_ids.len()
                    ));
                }

                let candidates = baseline
                    .into_iter()
                    .map(|c| {
                        let normalized = c.score / max;
                        match refined.scores.get(&c.book_id) {
                            Some(model_score) => ScoredBook::new(
                                c.book_id,
                                (1.0 - self.oracle_blend) * normalized
                                    + self.oracle_blend * model_score,
                                "model_ranked",
                            ),
                            None => ScoredBook::new(c.book_id, normalized, c.explanation),
                        }
                    })
                    .collect();
                output.candidates = rank_and_truncate(candidates, ctx.limit);
                debug!(
                    user_id = %profile.user_id,
                    refined = refined.scores.len(),
                    "Personalized scores refined by oracle"
                );
                output
            }
            Err(e) => {
                warn!(
                    user_id = %profile.user_id,
                    error = %e,
                    "Scoring oracle unavailable, using dot-product baseline"
                );
                StrategyOutput {
                    candidates: baseline,
                    degraded: true,
                    warnings: vec![format!("personalized fallback: {}", e)],
                }
            }
        }
    }
}

/// Dot product with an explanation naming the strongest shared dimension
fn interest_match(profile: &UserProfile, book: &Book) -> Option<ScoredBook> {
    let score = dot_product(&profile.interests, &book.features);
    if score <= 0.0 || !score.is_finite() {
        return None;
    }

    let mut strongest: Option<(&str, f64)> = None;
    for (dimension, value) in &book.features {
        if let Some(weight) = profile.interests.get(dimension) {
            let contribution = weight * value;
            if strongest.map_or(true, |(_, best)| contribution > best) {
                strongest = Some((dimension.as_str(), contribution));
            }
        }
    }

    let explanation = match strongest {
        Some((dimension, _)) => format!("because_you_like:{}", dimension),
        None => "matches_your_interests".to_string(),
    };
    Some(ScoredBook::new(book.id.clone(), score, explanation))
}

#[async_trait]
impl StrategyGenerator for PersonalizedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Personalized
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        Ok(self.score_profile(&ctx.profile, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{book, context, ids, profile};
    use super::*;
    use crate::models::RecommendationRequest;
    use crate::services::oracle::MockScoringOracle;
    use crate::services::similarity::SimilarityPayload;
    use std::collections::HashMap;

    fn books() -> Vec<crate::models::Book> {
        vec![
            book("m1", "mystery", &[("genre:mystery", 1.0)], 10.0),
            book("m2", "mystery", &[("genre:mystery", 0.8), ("genre:poetry", 0.2)], 20.0),
            book("p1", "poetry", &[("genre:poetry", 1.0)], 30.0),
        ]
    }

    #[tokio::test]
    async fn test_dot_product_ranking() {
        let ctx = context(
            profile("u1", &[("genre:mystery", 0.9)]),
            books(),
            SimilarityPayload::default(),
            RecommendationRequest::default(),
        );
        let strategy = PersonalizedStrategy::new(None, Duration::from_millis(800), 0.5);

        let output = strategy.generate(&ctx).await.unwrap();
        assert_eq!(ids(&output), vec!["m1", "m2"]);
        assert_eq!(output.candidates[0].explanation, "because_you_like:genre:mystery");
        assert!(!output.degraded);
    }

    #[tokio::test]
    async fn test_cold_start_uses_popularity() {
        let ctx = context(
            profile("new", &[]),
            books(),
            SimilarityPayload::default(),
            RecommendationRequest::default(),
        );
        let output = PersonalizedStrategy::new(None, Duration::from_millis(800), 0.5)
            .generate(&ctx)
            .await
            .unwrap();

        assert_eq!(ids(&output), vec!["p1", "m2", "m1"]);
        assert!(output
            .candidates
            .iter()
            .all(|c| c.explanation == "popular_with_readers"));
    }

    #[tokio::test]
    async fn test_oracle_refines_order() {
        let mut oracle = MockScoringOracle::new();
        oracle.expect_score().times(1).returning(|_, _| {
            Ok(HashMap::from([("m1".to_string(), 0.0), ("m2".to_string(), 1.0)]))
        });
        let ctx = context(
            profile("u1", &[("genre:mystery", 0.9)]),
            books(),
            SimilarityPayload::default(),
            RecommendationRequest::default(),
        );

        let output = PersonalizedStrategy::new(Some(Arc::new(oracle)), Duration::from_millis(800), 0.8)
            .generate(&ctx)
            .await
            .unwrap();

        assert_eq!(ids(&output), vec!["m2", "m1"]);
        assert!(output.candidates.iter().all(|c| c.explanation == "model_ranked"));
        assert!(!output.degraded);
    }

    #[tokio::test]
    async fn test_oracle_failure_falls_back_to_baseline() {
        let mut oracle = MockScoringOracle::new();
        oracle
            .expect_score()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        let ctx = context(
            profile("u1", &[("genre:mystery", 0.9)]),
            books(),
            SimilarityPayload::default(),
            RecommendationRequest::default(),
        );

        let output = PersonalizedStrategy::new(Some(Arc::new(oracle)), Duration::from_millis(800), 0.5)
            .generate(&ctx)
            .await
            .unwrap();

        assert_eq!(ids(&output), vec!["m1", "m2"]);
        assert!(output.degraded);
        assert_eq!(output.warnings.len(), 1);
    }
}

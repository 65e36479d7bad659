use super::{GenerationContext, PersonalizedStrategy, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::{Book, StrategyKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Context key (`time_of_day:night`, `mood:relaxed`, ...) -> dimension multipliers
#[derive(Debug, Clone)]
pub struct ContextBoosts {
    table: HashMap<String, BTreeMap<String, f64>>,
}

impl Default for ContextBoosts {
    fn default() -> Self {
        let entries: &[(&str, &[(&str, f64)])] = &[
            ("time_of_day:morning", &[("genre:nonfiction", 1.3), ("topic:productivity", 1.4)]),
            ("time_of_day:afternoon", &[]),
            ("time_of_day:evening", &[("genre:literary", 1.2)]),
            (
                "time_of_day:night",
                &[("genre:mystery", 1.2), ("genre:fantasy", 1.2), ("topic:light_reading", 1.3)],
            ),
            ("mood:relaxed", &[("genre:romance", 1.3), ("topic:light_reading", 1.3)]),
            ("mood:curious", &[("genre:nonfiction", 1.3), ("genre:science", 1.3)]),
            ("mood:adventurous", &[("genre:adventure", 1.4), ("genre:fantasy", 1.3)]),
            ("mood:melancholy", &[("genre:poetry", 1.3), ("genre:literary", 1.2)]),
            ("location:home", &[]),
            ("location:work", &[("topic:productivity", 1.2)]),
            ("location:commute", &[("topic:short_stories", 1.4)]),
            ("location:travel", &[("genre:travel", 1.4), ("genre:adventure", 1.2)]),
        ];

        Self::new(
            entries
                .iter()
                .map(|(key, boosts)| {
                    (
                        key.to_string(),
                        boosts.iter().map(|(d, m)| (d.to_string(), *m)).collect(),
                    )
                })
                .collect(),
        )
    }
}

/// Multiplier for one dimension and the context key that contributed most to it
#[derive(Debug, Clone, PartialEq)]
struct DimensionBoost {
    multiplier: f64,
    source: String,
}

impl ContextBoosts {
    pub fn new(table: HashMap<String, BTreeMap<String, f64>>) -> Self {
        Self { table }
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// Combined multipliers for the active keys; matching boosts multiply.
    /// Returns the keys that have no table entry alongside.
    fn resolve(&self, keys: &[String]) -> (BTreeMap<String, DimensionBoost>, Vec<String>) {
        let mut combined: BTreeMap<String, DimensionBoost> = BTreeMap::new();
        let mut unknown = Vec::new();

        for key in keys {
            let Some(boosts) = self.table.get(key) else {
                unknown.push(key.clone());
                continue;
            };
            for (dimension, multiplier) in boosts {
                if !multiplier.is_finite() || *multiplier < 0.0 {
                    continue;
                }
                let entry = combined.entry(dimension.clone()).or_insert(DimensionBoost {
                    multiplier: 1.0,
                    source: key.clone(),
                });
                let previous = entry.multiplier;
                entry.multiplier *= multiplier;
                if *multiplier > previous {
                    entry.source = key.clone();
                }
            }
        }

        (combined, unknown)
    }
}

/// Contextual Strategy - 情境推薦
///
/// Personalized dot product with every dimension scaled by the boosts of the
/// request context. No context means neutral multipliers.
pub struct ContextualStrategy {
    boosts: ContextBoosts,
}

impl ContextualStrategy {
    pub fn new(boosts: ContextBoosts) -> Self {
        Self { boosts }
    }

    fn score_book(
        &self,
        ctx: &GenerationContext,
        book: &Book,
        boosts: &BTreeMap<String, DimensionBoost>,
        cold_start: bool,
    ) -> Option<ScoredBook> {
        let mut score = 0.0;
        let mut best_boost: Option<&DimensionBoost> = None;
        let mut neutral = 0.0;

        for (dimension, value) in &book.features {
            let boost = boosts.get(dimension);
            let multiplier = boost.map_or(1.0, |b| b.multiplier);
            if let Some(b) = boost {
                if b.multiplier > 1.0
                    && best_boost.map_or(true, |best| b.multiplier > best.multiplier)
                {
                    best_boost = Some(b);
                }
            }

            if cold_start {
                score += value * multiplier;
                neutral += value;
            } else if let Some(interest) = ctx.profile.interests.get(dimension) {
                score += interest * value * multiplier;
            }
        }

        if cold_start {
            // weighted mean multiplier over the book's features scales its popularity
            let factor = if neutral > 0.0 { score / neutral } else { 1.0 };
            score = ctx.catalog.popularity_percentile(&book.id).max(0.01) * factor;
        }

        if score <= 0.0 || !score.is_finite() {
            return None;
        }

        let explanation = match best_boost {
            Some(boost) => format!("fits_context:{}", boost.source),
            None if cold_start => "popular_with_readers".to_string(),
            None => "matches_your_interests".to_string(),
        };
        Some(ScoredBook::new(book.id.clone(), score, explanation))
    }
}

#[async_trait]
impl StrategyGenerator for ContextualStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Contextual
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let keys = ctx
            .request
            .context
            .as_ref()
            .map(|c| c.keys())
            .unwrap_or_default();
        if keys.is_empty() {
            return Ok(StrategyOutput {
                candidates: PersonalizedStrategy::baseline(&ctx.profile, ctx),
                ..Default::default()
            });
        }

        let (boosts, unknown) = self.boosts.resolve(&keys);
        let mut warnings = Vec::new();
        if !unknown.is_empty() {
            warn!(
                user_id = %ctx.profile.user_id,
                ignored = ?unknown,
                "Context values without boosts, treated as neutral"
            );
            warnings.extend(
                unknown
                    .iter()
                    .map(|key| format!("ignored context value: {}", key)),
            );
        }

        let cold_start = !ctx.profile.interests.values().any(|w| *w > 0.0);
        let candidates = ctx
            .eligible_books()
            .filter_map(|book| self.score_book(ctx, book, &boosts, cold_start))
            .collect();

        let mut output = StrategyOutput::ranked(candidates, ctx.limit);
        output.warnings = warnings;
        Ok(output)
    }
}

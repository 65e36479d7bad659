use super::{GenerationContext, PersonalizedStrategy, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::StrategyKind;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Named objective weights of a multi-objective request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveWeights {
    pub accuracy: f64,
    pub diversity: f64,
    pub novelty: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            accuracy: 1.0,
            diversity: 0.0,
            novelty: 0.0,
        }
    }
}

impl ObjectiveWeights {
    /// Parse the request mapping; names are case-insensitive.
    ///
    /// Objectives missing from an explicit mapping weigh 0. Unrecognized names
    /// are returned, not rejected.
    pub fn parse(objectives: Option<&BTreeMap<String, f64>>) -> (Self, Vec<String>) {
        let Some(objectives) = objectives else {
            return (Self::default(), Vec::new());
        };

        let mut weights = Self {
            accuracy: 0.0,
            diversity: 0.0,
            novelty: 0.0,
        };
        let mut unknown = Vec::new();
        for (name, weight) in objectives {
            let weight = weight.max(0.0);
            match name.trim().to_ascii_lowercase().as_str() {
                "accuracy" => weights.accuracy = weight,
                "diversity" => weights.diversity = weight,
                "novelty" => weights.novelty = weight,
                _ => unknown.push(name.clone()),
            }
        }
        (weights, unknown)
    }
}

/// Multi-Objective Strategy - 多目標排序
///
/// Emits `accuracy * personalized + novelty * (1 - popularity percentile)` for
/// every eligible book. The diversity objective depends on what is ranked above
/// a book, so it is applied greedily at merge time.
pub struct MultiObjectiveStrategy;

#[async_trait]
impl StrategyGenerator for MultiObjectiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MultiObjective
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let (weights, unknown) = ObjectiveWeights::parse(ctx.request.objectives.as_ref());
        let mut warnings = Vec::new();
        for name in &unknown {
            warn!(
                user_id = %ctx.profile.user_id,
                objective = %name,
                "Unknown objective ignored"
            );
            warnings.push(format!("unknown objective ignored: {}", name));
        }

        let baseline = PersonalizedStrategy::baseline(&ctx.profile, ctx);
        let max = baseline
            .iter()
            .map(|c| c.score)
            .fold(0.0_f64, f64::max);
        let accuracy: HashMap<&str, f64> = baseline
            .iter()
            .map(|c| {
                let normalized = if max > 0.0 { c.score / max } else { 0.0 };
                (c.book_id.as_str(), normalized)
            })
            .collect();

        let candidates = ctx
            .eligible_books()
            .map(|book| {
                let accuracy_part =
                    weights.accuracy * accuracy.get(book.id.as_str()).copied().unwrap_or(0.0);
                let novelty_part =
                    weights.novelty * (1.0 - ctx.catalog.popularity_percentile(&book.id));

                let explanation = if accuracy_part == 0.0 && novelty_part == 0.0 {
                    "objective:diversity"
                } else if novelty_part > accuracy_part {
                    "objective:novelty"
                } else {
                    "objective:accuracy"
                };
                ScoredBook::new(book.id.clone(), accuracy_part + novelty_part, explanation)
            })
            .collect();

        let mut output = StrategyOutput::ranked(candidates, ctx.limit);
        output.warnings = warnings;
        Ok(output)
    }
}

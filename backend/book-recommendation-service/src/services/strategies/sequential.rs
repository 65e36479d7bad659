use super::{GenerationContext, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::StrategyKind;
use async_trait::async_trait;
use tracing::debug;

/// Sequential Strategy - 讀完這本之後
///
/// Nearest similarity-index neighbours of the book just read. The seed is the
/// request's `just_read`, falling back to the last book in the reader's window.
pub struct SequentialStrategy;

#[async_trait]
impl StrategyGenerator for SequentialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let seed = ctx
            .request
            .just_read
            .as_ref()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| ctx.profile.last_read());

        let Some(seed) = seed else {
            debug!(
                user_id = %ctx.profile.user_id,
                "No just-read book for sequential recommendations"
            );
            return Ok(StrategyOutput {
                warnings: vec!["sequential: no just-read book to continue from".to_string()],
                ..Default::default()
            });
        };

        let explanation = format!("because_you_read:{}", seed);
        let candidates = ctx
            .similarity
            .book_neighbors(seed)
            .iter()
            .filter(|(id, _)| id != seed)
            .filter(|(id, _)| {
                ctx.catalog
                    .get(id)
                    .map_or(false, |book| ctx.is_eligible(book))
            })
            .map(|(id, score)| ScoredBook::new(id.clone(), *score, explanation.clone()))
            .collect();

        Ok(StrategyOutput::ranked(candidates, ctx.limit))
    }
}

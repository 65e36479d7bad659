use super::{GenerationContext, PersonalizedStrategy, ScoredBook, StrategyGenerator, StrategyOutput};
use crate::error::StrategyError;
use crate::models::{BookId, StrategyKind, UserProfile};
use crate::services::profile_store::UserProfileStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Social Strategy - 相似讀者也喜歡
///
/// Books the reader's top-k most similar users engaged with positively,
/// scored as the sum of `user_similarity * signal_weight`.
pub struct SocialStrategy {
    profiles: Arc<UserProfileStore>,
    top_k: usize,
    min_positive_weight: f64,
}

impl SocialStrategy {
    pub fn new(profiles: Arc<UserProfileStore>, top_k: usize, min_positive_weight: f64) -> Self {
        Self {
            profiles,
            top_k,
            min_positive_weight,
        }
    }
}

#[async_trait]
impl StrategyGenerator for SocialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Social
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let neighbors = ctx.similarity.user_neighbors(&ctx.profile.user_id);
        if neighbors.is_empty() {
            debug!(user_id = %ctx.profile.user_id, "No similar readers known");
            return Ok(StrategyOutput::default());
        }

        let mut endorsements: HashMap<BookId, f64> = HashMap::new();
        for (neighbor_id, similarity) in neighbors.iter().take(self.top_k) {
            let neighbor = self.profiles.get(neighbor_id);
            for event in &neighbor.recent {
                let weight = event.signal_weight();
                if weight < self.min_positive_weight {
                    continue;
                }
                *endorsements.entry(event.book_id.clone()).or_insert(0.0) += similarity * weight;
            }
        }

        let candidates = endorsements
            .into_iter()
            .filter(|(id, _)| ctx.catalog.get(id).map_or(false, |b| ctx.is_eligible(b)))
            .map(|(id, score)| ScoredBook::new(id, score, "liked_by_similar_readers"))
            .collect();

        Ok(StrategyOutput::ranked(candidates, ctx.limit))
    }
}

/// Group Strategy - 共讀推薦
///
/// Averages the members' interest vectors with equal weight and scores the
/// result like a single reader.
pub struct GroupStrategy {
    profiles: Arc<UserProfileStore>,
    personalized: Arc<PersonalizedStrategy>,
}

impl GroupStrategy {
    pub fn new(profiles: Arc<UserProfileStore>, personalized: Arc<PersonalizedStrategy>) -> Self {
        Self {
            profiles,
            personalized,
        }
    }

    /// Equal-weight mean of the members' interests
    pub fn averaged_profile(&self, members: &[String]) -> UserProfile {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for member in members {
            for (dimension, weight) in &self.profiles.get(member).interests {
                *sums.entry(dimension.clone()).or_insert(0.0) += weight;
            }
        }

        let n = members.len().max(1) as f64;
        let interests = sums.into_iter().map(|(d, w)| (d, w / n)).collect();
        UserProfile::new(format!("group:{}", members.join(","))).with_interests(interests)
    }
}

#[async_trait]
impl StrategyGenerator for GroupStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Group
    }

    async fn generate(&self, ctx: &GenerationContext) -> Result<StrategyOutput, StrategyError> {
        let members = match ctx.request.group_members.as_deref() {
            Some(members) if !members.is_empty() => members,
            _ => {
                return Err(StrategyError::MissingInput(
                    StrategyKind::Group.as_str(),
                    "group_members".to_string(),
                ))
            }
        };

        let group = self.averaged_profile(members);
        let mut output = self.personalized.score_profile(&group, ctx).await;
        for candidate in &mut output.candidates {
            candidate.explanation = "group_match".to_string();
        }
        Ok(output)
    }
}

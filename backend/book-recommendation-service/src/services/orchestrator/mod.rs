// ============================================
// Recommendation Orchestrator (推薦編排)
// ============================================
//
// recommend(user, request):
//   1. cache hit for (user, strategy mix) → return
//   2. select generators implied by the request type
//   3. run them concurrently under one overall deadline
//   4. merge: normalize, union by book, weighted sum, diversity for
//      multi-objective requests
//   5. drop completed / rejected / filtered books
//   6. rank (score desc, book id asc), truncate
//   7. stamp TTL, cache, return
//
// Generators that fail or miss the deadline are dropped from the merge and
// mark the result degraded; only when none completes does the request fail.

pub mod merge;

use crate::config::{Config, OrchestrationConfig, StrategyWeights};
use crate::error::{require_id, RecommendationError, Result};
use crate::models::{
    BookId, RecommendationRequest, RecommendationSet, RecommendationType, StrategyKind,
    StrategyMix, UserProfile,
};
use crate::services::cache::RecommendationCache;
use crate::services::catalog::BookCatalog;
use crate::services::feedback::FeedbackTracker;
use crate::services::oracle::ScoringOracle;
use crate::services::profile_store::UserProfileStore;
use crate::services::similarity::SimilarityIndex;
use crate::services::strategies::{
    ContextBoosts, ContextualStrategy, ExploratoryStrategy, GenerationContext, GroupStrategy,
    MultiObjectiveStrategy, ObjectiveWeights, PersonalizedStrategy, ScoredBook,
    SequentialStrategy, SocialStrategy, StrategyGenerator,
};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use merge::{merge_candidates, rank, DiversityReranker};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// Aborts generator tasks still running when the fan-out is left early
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct FanOut {
    outputs: Vec<(StrategyKind, Vec<ScoredBook>)>,
    failures: Vec<String>,
    degraded: bool,
    warnings: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    generators: Arc<BTreeMap<StrategyKind, Arc<dyn StrategyGenerator>>>,
    cache: RecommendationCache,
    profiles: Arc<UserProfileStore>,
    catalog: Arc<BookCatalog>,
    similarity: Arc<SimilarityIndex>,
    feedback: Arc<FeedbackTracker>,
    weights: StrategyWeights,
    settings: OrchestrationConfig,
    ttl: chrono::Duration,
}

impl Orchestrator {
    /// Wire the built-in generators for every strategy kind
    pub fn new(
        config: &Config,
        cache: RecommendationCache,
        profiles: Arc<UserProfileStore>,
        catalog: Arc<BookCatalog>,
        similarity: Arc<SimilarityIndex>,
        feedback: Arc<FeedbackTracker>,
        oracle: Option<Arc<dyn ScoringOracle>>,
    ) -> Self {
        let settings = config.orchestration.clone();
        let personalized = Arc::new(PersonalizedStrategy::new(
            oracle,
            settings.oracle_timeout(),
            settings.oracle_blend,
        ));

        let generators: Vec<Arc<dyn StrategyGenerator>> = vec![
            personalized.clone(),
            Arc::new(ContextualStrategy::new(ContextBoosts::default())),
            Arc::new(SequentialStrategy),
            Arc::new(MultiObjectiveStrategy),
            Arc::new(ExploratoryStrategy::new(config.exploration.long_tail_quantile)),
            Arc::new(SocialStrategy::new(
                profiles.clone(),
                config.social.top_k_users,
                config.social.min_positive_weight,
            )),
            Arc::new(GroupStrategy::new(profiles.clone(), personalized)),
        ];

        Self {
            generators: Arc::new(generators.into_iter().map(|g| (g.kind(), g)).collect()),
            cache,
            profiles,
            catalog,
            similarity,
            feedback,
            weights: config.weights.clone(),
            ttl: config.cache.ttl(),
            settings,
        }
    }

    /// Replace the generator registered for `generator.kind()`
    pub fn with_generator(mut self, generator: Arc<dyn StrategyGenerator>) -> Self {
        Arc::make_mut(&mut self.generators).insert(generator.kind(), generator);
        self
    }

    /// Replace the context boost table of the contextual strategy
    pub fn with_context_boosts(self, boosts: ContextBoosts) -> Self {
        self.with_generator(Arc::new(ContextualStrategy::new(boosts)))
    }

    pub async fn recommend(
        &self,
        user_id: &str,
        request: RecommendationRequest,
    ) -> Result<Arc<RecommendationSet>> {
        self.validate(user_id, &request)?;

        let count = request
            .count
            .unwrap_or(self.settings.default_count)
            .clamp(1, self.settings.max_count.max(1));
        let mix = StrategyMix::for_request(&request, count);

        // a group result is also built from every member's profile
        let depends_on = match (&request.kind, &request.group_members) {
            (RecommendationType::Group, Some(members)) => members.clone(),
            _ => Vec::new(),
        };

        let this = self.clone();
        let user = user_id.to_string();
        let run_mix = mix.clone();
        self.cache
            .get_or_compute_with_dependents(user_id, &mix, &depends_on, move || async move {
                this.orchestrate(&user, request, run_mix, count).await
            })
            .await
    }

    fn validate(&self, user_id: &str, request: &RecommendationRequest) -> Result<()> {
        require_id("user_id", user_id)?;
        request.validate()?;

        if request.kind == RecommendationType::Group {
            match &request.group_members {
                Some(members) if !members.is_empty() => {
                    for member in members {
                        require_id("group_members", member)?;
                    }
                }
                _ => {
                    return Err(RecommendationError::Validation(
                        "group recommendations require group_members".to_string(),
                    ))
                }
            }
        }

        if let Some(objectives) = &request.objectives {
            if let Some((name, _)) = objectives
                .iter()
                .find(|(_, w)| !w.is_finite() || **w < 0.0)
            {
                return Err(RecommendationError::Validation(format!(
                    "objective weight for '{}' must be a non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }

    async fn orchestrate(
        &self,
        user_id: &str,
        request: RecommendationRequest,
        mix: StrategyMix,
        count: usize,
    ) -> Result<RecommendationSet> {
        let started = std::time::Instant::now();
        let profile = self.profiles.get(user_id);
        let excluded = self.exclusions(&profile, &request);
        let ctx = Arc::new(GenerationContext {
            profile,
            request,
            catalog: self.catalog.snapshot(),
            similarity: self.similarity.snapshot(),
            excluded,
            limit: self.settings.candidate_pool.max(count),
        });

        let fan_out = self.fan_out(&mix.strategies, Arc::clone(&ctx)).await;
        if fan_out.outputs.is_empty() {
            warn!(
                user_id = %user_id,
                failures = ?fan_out.failures,
                "Every generator failed, no recommendations"
            );
            return Err(RecommendationError::RecommendationUnavailable(format!(
                "no generator completed: {}",
                fan_out.failures.join("; ")
            )));
        }

        let mut candidates = merge_candidates(&fan_out.outputs, &self.weights);
        candidates.retain(|c| {
            ctx.catalog
                .get(&c.book_id)
                .map_or(false, |book| ctx.is_eligible(book))
        });

        let candidates = match ctx.request.kind {
            RecommendationType::MultiObjective => {
                let (objectives, _) = ObjectiveWeights::parse(ctx.request.objectives.as_ref());
                if objectives.diversity > 0.0 {
                    DiversityReranker::new(&ctx.similarity, objectives.diversity)
                        .rerank(candidates, count)
                } else {
                    rank(candidates, count)
                }
            }
            _ => rank(candidates, count),
        };

        let degraded = fan_out.degraded || !fan_out.failures.is_empty();
        let generated_at = Utc::now();
        let set = RecommendationSet {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            candidates,
            generated_at,
            expires_at: generated_at
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            strategy_mix: mix,
            degraded,
            warnings: fan_out.warnings,
        };

        info!(
            user_id = %user_id,
            request_type = ?ctx.request.kind,
            candidates = set.candidates.len(),
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recommendations generated"
        );
        Ok(set)
    }

    /// Books the user (and every group member) completed, or rejected unless
    /// the request opts back in, within the active window
    fn exclusions(&self, profile: &UserProfile, request: &RecommendationRequest) -> HashSet<BookId> {
        let since = Utc::now() - self.settings.active_window();
        let mut excluded = HashSet::new();

        let mut readers = vec![profile.clone()];
        if request.kind == RecommendationType::Group {
            if let Some(members) = &request.group_members {
                readers.extend(
                    members
                        .iter()
                        .filter(|m| **m != profile.user_id)
                        .map(|m| self.profiles.get(m)),
                );
            }
        }

        for reader in &readers {
            if request.include_rejected {
                excluded.extend(reader.completed_since(since));
            } else {
                excluded.extend(reader.consumed_since(since));
                excluded.extend(self.feedback.rejected_books(&reader.user_id, since));
            }
        }
        excluded
    }

    /// Run every selected generator on its own task under one deadline
    async fn fan_out(&self, kinds: &[StrategyKind], ctx: Arc<GenerationContext>) -> FanOut {
        let budget = self.settings.generator_timeout();
        let deadline = Instant::now() + budget;
        let mut result = FanOut::default();
        let mut running = AbortOnDrop::default();
        let mut pending = FuturesUnordered::new();
        let mut outstanding = BTreeSet::new();

        for kind in kinds {
            let Some(generator) = self.generators.get(kind).cloned() else {
                warn!(strategy = kind.as_str(), "No generator registered");
                result
                    .failures
                    .push(format!("{}: no generator registered", kind.as_str()));
                continue;
            };

            let kind = *kind;
            let ctx = Arc::clone(&ctx);
            let handle = tokio::spawn(async move { generator.generate(&ctx).await });
            running.0.push(handle.abort_handle());
            outstanding.insert(kind);
            pending.push(async move { (kind, handle.await) });
        }

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((kind, joined))) => {
                    outstanding.remove(&kind);
                    match joined {
                        Ok(Ok(output)) => {
                            result.degraded |= output.degraded;
                            result.warnings.extend(output.warnings);
                            result.outputs.push((kind, output.candidates));
                        }
                        Ok(Err(e)) => {
                            warn!(strategy = kind.as_str(), error = %e, "Generator failed");
                            result.warnings.push(e.to_string());
                            result.failures.push(e.to_string());
                        }
                        Err(e) => {
                            warn!(strategy = kind.as_str(), error = %e, "Generator task aborted");
                            let message = format!("{} strategy aborted: {}", kind.as_str(), e);
                            result.warnings.push(message.clone());
                            result.failures.push(message);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    for kind in &outstanding {
                        let timeout = RecommendationError::UpstreamTimeout {
                            strategy: kind.as_str(),
                            budget,
                        };
                        warn!(
                            strategy = kind.as_str(),
                            budget_ms = budget.as_millis() as u64,
                            "Generator timed out, contribution dropped"
                        );
                        result.warnings.push(timeout.to_string());
                        result.failures.push(timeout.to_string());
                    }
                    break;
                }
            }
        }

        // outputs arrive in completion order; merge explanations follow strategy order anyway
        result.outputs.sort_by_key(|(kind, _)| *kind);
        result
    }
}

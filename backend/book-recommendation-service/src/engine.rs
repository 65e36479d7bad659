// ============================================
// Recommendation Engine
// ============================================
//
// Wires the components together and is the one surface the ingestion
// layer talks to. Every write path funnels into the same invalidation:
//
//   apply_interaction ─▶ UserProfileStore ─┐
//   record_feedback   ─▶ FeedbackTracker  ─┼─▶ RecommendationCache::invalidate
//   refresh(user)     ─────────────────────┤
//   handle_signal     ─▶ SignalHandler    ─┘   (scoped or global)

use crate::config::Config;
use crate::error::{require_id, Result};
use crate::models::{
    AccuracyMetric, Book, BookId, FeedbackAction, FeedbackEvent, InteractionEvent,
    RecommendationRequest, RecommendationSet, StrategyAccuracy, TimeWindow, UserId, UserProfile,
};
use crate::services::cache::{CacheStats, RecommendationCache};
use crate::services::catalog::BookCatalog;
use crate::services::feedback::FeedbackTracker;
use crate::services::oracle::ScoringOracle;
use crate::services::orchestrator::Orchestrator;
use crate::services::profile_store::UserProfileStore;
use crate::services::signals::{SignalError, SignalHandler, SignalOutcome, TrainingSignal};
use crate::services::similarity::{RefreshOutcome, SimilarityIndex, SimilarityPayload};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub struct RecommendationEngine {
    config: Config,
    catalog: Arc<BookCatalog>,
    similarity: Arc<SimilarityIndex>,
    profiles: Arc<UserProfileStore>,
    feedback: Arc<FeedbackTracker>,
    cache: RecommendationCache,
    orchestrator: Orchestrator,
    signals: SignalHandler,
}

impl RecommendationEngine {
    pub fn new(config: Config, books: Vec<Book>, oracle: Option<Arc<dyn ScoringOracle>>) -> Self {
        let catalog = Arc::new(BookCatalog::new(books));
        let similarity = Arc::new(SimilarityIndex::new());
        let cache = RecommendationCache::new();
        let profiles = Arc::new(
            UserProfileStore::new(&config.profile, Arc::clone(&catalog))
                .with_invalidator(Arc::new(cache.clone())),
        );
        let feedback = Arc::new(FeedbackTracker::new(config.feedback.attribution_capacity));
        let orchestrator = Orchestrator::new(
            &config,
            cache.clone(),
            Arc::clone(&profiles),
            Arc::clone(&catalog),
            Arc::clone(&similarity),
            Arc::clone(&feedback),
            oracle,
        );
        let signals = SignalHandler::new(
            Arc::clone(&similarity),
            Arc::clone(&catalog),
            cache.clone(),
            config.signals.dedup_capacity,
        );

        info!(
            service = %config.service.service_name,
            books = catalog.snapshot().len(),
            "Recommendation engine initialized"
        );

        Self {
            config,
            catalog,
            similarity,
            profiles,
            feedback,
            cache,
            orchestrator,
            signals,
        }
    }

    /// Adjust the orchestrator, e.g. to swap a generator or the context boost table
    pub fn map_orchestrator(mut self, f: impl FnOnce(Orchestrator) -> Orchestrator) -> Self {
        self.orchestrator = f(self.orchestrator);
        self
    }

    /// Cached or freshly orchestrated recommendations for the user
    pub async fn recommend(
        &self,
        user_id: &str,
        request: RecommendationRequest,
    ) -> Result<Arc<RecommendationSet>> {
        let set = self.orchestrator.recommend(user_id, request).await?;
        self.feedback.record_served(&set);
        Ok(set)
    }

    pub fn apply_interaction(&self, user_id: &str, event: InteractionEvent) -> Result<()> {
        self.profiles.apply_interaction(user_id, event)
    }

    /// Append feedback; a new event invalidates the user's cached results.
    ///
    /// Returns `false` for a duplicate delivery.
    pub fn record_feedback(&self, event: FeedbackEvent) -> Result<bool> {
        let user_id = event.user_id.clone();
        let appended = self.feedback.record(event)?;
        if appended {
            self.cache.invalidate(&user_id);
        }
        Ok(appended)
    }

    pub fn record(
        &self,
        user_id: &str,
        book_id: &str,
        action: FeedbackAction,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        self.record_feedback(FeedbackEvent {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            action,
            timestamp,
        })
    }

    /// Explicit refresh request: drop the user's cached results
    pub fn refresh(&self, user_id: &str) -> Result<()> {
        require_id("user_id", user_id)?;
        self.cache.invalidate(user_id);
        debug!(user_id = %user_id, "Refresh requested");
        Ok(())
    }

    pub fn handle_signal(&self, signal: TrainingSignal) -> std::result::Result<SignalOutcome, SignalError> {
        self.signals.handle(signal)
    }

    /// Manual similarity refresh; every cached result is invalidated when applied
    pub fn refresh_similarity(&self, payload: &SimilarityPayload) -> RefreshOutcome {
        let outcome = self.similarity.refresh(payload);
        if outcome == RefreshOutcome::Applied {
            self.cache.invalidate_all();
        }
        outcome
    }

    pub fn accuracy(&self, user_id: &str, window: TimeWindow) -> AccuracyMetric {
        self.feedback.accuracy(user_id, window)
    }

    pub fn overall_accuracy(&self, window: TimeWindow) -> AccuracyMetric {
        self.feedback.overall_accuracy(window)
    }

    pub fn strategy_accuracy(&self, window: TimeWindow) -> Vec<StrategyAccuracy> {
        self.feedback.strategy_accuracy(window)
    }

    pub fn feedback_events(&self, user_id: &str) -> Vec<FeedbackEvent> {
        self.feedback.events(user_id)
    }

    pub fn profile(&self, user_id: &str) -> UserProfile {
        self.profiles.get(user_id)
    }

    /// Seed or replace a profile (bulk import)
    pub fn upsert_profile(&self, profile: UserProfile) -> Result<()> {
        self.profiles.upsert(profile)
    }

    pub fn known_users(&self) -> Vec<UserId> {
        self.profiles.user_ids()
    }

    pub fn book_similarity(&self, book_id: &str) -> Vec<(BookId, f64)> {
        self.similarity.book_similarity(book_id)
    }

    pub fn user_similarity(&self, user_id: &str) -> Vec<(UserId, f64)> {
        self.similarity.user_similarity(user_id)
    }

    pub fn cache(&self) -> &RecommendationCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn catalog(&self) -> &BookCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalType, StrategyMix};
    use crate::services::similarity::SimilarityPair;
    use crate::services::signals::{SignalKind, SignalScope};
    use std::collections::BTreeMap;

    fn books() -> Vec<Book> {
        ["a", "b", "c"]
            .iter()
            .map(|id| Book {
                id: id.to_string(),
                features: BTreeMap::from([("genre:mystery".to_string(), 1.0)]),
                genre: "mystery".to_string(),
                language: "en".to_string(),
                page_count: 200,
                popularity: 1.0,
            })
            .collect()
    }

    fn engine() -> RecommendationEngine {
        let engine = RecommendationEngine::new(Config::default(), books(), None);
        engine
            .upsert_profile(UserProfile::new("u1").with_interests(BTreeMap::from([(
                "genre:mystery".to_string(),
                0.9,
            )])))
            .unwrap();
        engine
    }

    fn default_mix() -> StrategyMix {
        StrategyMix::for_request(&RecommendationRequest::default(), 10)
    }

    #[tokio::test]
    async fn test_every_write_path_invalidates() {
        let engine = engine();

        engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        engine
            .apply_interaction("u1", InteractionEvent::new("a", SignalType::Like, 1.0))
            .unwrap();
        assert!(engine.cache().get("u1", &default_mix()).is_none());

        engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        assert!(engine
            .record("u1", "b", FeedbackAction::Clicked, Utc::now())
            .unwrap());
        assert!(engine.cache().get("u1", &default_mix()).is_none());

        engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        engine.refresh("u1").unwrap();
        assert!(engine.cache().get("u1", &default_mix()).is_none());

        engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        engine
            .handle_signal(TrainingSignal::new(
                SignalKind::EmbeddingsUpdated,
                SignalScope::Users(vec!["u1".to_string()]),
            ))
            .unwrap();
        assert!(engine.cache().get("u1", &default_mix()).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_feedback_keeps_cache() {
        let engine = engine();
        let at = Utc::now();
        engine.record("u1", "b", FeedbackAction::Shown, at).unwrap();

        let set = engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        assert!(!engine.record("u1", "b", FeedbackAction::Shown, at).unwrap());
        let cached = engine.cache().get("u1", &default_mix()).unwrap();
        assert_eq!(cached.id, set.id);
        assert_eq!(engine.feedback_events("u1").len(), 1);
    }

    #[tokio::test]
    async fn test_strategy_accuracy_from_served_sets() {
        let engine = engine();
        engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        engine
            .record("u1", "a", FeedbackAction::Accepted, Utc::now())
            .unwrap();

        let report = engine.strategy_accuracy(TimeWindow::last(chrono::Duration::hours(1)));
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].accepted, 1);
    }

    #[tokio::test]
    async fn test_custom_context_boosts() {
        use crate::models::{RecommendationType, RequestContext};
        use crate::services::strategies::ContextBoosts;
        use std::collections::HashMap;

        let request = RecommendationRequest {
            context: Some(RequestContext {
                mood: Some("cozy".to_string()),
                ..Default::default()
            }),
            ..RecommendationRequest::of_type(RecommendationType::Contextual)
        };

        let set = engine().recommend("u1", request.clone()).await.unwrap();
        assert_eq!(set.warnings, vec!["ignored context value: mood:cozy"]);

        let boosts = ContextBoosts::new(HashMap::from([(
            "mood:cozy".to_string(),
            BTreeMap::from([("genre:mystery".to_string(), 1.5)]),
        )]));
        let engine = engine().map_orchestrator(|o| o.with_context_boosts(boosts));
        let set = engine.recommend("u1", request).await.unwrap();
        assert!(set.warnings.is_empty());
        assert_eq!(set.candidates[0].explanations, vec!["fits_context:mood:cozy"]);
    }

    #[tokio::test]
    async fn test_catalog_update_signal_reaches_recommendations() {
        use crate::services::signals::CatalogPayload;

        let engine = engine();
        let before = engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        assert!(!before.book_ids().contains(&"n1"));

        let mut books = books();
        books.push(Book {
            id: "n1".to_string(),
            features: BTreeMap::from([("genre:mystery".to_string(), 2.0)]),
            genre: "mystery".to_string(),
            language: "en".to_string(),
            page_count: 150,
            popularity: 1.0,
        });
        let signal = TrainingSignal::new(SignalKind::EmbeddingsUpdated, SignalScope::Global)
            .with_event_id("emb-7")
            .with_catalog(CatalogPayload {
                version: Some("2024-06".to_string()),
                books,
            });
        assert_eq!(engine.handle_signal(signal.clone()).unwrap(), SignalOutcome::Processed);

        let after = engine.recommend("u1", RecommendationRequest::default()).await.unwrap();
        assert_eq!(after.book_ids()[0], "n1");
        assert_eq!(engine.catalog().snapshot().len(), 4);

        assert_eq!(
            engine.handle_signal(signal).unwrap(),
            SignalOutcome::AlreadyProcessed
        );
        let cached = engine.cache().get("u1", &default_mix()).unwrap();
        assert_eq!(cached.id, after.id);
    }

    #[test]
    fn test_manual_similarity_refresh() {
        let engine = engine();
        let payload = SimilarityPayload {
            version: Some("v1".to_string()),
            books: vec![SimilarityPair::new("a", "b", 0.4)],
            users: Vec::new(),
        };
        assert_eq!(engine.refresh_similarity(&payload), RefreshOutcome::Applied);
        assert_eq!(engine.refresh_similarity(&payload), RefreshOutcome::Unchanged);
        assert_eq!(engine.book_similarity("b"), vec![("a".to_string(), 0.4)]);
        assert!(engine.refresh("").is_err());
    }
}

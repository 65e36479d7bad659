// ============================================
// User Profile Store (用户兴趣画像)
// ============================================
//
// Live interest vector per reader, updated from streamed interactions:
//
//   new_weight = alpha * signal_weight + (1 - alpha) * old_weight
//
// applied to every dimension the interacted book carries, where
// signal_weight = polarity(signal) * event.weight * feature_value.
//
// Writes to one user are serialized by the map shard lock; different
// users update independently. Every write invalidates the user's cached
// recommendations before returning.

use crate::config::ProfileConfig;
use crate::error::{require_id, Result};
use crate::models::{InteractionEvent, UserId, UserProfile};
use crate::services::cache::InvalidationSink;
use crate::services::catalog::BookCatalog;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub struct UserProfileStore {
    profiles: DashMap<UserId, UserProfile>,
    catalog: Arc<BookCatalog>,
    invalidator: Option<Arc<dyn InvalidationSink>>,
    alpha: f64,
    window_capacity: usize,
}

impl UserProfileStore {
    pub fn new(config: &ProfileConfig, catalog: Arc<BookCatalog>) -> Self {
        Self {
            profiles: DashMap::new(),
            catalog,
            invalidator: None,
            alpha: config.alpha.clamp(f64::EPSILON, 1.0),
            window_capacity: config.window_capacity.max(1),
        }
    }

    /// Attach the cache invalidated on every profile write
    pub fn with_invalidator(mut self, invalidator: Arc<dyn InvalidationSink>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Snapshot of the user's profile; unknown users get a fresh default profile
    pub fn get(&self, user_id: &str) -> UserProfile {
        self.profiles
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| UserProfile::new(user_id))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.profiles.contains_key(user_id)
    }

    /// Seed or replace a profile wholesale (bulk import, tests)
    pub fn upsert(&self, profile: UserProfile) -> Result<()> {
        require_id("user_id", &profile.user_id)?;
        let user_id = profile.user_id.clone();
        self.profiles.insert(user_id.clone(), profile);
        self.notify(&user_id);
        Ok(())
    }

    /// Fold one interaction into the user's profile.
    ///
    /// Completes before returning, so a following `get` for the same user
    /// observes the update.
    pub fn apply_interaction(&self, user_id: &str, event: InteractionEvent) -> Result<()> {
        require_id("user_id", user_id)?;
        require_id("book_id", &event.book_id)?;
        if !event.weight.is_finite() {
            return Err(crate::error::RecommendationError::Validation(
                "interaction weight must be finite".to_string(),
            ));
        }

        let catalog = self.catalog.snapshot();
        let features = catalog.get(&event.book_id).map(|b| &b.features);
        if features.is_none() {
            debug!(
                user_id = %user_id,
                book_id = %event.book_id,
                "Interaction with uncatalogued book, recording without interest update"
            );
        }

        {
            let mut profile = self
                .profiles
                .entry(user_id.to_string())
                .or_insert_with(|| UserProfile::new(user_id));

            if let Some(features) = features {
                let signal_weight = event.signal_weight();
                for (dimension, value) in features {
                    let old = profile.interests.get(dimension).copied().unwrap_or(0.0);
                    let updated = self.alpha * signal_weight * value + (1.0 - self.alpha) * old;
                    profile.interests.insert(dimension.clone(), updated);
                }
            }

            profile.recent.push_back(event);
            while profile.recent.len() > self.window_capacity {
                profile.recent.pop_front();
            }
            profile.updated_at = Utc::now();
        }

        self.notify(user_id);
        Ok(())
    }

    /// Ids of all known users, ascending
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.profiles.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    fn notify(&self, user_id: &str) {
        if let Some(invalidator) = &self.invalidator {
            invalidator.invalidate_user(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Book, SignalType};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        invalidated: Mutex<Vec<String>>,
    }

    impl InvalidationSink for RecordingSink {
        fn invalidate_user(&self, user_id: &str) {
            self.invalidated.lock().unwrap().push(user_id.to_string());
        }
    }

    fn catalog() -> Arc<BookCatalog> {
        Arc::new(BookCatalog::new(vec![Book {
            id: "b1".to_string(),
            features: BTreeMap::from([("genre:mystery".to_string(), 1.0)]),
            genre: "mystery".to_string(),
            language: "en".to_string(),
            page_count: 300,
            popularity: 1.0,
        }]))
    }

    #[test]
    fn test_unknown_user_gets_default_profile() {
        let store = UserProfileStore::new(&ProfileConfig::default(), catalog());
        let profile = store.get("nobody");
        assert_eq!(profile.user_id, "nobody");
        assert!(profile.interests.is_empty());
        assert!(!store.contains("nobody"));
    }

    #[test]
    fn test_exponential_update_and_read_after_write() {
        let store = UserProfileStore::new(&ProfileConfig::default(), catalog());

        store
            .apply_interaction("u1", InteractionEvent::new("b1", SignalType::Rate, 1.0))
            .unwrap();
        let first = store.get("u1").interests["genre:mystery"];
        assert!((first - 0.3).abs() < 1e-9);

        store
            .apply_interaction("u1", InteractionEvent::new("b1", SignalType::Rate, 1.0))
            .unwrap();
        let second = store.get("u1").interests["genre:mystery"];
        assert!((second - (0.3 + 0.7 * 0.3)).abs() < 1e-9);

        store
            .apply_interaction("u1", InteractionEvent::new("b1", SignalType::Reject, 1.0))
            .unwrap();
        let third = store.get("u1").interests["genre:mystery"];
        assert!(third < second);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let config = ProfileConfig {
            alpha: 0.3,
            window_capacity: 3,
        };
        let store = UserProfileStore::new(&config, catalog());
        for i in 0..5 {
            store
                .apply_interaction(
                    "u1",
                    InteractionEvent::new(format!("book-{}", i), SignalType::View, 1.0),
                )
                .unwrap();
        }

        let ids: Vec<String> = store
            .get("u1")
            .recent
            .iter()
            .map(|e| e.book_id.clone())
            .collect();
        assert_eq!(ids, vec!["book-2", "book-3", "book-4"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_user_are_serialized() {
        let store = Arc::new(UserProfileStore::new(&ProfileConfig::default(), catalog()));
        let writers = 64;

        let mut handles = Vec::new();
        for i in 0..writers {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let book = if i % 2 == 0 { "b1".to_string() } else { format!("other-{}", i) };
                store.apply_interaction("u1", InteractionEvent::new(book, SignalType::Rate, 1.0))
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let profile = store.get("u1");
        assert_eq!(profile.recent.len(), writers);
        let distinct: std::collections::HashSet<&str> =
            profile.recent.iter().map(|e| e.book_id.as_str()).collect();
        assert_eq!(distinct.len(), writers / 2 + 1);

        // 32 folds of x -> 0.3 + 0.7x commute, so only a lost update changes the result
        let expected = 1.0 - 0.7_f64.powi(32);
        assert!((profile.interests["genre:mystery"] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_concurrent_writes_respect_window_capacity() {
        let config = ProfileConfig {
            alpha: 0.3,
            window_capacity: 10,
        };
        let store = Arc::new(UserProfileStore::new(&config, catalog()));

        std::thread::scope(|scope| {
            for t in 0..4 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..25 {
                        store
                            .apply_interaction(
                                "u1",
                                InteractionEvent::new(format!("t{}-{}", t, i), SignalType::View, 1.0),
                            )
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get("u1").recent.len(), 10);
    }

    #[test]
    fn test_write_invalidates_cache() {
        let sink = Arc::new(RecordingSink::default());
        let store = UserProfileStore::new(&ProfileConfig::default(), catalog())
            .with_invalidator(sink.clone());

        store
            .apply_interaction("u1", InteractionEvent::new("b1", SignalType::Like, 1.0))
            .unwrap();
        assert_eq!(*sink.invalidated.lock().unwrap(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_rejects_empty_identifiers() {
        let store = UserProfileStore::new(&ProfileConfig::default(), catalog());
        assert!(store
            .apply_interaction("", InteractionEvent::new("b1", SignalType::Like, 1.0))
            .is_err());
        assert!(store
            .apply_interaction("u1", InteractionEvent::new("", SignalType::Like, 1.0))
            .is_err());
    }
}

//! Per-user recommendation cache with single-flight recomputation
//!
//! Entries are keyed by user id and strategy mix and expire with the
//! `expires_at` stamped on the set itself; an expired entry reads as absent
//! and is swept from the user's entries on the next read or store.
//!
//! # Invalidation
//!
//! ```text
//! profile update / feedback / refresh / training signal
//!      ↓
//! invalidate(user)  → bump user generation, drop entries, detach in-flight runs
//!      ↓            → drop group entries whose result depends on the user
//! next get_or_compute(user, mix) → miss → one recomputation shared by all callers
//! ```
//!
//! A recomputation that started before an invalidation still answers the
//! callers that joined it, but its result is never stored. A recomputation
//! whose only caller goes away before anyone joined it is cancelled.

mod stats;

pub use stats::{CacheStats, StatsCollector};

use crate::error::{RecommendationError, Result};
use crate::models::{RecommendationSet, StrategyMix, UserId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::debug;

/// Receiver of invalidation requests from write paths.
pub trait InvalidationSink: Send + Sync {
    fn invalidate_user(&self, user_id: &str);
}

type SharedComputation = Shared<BoxFuture<'static, Result<Arc<RecommendationSet>>>>;
type EntryKey = (UserId, String);

#[derive(Default)]
struct FlightState {
    waiters: AtomicUsize,
    joined: AtomicBool,
}

struct InFlight {
    id: u64,
    computation: SharedComputation,
    /// Other users whose profiles feed this run (group members)
    depends_on: Vec<UserId>,
    state: Arc<FlightState>,
    abort: AbortHandle,
}

/// Generation counter plus the lock serializing stores against removals
#[derive(Default)]
struct UserSlot {
    generation: AtomicU64,
    write: Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Generation {
    epoch: u64,
    user: u64,
    depends_on: Vec<(UserId, u64)>,
}

#[derive(Default)]
struct Inner {
    entries: DashMap<UserId, HashMap<String, Arc<RecommendationSet>>>,
    in_flight: DashMap<EntryKey, InFlight>,
    slots: DashMap<UserId, Arc<UserSlot>>,
    /// member -> stored entries of other users built from the member's profile
    dependents: Mutex<HashMap<UserId, HashSet<EntryKey>>>,
    /// Bumped by global invalidation
    epoch: RwLock<u64>,
    next_flight_id: AtomicU64,
    stats: StatsCollector,
}

impl Inner {
    fn slot(&self, user_id: &str) -> Arc<UserSlot> {
        self.slots.entry(user_id.to_string()).or_default().value().clone()
    }

    fn generation_of(&self, user_id: &str) -> u64 {
        self.slots
            .get(user_id)
            .map(|slot| slot.generation.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn lookup(&self, user_id: &str, fingerprint: &str) -> Option<Arc<RecommendationSet>> {
        let now = Utc::now();
        let (hit, stale) = {
            let user_entries = self.entries.get(user_id)?;
            let hit = user_entries
                .get(fingerprint)
                .filter(|set| set.is_fresh(now))
                .cloned();
            (hit, user_entries.values().any(|set| !set.is_fresh(now)))
        };

        if stale {
            self.sweep(user_id, now);
        }
        hit
    }

    /// Drop the user's expired entries, and the user key once empty
    fn sweep(&self, user_id: &str, now: DateTime<Utc>) {
        if let Entry::Occupied(mut user_entries) = self.entries.entry(user_id.to_string()) {
            user_entries.get_mut().retain(|_, set| set.is_fresh(now));
            if user_entries.get().is_empty() {
                user_entries.remove();
            }
        }
    }

    fn current_generation(&self, user_id: &str, depends_on: &[UserId]) -> Generation {
        let epoch = *self.epoch.read().unwrap_or_else(|e| e.into_inner());
        Generation {
            epoch,
            user: self.generation_of(user_id),
            depends_on: depends_on
                .iter()
                .map(|member| (member.clone(), self.generation_of(member)))
                .collect(),
        }
    }

    /// Lock order: user slot, epoch, dependents.
    fn store_if_current(
        &self,
        user_id: &str,
        fingerprint: &str,
        generation: &Generation,
        set: Arc<RecommendationSet>,
    ) -> bool {
        let slot = self.slot(user_id);
        let _write = slot.write.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = self.epoch.read().unwrap_or_else(|e| e.into_inner());
        if slot.generation.load(Ordering::SeqCst) != generation.user || *epoch != generation.epoch {
            return false;
        }

        // member generations are bumped under the dependents lock, so the
        // check and the registration below cannot straddle an invalidation
        let mut dependents = self.dependents.lock().unwrap_or_else(|e| e.into_inner());
        if generation
            .depends_on
            .iter()
            .any(|(member, seen)| self.generation_of(member) != *seen)
        {
            return false;
        }

        let now = Utc::now();
        {
            let mut user_entries = self.entries.entry(user_id.to_string()).or_default();
            user_entries.retain(|_, cached| cached.is_fresh(now));
            user_entries.insert(fingerprint.to_string(), set);
        }
        for (member, _) in &generation.depends_on {
            dependents
                .entry(member.clone())
                .or_default()
                .insert((user_id.to_string(), fingerprint.to_string()));
        }
        true
    }

    fn invalidate(&self, user_id: &str) {
        let slot = self.slot(user_id);
        let dependent_entries = {
            let mut dependents = self.dependents.lock().unwrap_or_else(|e| e.into_inner());
            slot.generation.fetch_add(1, Ordering::SeqCst);
            dependents.remove(user_id).unwrap_or_default()
        };

        {
            let _write = slot.write.lock().unwrap_or_else(|e| e.into_inner());
            self.entries.remove(user_id);
        }

        for (owner, fingerprint) in dependent_entries {
            let owner_slot = self.slot(&owner);
            let _write = owner_slot.write.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(mut owner_entries) = self.entries.get_mut(&owner) {
                owner_entries.remove(&fingerprint);
            }
        }

        self.in_flight.retain(|(owner, _), flight| {
            owner != user_id && !flight.depends_on.iter().any(|m| m == user_id)
        });
        self.stats.record_invalidation();
    }

    fn invalidate_all(&self) {
        {
            let mut epoch = self.epoch.write().unwrap_or_else(|e| e.into_inner());
            *epoch += 1;
            self.entries.clear();
            self.dependents
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        self.in_flight.clear();
        self.stats.record_invalidation();
    }
}

/// Clears the in-flight slot when the recomputation task ends, however it ends
struct Landing {
    inner: Arc<Inner>,
    key: EntryKey,
    id: u64,
}

impl Drop for Landing {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.in_flight.remove_if(&self.key, |_, flight| flight.id == id);
    }
}

/// One caller awaiting a recomputation
struct Waiter {
    inner: Arc<Inner>,
    key: EntryKey,
    id: u64,
    state: Arc<FlightState>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.state.waiters.fetch_sub(1, Ordering::SeqCst);
        let id = self.id;
        let abandoned = self.inner.in_flight.remove_if(&self.key, |_, flight| {
            flight.id == id
                && flight.state.waiters.load(Ordering::SeqCst) == 0
                && !flight.state.joined.load(Ordering::SeqCst)
        });
        if let Some((_, flight)) = abandoned {
            flight.abort.abort();
            self.inner.stats.record_cancellation();
            debug!(user_id = %self.key.0, "Caller went away, recomputation cancelled");
        }
    }
}

/// Process-wide recommendation cache; clones share state.
#[derive(Clone, Default)]
pub struct RecommendationCache {
    inner: Arc<Inner>,
}

impl RecommendationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh entry for the user and mix, if any
    pub fn get(&self, user_id: &str, mix: &StrategyMix) -> Option<Arc<RecommendationSet>> {
        let hit = self.inner.lookup(user_id, &mix.fingerprint);
        match hit {
            Some(_) => self.inner.stats.record_hit(),
            None => self.inner.stats.record_miss(),
        }
        hit
    }

    /// Store a set, superseding any previous entry for the same mix
    pub fn put(
        &self,
        user_id: &str,
        mix: &StrategyMix,
        set: RecommendationSet,
    ) -> Arc<RecommendationSet> {
        let set = Arc::new(set);
        let generation = self.inner.current_generation(user_id, &[]);
        self.inner
            .store_if_current(user_id, &mix.fingerprint, &generation, Arc::clone(&set));
        set
    }

    /// Return the cached set or run `compute` once for all concurrent callers.
    ///
    /// The computation runs on its own task. Once a second caller has joined
    /// it runs to completion and is cached even if every caller goes away;
    /// a run with a single caller is cancelled when that caller is dropped.
    pub async fn get_or_compute<F, Fut>(
        &self,
        user_id: &str,
        mix: &StrategyMix,
        compute: F,
    ) -> Result<Arc<RecommendationSet>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RecommendationSet>> + Send + 'static,
    {
        self.get_or_compute_with_dependents(user_id, mix, &[], compute)
            .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for a result that is
    /// also built from the profiles of `depends_on`: invalidating any of
    /// them drops the entry too.
    pub async fn get_or_compute_with_dependents<F, Fut>(
        &self,
        user_id: &str,
        mix: &StrategyMix,
        depends_on: &[UserId],
        compute: F,
    ) -> Result<Arc<RecommendationSet>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RecommendationSet>> + Send + 'static,
    {
        if let Some(hit) = self.inner.lookup(user_id, &mix.fingerprint) {
            self.inner.stats.record_hit();
            debug!(user_id = %user_id, "Recommendation cache hit");
            return Ok(hit);
        }

        let key: EntryKey = (user_id.to_string(), mix.fingerprint.clone());
        let (computation, _waiter) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                self.inner.stats.record_join();
                debug!(user_id = %user_id, "Joining in-flight recomputation");
                let flight = flight.get();
                flight.state.waiters.fetch_add(1, Ordering::SeqCst);
                flight.state.joined.store(true, Ordering::SeqCst);
                let waiter = Waiter {
                    inner: Arc::clone(&self.inner),
                    key,
                    id: flight.id,
                    state: Arc::clone(&flight.state),
                };
                (flight.computation.clone(), waiter)
            }
            Entry::Vacant(slot) => {
                // A run may have completed between the first lookup and taking the slot
                if let Some(hit) = self.inner.lookup(user_id, &mix.fingerprint) {
                    self.inner.stats.record_hit();
                    return Ok(hit);
                }

                self.inner.stats.record_miss();
                self.inner.stats.record_computation();
                debug!(user_id = %user_id, "Recommendation cache miss, recomputing");

                let depends_on: Vec<UserId> = depends_on
                    .iter()
                    .filter(|member| member.as_str() != user_id)
                    .cloned()
                    .collect();
                let generation = self.inner.current_generation(user_id, &depends_on);
                let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                let run = compute();

                let handle = tokio::spawn(async move {
                    let _landing = Landing {
                        inner: Arc::clone(&inner),
                        key: task_key.clone(),
                        id,
                    };
                    let outcome = run.await.map(Arc::new);
                    if let Ok(set) = &outcome {
                        if !inner.store_if_current(&task_key.0, &task_key.1, &generation, Arc::clone(set))
                        {
                            inner.stats.record_discard();
                            debug!(
                                user_id = %task_key.0,
                                "Discarding recomputation superseded by invalidation"
                            );
                        }
                    }
                    outcome
                });
                let abort = handle.abort_handle();

                let computation = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RecommendationError::Internal(format!(
                            "recomputation task ended abnormally: {}",
                            e
                        )))
                    })
                }
                .boxed()
                .shared();

                let state = Arc::new(FlightState {
                    waiters: AtomicUsize::new(1),
                    joined: AtomicBool::new(false),
                });
                slot.insert(InFlight {
                    id,
                    computation: computation.clone(),
                    depends_on,
                    state: Arc::clone(&state),
                    abort,
                });
                let waiter = Waiter {
                    inner: Arc::clone(&self.inner),
                    key,
                    id,
                    state,
                };
                (computation, waiter)
            }
        };

        computation.await
    }

    /// Remove every entry of the user, regardless of strategy mix, along with
    /// group entries built from the user's profile
    pub fn invalidate(&self, user_id: &str) {
        self.inner.invalidate(user_id);
        debug!(user_id = %user_id, "Recommendation cache invalidated");
    }

    pub fn invalidate_users(&self, user_ids: &[UserId]) {
        for user_id in user_ids {
            self.invalidate(user_id);
        }
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
        debug!("Recommendation cache invalidated for all users");
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Stored sets across all users, expired ones not yet swept included
    pub fn entry_count(&self) -> usize {
        self.inner.entries.iter().map(|user| user.len()).sum()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }
}

impl InvalidationSink for RecommendationCache {
    fn invalidate_user(&self, user_id: &str) {
        self.invalidate(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecommendationRequest, StrategyKind};
    use chrono::Duration as ChronoDuration;
        use std::time::Duration;
    use uuid::Uuid;

    fn mix() -> StrategyMix {
        StrategyMix::for_request(&RecommendationRequest::default(), 10)
    }

    fn set_for(user_id: &str, ttl: ChronoDuration) -> RecommendationSet {
        let now = Utc::now();
        RecommendationSet {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            candidates: Vec::new(),
            generated_at: now,
            expires_at: now + ttl,
            strategy_mix: mix(),
            degraded: false,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_put_get_and_invalidate() {
        let cache = RecommendationCache::new();
        let stored = cache.put("u1", &mix(), set_for("u1", ChronoDuration::minutes(15)));

        let hit = cache.get("u1", &mix()).expect("fresh entry");
        assert_eq!(hit.id, stored.id);
        assert!(hit.is_fresh(Utc::now()));

        cache.invalidate("u1");
        assert!(cache.get("u1", &mix()).is_none());
    }

    #[test]
    fn test_invalidate_removes_every_mix_of_user_only() {
        let cache = RecommendationCache::new();
        let other_mix = StrategyMix::for_request(&RecommendationRequest::default(), 5);
        cache.put("u1", &mix(), set_for("u1", ChronoDuration::minutes(5)));
        cache.put("u1", &other_mix, set_for("u1", ChronoDuration::minutes(5)));
        cache.put("u2", &mix(), set_for("u2", ChronoDuration::minutes(5)));

        cache.invalidate("u1");

        assert!(cache.get("u1", &mix()).is_none());
        assert!(cache.get("u1", &other_mix).is_none());
        assert!(cache.get("u2", &mix()).is_some());

        cache.invalidate_all();
        assert!(cache.get("u2", &mix()).is_none());
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let cache = RecommendationCache::new();
        let mut set = set_for("u1", ChronoDuration::minutes(5));
        set.generated_at = Utc::now() - ChronoDuration::minutes(20);
        set.expires_at = Utc::now() - ChronoDuration::minutes(5);
        cache.put("u1", &mix(), set);

        assert!(cache.get("u1", &mix()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_computation() {
        let cache = RecommendationCache::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("u1", &mix(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(set_for("u1", ChronoDuration::minutes(15)))
                    })
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(cache.get("u1", &mix()).unwrap().id, ids[0]);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_recompute_is_not_cached() {
        let cache = RecommendationCache::new();
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("u1", &mix(), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(set_for("u1", ChronoDuration::minutes(15)))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate("u1");

        let result = pending.await.unwrap();
        assert!(result.is_ok());
        assert!(cache.get("u1", &mix()).is_none());
        assert_eq!(cache.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_failed_computation_is_not_cached() {
        let cache = RecommendationCache::new();
        let result = cache
            .get_or_compute("u1", &mix(), || async {
                Err(RecommendationError::RecommendationUnavailable(
                    "no generator completed".into(),
                ))
            })
            .await;

        assert!(matches!(
            result,
            Err(RecommendationError::RecommendationUnavailable(_))
        ));
        assert!(cache.get("u1", &mix()).is_none());

        let retry = cache
            .get_or_compute("u1", &mix(), || async {
                Ok(set_for("u1", ChronoDuration::minutes(1)))
            })
            .await;
        assert!(retry.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_sole_caller_cancels_run() {
        let cache = RecommendationCache::new();
        let finished = Arc::new(AtomicBool::new(false));
        let caller = {
            let cache = cache.clone();
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                cache
                    .get_or_compute("u1", &mix(), move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(set_for("u1", ChronoDuration::minutes(15)))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!finished.load(Ordering::SeqCst));
        assert!(cache.get("u1", &mix()).is_none());
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(cache.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_run_survives_cancelled_caller() {
        let cache = RecommendationCache::new();
        let spawn_caller = |cache: RecommendationCache| {
            tokio::spawn(async move {
                cache
                    .get_or_compute("u1", &mix(), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(set_for("u1", ChronoDuration::minutes(15)))
                    })
                    .await
            })
        };

        let first = spawn_caller(cache.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = spawn_caller(cache.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();
        second.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cached = cache.get("u1", &mix()).expect("shared run completes");
        assert_eq!(cached.strategy_mix.strategies, vec![StrategyKind::Personalized]);
        assert_eq!(cache.stats().cancelled, 0);
    }

    #[tokio::test]
    async fn test_panicking_run_releases_its_slot() {
        let cache = RecommendationCache::new();
        let failed = cache
            .get_or_compute("u1", &mix(), || async {
                let overflowed = true;
                if overflowed {
                    panic!("expiry out of range");
                }
                Ok(set_for("u1", ChronoDuration::minutes(15)))
            })
            .await;
        assert!(matches!(failed, Err(RecommendationError::Internal(_))));
        assert_eq!(cache.in_flight_count(), 0);

        let retry = cache
            .get_or_compute("u1", &mix(), || async {
                Ok(set_for("u1", ChronoDuration::minutes(15)))
            })
            .await;
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_member_invalidation_drops_group_entry() {
        let cache = RecommendationCache::new();
        let members = vec!["u1".to_string(), "u2".to_string()];
        cache
            .get_or_compute_with_dependents("u1", &mix(), &members, || async {
                Ok(set_for("u1", ChronoDuration::minutes(15)))
            })
            .await
            .unwrap();
        assert!(cache.get("u1", &mix()).is_some());

        cache.invalidate("u3");
        assert!(cache.get("u1", &mix()).is_some());

        cache.invalidate("u2");
        assert!(cache.get("u1", &mix()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_invalidation_during_group_run_is_not_cached() {
        let cache = RecommendationCache::new();
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute_with_dependents(
                        "u1",
                        &mix(),
                        &["u2".to_string()],
                        || async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(set_for("u1", ChronoDuration::minutes(15)))
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate("u2");

        assert!(pending.await.unwrap().is_ok());
        assert!(cache.get("u1", &mix()).is_none());
        assert_eq!(cache.stats().discarded, 1);
    }

    #[test]
    fn test_expired_entries_are_swept() {
        let cache = RecommendationCache::new();
        for seed in 0..1000 {
            let request = RecommendationRequest {
                seed: Some(seed),
                ..Default::default()
            };
            let mix = StrategyMix::for_request(&request, 10);
            let mut set = set_for("u1", ChronoDuration::minutes(5));
            set.generated_at = Utc::now() - ChronoDuration::minutes(20);
            set.expires_at = Utc::now() - ChronoDuration::minutes(5);
            cache.put("u1", &mix, set);
        }
        assert!(cache.entry_count() <= 1);

        let mix = StrategyMix::for_request(&RecommendationRequest::default(), 3);
        assert!(cache.get("u1", &mix).is_none());
        assert_eq!(cache.entry_count(), 0);

        cache.put("u1", &mix, set_for("u1", ChronoDuration::minutes(5)));
        assert_eq!(cache.entry_count(), 1);
    }
}

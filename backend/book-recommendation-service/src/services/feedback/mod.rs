// ============================================
// Feedback & Accuracy Tracker
// ============================================
//
// Append-only feedback log per user. Delivery is at-least-once, so an
// event identical to one already recorded (user, book, action, timestamp)
// is absorbed silently.
//
// Accuracy metrics are derived on demand from the log and never stored:
//
//   acceptance_rate = accepted / (accepted + rejected)
//   precision       = (clicked + accepted) / shown, capped at 1
//
// Served recommendation sets are remembered (bounded per user) so that an
// accept/reject can be attributed to the strategies that proposed the book.

use crate::error::{require_id, Result};
use crate::models::{
    AccuracyMetric, BookId, FeedbackAction, FeedbackEvent, RecommendationSet, StrategyAccuracy,
    StrategyKind, TimeWindow, UserId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ServedSet {
    id: Uuid,
    served_at: DateTime<Utc>,
    /// Book -> strategies that contributed it
    books: HashMap<BookId, Vec<StrategyKind>>,
}

#[derive(Debug, Default)]
struct UserFeedback {
    events: Vec<FeedbackEvent>,
    seen: HashSet<FeedbackEvent>,
    served: VecDeque<ServedSet>,
    served_ids: HashSet<Uuid>,
}

impl UserFeedback {
    /// Latest served set at or before `at` that contained `book_id`
    fn attribution(&self, book_id: &str, at: DateTime<Utc>) -> Option<&[StrategyKind]> {
        self.served
            .iter()
            .rev()
            .filter(|s| s.served_at <= at)
            .find_map(|s| s.books.get(book_id))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    shown: u64,
    clicked: u64,
    accepted: u64,
    rejected: u64,
}

impl Counts {
    fn add(&mut self, action: FeedbackAction) {
        match action {
            FeedbackAction::Shown => self.shown += 1,
            FeedbackAction::Clicked => self.clicked += 1,
            FeedbackAction::Accepted => self.accepted += 1,
            FeedbackAction::Rejected => self.rejected += 1,
        }
    }

    fn into_metric(self, user_id: Option<UserId>, window: TimeWindow) -> AccuracyMetric {
        let sample_size = self.accepted + self.rejected;
        AccuracyMetric {
            user_id,
            window,
            shown: self.shown,
            clicked: self.clicked,
            accepted: self.accepted,
            rejected: self.rejected,
            acceptance_rate: ratio(self.accepted, sample_size),
            precision: ratio(self.clicked + self.accepted, self.shown).min(1.0),
            sample_size,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub struct FeedbackTracker {
    users: DashMap<UserId, UserFeedback>,
    attribution_capacity: usize,
}

impl FeedbackTracker {
    pub fn new(attribution_capacity: usize) -> Self {
        Self {
            users: DashMap::new(),
            attribution_capacity: attribution_capacity.max(1),
        }
    }

    /// Append a feedback event.
    ///
    /// Returns `false` when an identical event was already recorded.
    pub fn record(&self, event: FeedbackEvent) -> Result<bool> {
        require_id("user_id", &event.user_id)?;
        require_id("book_id", &event.book_id)?;

        let mut user = self.users.entry(event.user_id.clone()).or_default();
        if user.seen.contains(&event) {
            debug!(
                user_id = %event.user_id,
                book_id = %event.book_id,
                action = ?event.action,
                "Duplicate feedback absorbed"
            );
            return Ok(false);
        }

        user.seen.insert(event.clone());
        user.events.push(event);
        Ok(true)
    }

    /// Remember which strategies contributed each served book
    pub fn record_served(&self, set: &RecommendationSet) {
        let mut user = self.users.entry(set.user_id.clone()).or_default();
        if !user.served_ids.insert(set.id) {
            return;
        }

        user.served.push_back(ServedSet {
            id: set.id,
            served_at: set.generated_at,
            books: set
                .candidates
                .iter()
                .map(|c| (c.book_id.clone(), c.contributing_strategies()))
                .collect(),
        });
        while user.served.len() > self.attribution_capacity {
            if let Some(evicted) = user.served.pop_front() {
                user.served_ids.remove(&evicted.id);
            }
        }
    }

    /// Per-user metric over `window`; zero-sample when there is no data
    pub fn accuracy(&self, user_id: &str, window: TimeWindow) -> AccuracyMetric {
        let mut counts = Counts::default();
        if let Some(user) = self.users.get(user_id) {
            user.events
                .iter()
                .filter(|e| window.contains(e.timestamp))
                .for_each(|e| counts.add(e.action));
        }
        counts.into_metric(Some(user_id.to_string()), window)
    }

    /// Metric aggregated across every user
    pub fn overall_accuracy(&self, window: TimeWindow) -> AccuracyMetric {
        let mut counts = Counts::default();
        for user in self.users.iter() {
            user.events
                .iter()
                .filter(|e| window.contains(e.timestamp))
                .for_each(|e| counts.add(e.action));
        }
        counts.into_metric(None, window)
    }

    /// Acceptance per strategy, from accepts/rejects of books it helped serve
    pub fn strategy_accuracy(&self, window: TimeWindow) -> Vec<StrategyAccuracy> {
        let mut per_strategy: BTreeMap<StrategyKind, Counts> = BTreeMap::new();
        for user in self.users.iter() {
            for event in user.events.iter().filter(|e| window.contains(e.timestamp)) {
                if !matches!(
                    event.action,
                    FeedbackAction::Accepted | FeedbackAction::Rejected
                ) {
                    continue;
                }
                let Some(strategies) = user.attribution(&event.book_id, event.timestamp) else {
                    continue;
                };
                for strategy in strategies {
                    per_strategy.entry(*strategy).or_default().add(event.action);
                }
            }
        }

        per_strategy
            .into_iter()
            .map(|(strategy, counts)| {
                let sample_size = counts.accepted + counts.rejected;
                StrategyAccuracy {
                    strategy,
                    window,
                    accepted: counts.accepted,
                    rejected: counts.rejected,
                    acceptance_rate: ratio(counts.accepted, sample_size),
                    sample_size,
                }
            })
            .collect()
    }

    /// Books the user rejected through feedback at or after `since`
    pub fn rejected_books(&self, user_id: &str, since: DateTime<Utc>) -> HashSet<BookId> {
        self.users
            .get(user_id)
            .map(|user| {
                user.events
                    .iter()
                    .filter(|e| e.action == FeedbackAction::Rejected && e.timestamp >= since)
                    .map(|e| e.book_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recorded events of a user, in arrival order
    pub fn events(&self, user_id: &str) -> Vec<FeedbackEvent> {
        self.users
            .get(user_id)
            .map(|user| user.events.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candidate, RecommendationRequest, StrategyMix};
    use chrono::Duration;

    fn event(book: &str, action: FeedbackAction, at: DateTime<Utc>) -> FeedbackEvent {
        FeedbackEvent {
            user_id: "u1".to_string(),
            book_id: book.to_string(),
            action,
            timestamp: at,
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::last(Duration::days(1))
    }

    #[test]
    fn test_empty_window_is_zero_sample() {
        let tracker = FeedbackTracker::new(10);
        let metric = tracker.accuracy("nobody", window());
        assert_eq!(metric.sample_size, 0);
        assert_eq!(metric.acceptance_rate, 0.0);
        assert_eq!(metric.precision, 0.0);
        assert_eq!(metric.user_id.as_deref(), Some("nobody"));
    }

    #[test]
    fn test_duplicate_event_is_absorbed() {
        let tracker = FeedbackTracker::new(10);
        let at = Utc::now() - Duration::minutes(5);

        let window = window();

        assert!(tracker.record(event("b1", FeedbackAction::Accepted, at)).unwrap());
        let once = tracker.accuracy("u1", window);
        assert!(!tracker.record(event("b1", FeedbackAction::Accepted, at)).unwrap());
        let twice = tracker.accuracy("u1", window);

        assert_eq!(once, twice);
        assert_eq!(tracker.events("u1").len(), 1);
    }

    #[test]
    fn test_acceptance_and_precision() {
        let tracker = FeedbackTracker::new(10);
        let at = Utc::now() - Duration::minutes(5);
        for (book, action) in [
            ("b1", FeedbackAction::Shown),
            ("b2", FeedbackAction::Shown),
            ("b3", FeedbackAction::Shown),
            ("b4", FeedbackAction::Shown),
            ("b1", FeedbackAction::Clicked),
            ("b1", FeedbackAction::Accepted),
            ("b2", FeedbackAction::Rejected),
            ("b3", FeedbackAction::Rejected),
        ] {
            tracker.record(event(book, action, at)).unwrap();
        }
        // outside the window
        tracker
            .record(event("b9", FeedbackAction::Accepted, Utc::now() - Duration::days(3)))
            .unwrap();

        let metric = tracker.accuracy("u1", window());
        assert_eq!(metric.sample_size, 3);
        assert!((metric.acceptance_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((metric.precision - 0.5).abs() < 1e-9);
        assert_eq!(tracker.overall_accuracy(window()).accepted, 1);
        assert_eq!(
            tracker.rejected_books("u1", Utc::now() - Duration::days(1)),
            HashSet::from(["b2".to_string(), "b3".to_string()])
        );
    }

    #[test]
    fn test_rejects_empty_ids() {
        let tracker = FeedbackTracker::new(10);
        assert!(tracker
            .record(event("", FeedbackAction::Shown, Utc::now()))
            .is_err());
    }

    #[test]
    fn test_strategy_attribution() {
        let tracker = FeedbackTracker::new(10);
        let served_at = Utc::now() - Duration::minutes(10);
        let candidate = |id: &str, strategies: &[StrategyKind]| Candidate {
            book_id: id.to_string(),
            strategy_scores: strategies.iter().map(|s| (*s, 1.0)).collect(),
            combined_score: 1.0,
            explanations: Vec::new(),
        };
        let set = RecommendationSet {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            candidates: vec![
                candidate("b1", &[StrategyKind::Personalized, StrategyKind::Social]),
                candidate("b2", &[StrategyKind::Social]),
            ],
            generated_at: served_at,
            expires_at: served_at + Duration::minutes(15),
            strategy_mix: StrategyMix::for_request(&RecommendationRequest::default(), 10),
            degraded: false,
            warnings: Vec::new(),
        };
        tracker.record_served(&set);
        tracker.record_served(&set);

        let later = Utc::now() - Duration::minutes(1);
        tracker.record(event("b1", FeedbackAction::Accepted, later)).unwrap();
        tracker.record(event("b2", FeedbackAction::Rejected, later)).unwrap();
        tracker.record(event("b3", FeedbackAction::Accepted, later)).unwrap();

        let report = tracker.strategy_accuracy(window());
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].strategy, StrategyKind::Personalized);
        assert_eq!(report[0].acceptance_rate, 1.0);
        assert_eq!(report[1].strategy, StrategyKind::Social);
        assert_eq!(report[1].sample_size, 2);
        assert!((report[1].acceptance_rate - 0.5).abs() < 1e-9);
    }
}

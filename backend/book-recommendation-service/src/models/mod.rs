use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use uuid::Uuid;
use validator::Validate;

pub type UserId = String;
pub type BookId = String;

/// Scoring strategies the orchestrator can fan out to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Personalized,
    Contextual,
    Sequential,
    MultiObjective,
    Exploratory,
    Social,
    Group,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Personalized => "personalized",
            StrategyKind::Contextual => "contextual",
            StrategyKind::Sequential => "sequential",
            StrategyKind::MultiObjective => "multi_objective",
            StrategyKind::Exploratory => "exploratory",
            StrategyKind::Social => "social",
            StrategyKind::Group => "group",
        }
    }
}

/// Recommendation type requested by the caller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    #[default]
    Personalized,
    Contextual,
    Sequential,
    MultiObjective,
    Exploratory,
    Social,
    Group,
}

impl RecommendationType {
    /// Generators selected for this request type.
    ///
    /// Exploration and social requests blend with the personalized baseline so a
    /// sparse long tail or neighbourhood still yields a full page.
    pub fn strategies(&self) -> Vec<StrategyKind> {
        match self {
            RecommendationType::Personalized => vec![StrategyKind::Personalized],
            RecommendationType::Contextual => vec![StrategyKind::Contextual],
            RecommendationType::Sequential => vec![StrategyKind::Sequential],
            RecommendationType::MultiObjective => vec![StrategyKind::MultiObjective],
            RecommendationType::Exploratory => {
                vec![StrategyKind::Personalized, StrategyKind::Exploratory]
            }
            RecommendationType::Social => vec![StrategyKind::Personalized, StrategyKind::Social],
            RecommendationType::Group => vec![StrategyKind::Group],
        }
    }
}

/// Kind of reader interaction streamed into the profile store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    View,
    Like,
    Bookmark,
    Rate,
    Complete,
    Reject,
}

impl SignalType {
    /// Base polarity of the signal; the event weight scales it.
    pub fn polarity(&self) -> f64 {
        match self {
            SignalType::View => 0.2,
            SignalType::Bookmark => 0.6,
            SignalType::Like => 0.8,
            SignalType::Rate => 1.0,
            SignalType::Complete => 1.0,
            SignalType::Reject => -1.0,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.polarity() > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionEvent {
    pub book_id: BookId,
    pub signal: SignalType,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_signal_weight")]
    pub weight: f64,
}

fn default_signal_weight() -> f64 {
    1.0
}

impl InteractionEvent {
    pub fn new(book_id: impl Into<BookId>, signal: SignalType, weight: f64) -> Self {
        Self {
            book_id: book_id.into(),
            signal,
            timestamp: Utc::now(),
            weight,
        }
    }

    /// Polarity-scaled weight applied to the interest vector.
    pub fn signal_weight(&self) -> f64 {
        self.signal.polarity() * self.weight
    }
}

/// Live interest representation of a reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Dense weights over `genre:*`, `topic:*` and `author:*` dimensions
    pub interests: BTreeMap<String, f64>,
    /// Bounded recent interaction window, oldest first
    pub recent: VecDeque<InteractionEvent>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            interests: BTreeMap::new(),
            recent: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_interests(mut self, interests: BTreeMap<String, f64>) -> Self {
        self.interests = interests;
        self
    }

    /// Strongest positive interest dimension, ties broken by name.
    pub fn top_dimension(&self) -> Option<(&str, f64)> {
        self.interests
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .fold(None, |best: Option<(&str, f64)>, (dim, w)| match best {
                Some((_, bw)) if bw >= *w => best,
                _ => Some((dim.as_str(), *w)),
            })
    }

    /// Books completed or rejected at or after `since`.
    pub fn consumed_since(&self, since: DateTime<Utc>) -> HashSet<BookId> {
        self.recent
            .iter()
            .filter(|e| e.timestamp >= since)
            .filter(|e| matches!(e.signal, SignalType::Complete | SignalType::Reject))
            .map(|e| e.book_id.clone())
            .collect()
    }

    /// Books completed at or after `since`.
    pub fn completed_since(&self, since: DateTime<Utc>) -> HashSet<BookId> {
        self.recent
            .iter()
            .filter(|e| e.timestamp >= since && e.signal == SignalType::Complete)
            .map(|e| e.book_id.clone())
            .collect()
    }

    /// Most recently finished book, falling back to the latest positive interaction.
    pub fn last_read(&self) -> Option<&BookId> {
        self.recent
            .iter()
            .rev()
            .find(|e| e.signal == SignalType::Complete)
            .or_else(|| self.recent.iter().rev().find(|e| e.signal.is_positive()))
            .map(|e| &e.book_id)
    }
}

/// Catalog entry supplied by the book store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub id: BookId,
    /// Content features over the same dimensions as profile interests
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    pub genre: String,
    pub language: String,
    pub page_count: u32,
    /// Raw popularity signal (reads, ratings); only its rank matters
    #[serde(default)]
    pub popularity: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LocationClass {
    Home,
    Commute,
    Travel,
    Work,
}

impl LocationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationClass::Home => "home",
            LocationClass::Commute => "commute",
            LocationClass::Travel => "travel",
            LocationClass::Work => "work",
        }
    }
}

/// Request-supplied reading context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestContext {
    pub time_of_day: Option<TimeOfDay>,
    pub mood: Option<String>,
    pub location: Option<LocationClass>,
}

impl RequestContext {
    /// Lookup keys into the context boost table, e.g. `time_of_day:night`.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(t) = self.time_of_day {
            keys.push(format!("time_of_day:{}", t.as_str()));
        }
        if let Some(mood) = &self.mood {
            keys.push(format!("mood:{}", mood.trim().to_ascii_lowercase()));
        }
        if let Some(l) = self.location {
            keys.push(format!("location:{}", l.as_str()));
        }
        keys
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestFilters {
    pub genre: Option<String>,
    pub language: Option<String>,
    pub max_length: Option<u32>,
}

impl RequestFilters {
    pub fn admits(&self, book: &Book) -> bool {
        if let Some(genre) = &self.genre {
            if !book.genre.eq_ignore_ascii_case(genre) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if !book.language.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        if let Some(max) = self.max_length {
            if book.page_count > max {
                return false;
            }
        }
        true
    }
}

/// Inbound recommendation request parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct RecommendationRequest {
    #[serde(rename = "type", default)]
    pub kind: RecommendationType,
    #[validate(range(min = 1, max = 50))]
    pub count: Option<usize>,
    #[serde(default)]
    pub filters: RequestFilters,
    pub context: Option<RequestContext>,
    /// Objective name -> weight, for multi-objective requests
    pub objectives: Option<BTreeMap<String, f64>>,
    #[validate(length(min = 1, max = 50))]
    pub group_members: Option<Vec<UserId>>,
    /// Seed book for sequential requests
    pub just_read: Option<BookId>,
    /// Exploration seed; derived from the user id when absent
    pub seed: Option<u64>,
    /// Allow previously rejected books back into the candidate pool
    #[serde(default)]
    pub include_rejected: bool,
}

impl RecommendationRequest {
    pub fn of_type(kind: RecommendationType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// Identity of a cached result: the strategies that produced it plus the request shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StrategyMix {
    pub strategies: Vec<StrategyKind>,
    pub fingerprint: String,
}

impl StrategyMix {
    pub fn for_request(request: &RecommendationRequest, count: usize) -> Self {
        let strategies = request.kind.strategies();
        let names: Vec<&str> = strategies.iter().map(|s| s.as_str()).collect();
        let mut normalized = request.clone();
        normalized.count = Some(count);
        let shape = serde_json::to_string(&normalized).unwrap_or_default();
        Self {
            fingerprint: format!("{}|{}", names.join("+"), shape),
            strategies,
        }
    }
}

/// A scored book inside a recommendation set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub book_id: BookId,
    /// Normalized score per contributing strategy
    pub strategy_scores: BTreeMap<StrategyKind, f64>,
    pub combined_score: f64,
    pub explanations: Vec<String>,
}

impl Candidate {
    pub fn contributing_strategies(&self) -> Vec<StrategyKind> {
        self.strategy_scores.keys().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationSet {
    pub id: Uuid,
    pub user_id: UserId,
    /// Rank order
    pub candidates: Vec<Candidate>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub strategy_mix: StrategyMix,
    pub degraded: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RecommendationSet {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.generated_at <= now && now < self.expires_at
    }

    pub fn book_ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.book_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Shown,
    Clicked,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FeedbackEvent {
    pub user_id: UserId,
    pub book_id: BookId,
    pub action: FeedbackAction,
    pub timestamp: DateTime<Utc>,
}

/// Closed time interval used for windowed aggregation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending now and reaching back `span`.
    pub fn last(span: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - span,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccuracyMetric {
    /// `None` for metrics aggregated across all users
    pub user_id: Option<UserId>,
    pub window: TimeWindow,
    pub shown: u64,
    pub clicked: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// accepted / (accepted + rejected)
    pub acceptance_rate: f64,
    /// (clicked + accepted) / shown, capped at 1
    pub precision: f64,
    /// accepted + rejected
    pub sample_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyAccuracy {
    pub strategy: StrategyKind,
    pub window: TimeWindow,
    pub accepted: u64,
    pub rejected: u64,
    pub acceptance_rate: f64,
    pub sample_size: u64,
}

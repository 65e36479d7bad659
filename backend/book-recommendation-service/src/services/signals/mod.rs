//! Training / embedding / similarity completion signals
//!
//! External pipelines announce finished work asynchronously and deliver at
//! least once. Each signal is deduplicated by its event id (or a hash of its
//! content when it carries none), applies any payload it ships, then
//! invalidates cached recommendations for its scope.
//!
//! ```text
//! signal ─▶ validate ─▶ seen? ──yes──▶ AlreadyProcessed
//!                         │ no
//!                         ▼
//!          similarity payload ─▶ SimilarityIndex::refresh
//!          catalog payload    ─▶ BookCatalog::replace
//!                         ▼
//!          scope Global ─▶ invalidate_all   Users(ids) ─▶ invalidate(id)
//! ```

use crate::models::{Book, UserId};
use crate::services::cache::RecommendationCache;
use crate::services::catalog::BookCatalog;
use crate::services::similarity::{RefreshOutcome, SimilarityIndex, SimilarityPayload};
use crate::utils::seed_from;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ModelTrainingCompleted,
    EmbeddingsUpdated,
    SimilarityCalculationCompleted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type", content = "user_ids")]
pub enum SignalScope {
    #[default]
    Global,
    Users(Vec<UserId>),
}

/// Replacement catalog shipped with an embeddings update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogPayload {
    pub version: Option<String>,
    pub books: Vec<Book>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSignal {
    pub event_id: Option<String>,
    pub kind: SignalKind,
    #[serde(default)]
    pub scope: SignalScope,
    pub similarity: Option<SimilarityPayload>,
    pub catalog: Option<CatalogPayload>,
    pub emitted_at: Option<DateTime<Utc>>,
}

impl TrainingSignal {
    pub fn new(kind: SignalKind, scope: SignalScope) -> Self {
        Self {
            event_id: None,
            kind,
            scope,
            similarity: None,
            catalog: None,
            emitted_at: Some(Utc::now()),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_similarity(mut self, payload: SimilarityPayload) -> Self {
        self.similarity = Some(payload);
        self
    }

    pub fn with_catalog(mut self, payload: CatalogPayload) -> Self {
        self.catalog = Some(payload);
        self
    }

    /// Event id, or a content hash for signals delivered without one
    pub fn dedup_key(&self) -> String {
        match &self.event_id {
            Some(id) if !id.trim().is_empty() => format!("id:{}", id),
            _ => {
                let content = serde_json::to_string(self).unwrap_or_default();
                format!("hash:{:016x}", seed_from(&content))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Invalid signal: {0}")]
    Invalid(String),

    #[error("Malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Processed,
    /// Duplicate delivery, absorbed
    AlreadyProcessed,
}

/// Bounded memory of processed signal keys, oldest forgotten first
struct SeenSignals {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSignals {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// `false` when the key was already present
    fn insert(&mut self, key: String) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

pub struct SignalHandler {
    similarity: Arc<SimilarityIndex>,
    catalog: Arc<BookCatalog>,
    cache: RecommendationCache,
    seen: Mutex<SeenSignals>,
}

impl SignalHandler {
    pub fn new(
        similarity: Arc<SimilarityIndex>,
        catalog: Arc<BookCatalog>,
        cache: RecommendationCache,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            similarity,
            catalog,
            cache,
            seen: Mutex::new(SeenSignals::new(dedup_capacity)),
        }
    }

    pub fn handle_json(&self, raw: &str) -> Result<SignalOutcome, SignalError> {
        let signal: TrainingSignal = serde_json::from_str(raw)?;
        self.handle(signal)
    }

    pub fn handle(&self, signal: TrainingSignal) -> Result<SignalOutcome, SignalError> {
        if let SignalScope::Users(users) = &signal.scope {
            if users.is_empty() || users.iter().any(|u| u.trim().is_empty()) {
                return Err(SignalError::Invalid(
                    "user scope needs at least one non-empty user id".to_string(),
                ));
            }
        }

        let key = signal.dedup_key();
        let first_delivery = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        if !first_delivery {
            debug!(key = %key, kind = ?signal.kind, "Duplicate signal absorbed");
            return Ok(SignalOutcome::AlreadyProcessed);
        }

        if let Some(payload) = &signal.similarity {
            if self.similarity.refresh(payload) == RefreshOutcome::Unchanged {
                debug!(key = %key, "Similarity payload unchanged");
            }
        } else if signal.kind == SignalKind::SimilarityCalculationCompleted {
            warn!(key = %key, "Similarity signal without payload, invalidating only");
        }

        if let Some(payload) = signal.catalog {
            if !self.catalog.replace(payload.books, payload.version) {
                debug!(key = %key, "Catalog version unchanged");
            }
        }

        match &signal.scope {
            SignalScope::Global => self.cache.invalidate_all(),
            SignalScope::Users(users) => self.cache.invalidate_users(users),
        }

        info!(
            key = %key,
            kind = ?signal.kind,
            scope = ?signal.scope,
            "Signal processed"
        );
        Ok(SignalOutcome::Processed)
    }
}

// ============================================
// Similarity Index
// ============================================
//
// Precomputed book<->book and user<->user closeness in [0, 1].
// Symmetric; rebuilt in bulk from an external "similarity calculation
// completed" payload and published with a pointer swap, so readers
// always see one complete generation.

use crate::models::{BookId, UserId};
use crate::utils::rank_order;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityPair {
    pub a: String,
    pub b: String,
    pub score: f64,
}

impl SimilarityPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>, score: f64) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            score,
        }
    }
}

/// Bulk refresh payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimilarityPayload {
    pub version: Option<String>,
    #[serde(default)]
    pub books: Vec<SimilarityPair>,
    #[serde(default)]
    pub users: Vec<SimilarityPair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    /// Payload version already live
    Unchanged,
}

#[derive(Debug, Default)]
struct PairTable {
    pairs: HashMap<(String, String), f64>,
    neighbors: HashMap<String, Vec<(String, f64)>>,
}

impl PairTable {
    fn build(input: &[SimilarityPair]) -> (Self, usize) {
        let mut pairs = HashMap::new();
        let mut skipped = 0;
        for pair in input {
            if pair.a == pair.b || pair.a.is_empty() || pair.b.is_empty() || !pair.score.is_finite()
            {
                skipped += 1;
                continue;
            }
            pairs.insert(ordered_key(&pair.a, &pair.b), pair.score.clamp(0.0, 1.0));
        }

        let mut neighbors: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for ((a, b), score) in &pairs {
            neighbors.entry(a.clone()).or_default().push((b.clone(), *score));
            neighbors.entry(b.clone()).or_default().push((a.clone(), *score));
        }
        for list in neighbors.values_mut() {
            list.sort_by(|x, y| rank_order(x.1, &x.0, y.1, &y.0));
        }

        (Self { pairs, neighbors }, skipped)
    }

    fn neighbors(&self, id: &str) -> &[(String, f64)] {
        self.neighbors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn score(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        self.pairs
            .get(&ordered_key(a, b))
            .copied()
            .unwrap_or(0.0)
    }
}

fn ordered_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One complete index generation
#[derive(Debug, Default)]
pub struct SimilaritySnapshot {
    books: PairTable,
    users: PairTable,
    version: Option<String>,
}

impl SimilaritySnapshot {
    pub fn from_payload(payload: &SimilarityPayload) -> Self {
        let (books, skipped_books) = PairTable::build(&payload.books);
        let (users, skipped_users) = PairTable::build(&payload.users);
        if skipped_books + skipped_users > 0 {
            warn!(
                skipped_books,
                skipped_users, "Dropped malformed similarity pairs"
            );
        }
        Self {
            books,
            users,
            version: payload.version.clone(),
        }
    }

    /// Neighbours of a book, descending by score, ties by id ascending
    pub fn book_neighbors(&self, book_id: &str) -> &[(BookId, f64)] {
        self.books.neighbors(book_id)
    }

    pub fn user_neighbors(&self, user_id: &str) -> &[(UserId, f64)] {
        self.users.neighbors(user_id)
    }

    /// Pairwise book similarity; unknown pairs are 0, identical ids are 1
    pub fn book_score(&self, a: &str, b: &str) -> f64 {
        self.books.score(a, b)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

pub struct SimilarityIndex {
    current: RwLock<Arc<SimilaritySnapshot>>,
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(SimilaritySnapshot::default())),
        }
    }

    pub fn from_payload(payload: &SimilarityPayload) -> Self {
        Self {
            current: RwLock::new(Arc::new(SimilaritySnapshot::from_payload(payload))),
        }
    }

    pub fn snapshot(&self) -> Arc<SimilaritySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn book_similarity(&self, book_id: &str) -> Vec<(BookId, f64)> {
        self.snapshot().book_neighbors(book_id).to_vec()
    }

    pub fn user_similarity(&self, user_id: &str) -> Vec<(UserId, f64)> {
        self.snapshot().user_neighbors(user_id).to_vec()
    }

    /// Rebuild from `payload` and swap it in.
    ///
    /// The new generation is built before the write lock is taken; readers
    /// never wait on the rebuild.
    pub fn refresh(&self, payload: &SimilarityPayload) -> RefreshOutcome {
        if payload.version.is_some() && self.snapshot().version() == payload.version.as_deref() {
            info!(
                version = ?payload.version,
                "Similarity payload already applied, skipping"
            );
            return RefreshOutcome::Unchanged;
        }

        let next = Arc::new(SimilaritySnapshot::from_payload(payload));
        {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            *guard = next;
        }

        info!(
            version = ?payload.version,
            book_pairs = payload.books.len(),
            user_pairs = payload.users.len(),
            "Similarity index refreshed"
        );
        RefreshOutcome::Applied
    }
}

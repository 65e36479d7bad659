// ============================================
// Personalized Scoring Oracle
// ============================================
//
// External model that refines personalized scores. Treated as
// unreliable: every call carries its own budget, and responses are
// sanitized before use (unknown ids, non-finite or out-of-range
// scores are dropped).

use crate::models::{BookId, UserProfile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Score `books` for `profile`; may omit books it cannot score
    async fn score(&self, profile: &UserProfile, books: &[BookId]) -> Result<HashMap<BookId, f64>>;
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle call timed out after {0:?}")]
    Elapsed(Duration),

    #[error("Oracle call failed: {0}")]
    OperationFailed(String),
}

/// Oracle scores that survived sanitization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleScores {
    pub scores: HashMap<BookId, f64>,
    /// Requested books missing from the response or carrying unusable scores
    pub missing: usize,
}

impl OracleScores {
    pub fn is_partial(&self) -> bool {
        self.missing > 0
    }
}

/// Call the oracle within `budget` and sanitize its answer
pub async fn score_with_budget(
    oracle: &dyn ScoringOracle,
    profile: &UserProfile,
    books: &[BookId],
    budget: Duration,
) -> std::result::Result<OracleScores, OracleError> {
    let raw = match timeout(budget, oracle.score(profile, books)).await {
        Ok(Ok(scores)) => scores,
        Ok(Err(e)) => return Err(OracleError::OperationFailed(e.to_string())),
        Err(_) => return Err(OracleError::Elapsed(budget)),
    };

    let requested: HashSet<&str> = books.iter().map(String::as_str).collect();
    let scores: HashMap<BookId, f64> = raw
        .into_iter()
        .filter(|(id, score)| {
            requested.contains(id.as_str()) && score.is_finite() && (0.0..=1.0).contains(score)
        })
        .collect();

    Ok(OracleScores {
        missing: requested.len().saturating_sub(scores.len()),
        scores,
    })
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    user_id: &'a str,
    interests: &'a BTreeMap<String, f64>,
    book_ids: &'a [BookId],
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: HashMap<BookId, f64>,
}

/// Oracle reached over HTTP
///
/// POST `{user_id, interests, book_ids}` -> `{scores: {book_id: score}}`
pub struct HttpScoringOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpScoringOracle {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ScoringOracle for HttpScoringOracle {
    async fn score(&self, profile: &UserProfile, books: &[BookId]) -> Result<HashMap<BookId, f64>> {
        let body = ScoreRequest {
            user_id: &profile.user_id,
            interests: &profile.interests,
            book_ids: books,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Oracle request failed")?
            .error_for_status()
            .context("Oracle returned error status")?;

        let parsed: ScoreResponse = response
            .json()
            .await
            .context("Malformed oracle response")?;

        Ok(parsed.scores)
    }
}

// Candidate merging
//
//   generator outputs ─▶ max-normalize per strategy ─▶ union by book id
//                    ─▶ weighted sum ─▶ rank (or greedy diversity rerank)

use crate::config::StrategyWeights;
use crate::models::{BookId, Candidate, StrategyKind};
use crate::services::similarity::SimilaritySnapshot;
use crate::services::strategies::ScoredBook;
use crate::utils::rank_order;
use std::collections::{BTreeMap, HashMap};

/// Union the generator outputs into candidates with combined scores.
///
/// Each strategy's raw scores are divided by its best score so strategies on
/// different scales weigh in equally. Explanations follow strategy order.
pub fn merge_candidates(
    outputs: &[(StrategyKind, Vec<ScoredBook>)],
    weights: &StrategyWeights,
) -> Vec<Candidate> {
    let mut merged: HashMap<BookId, Candidate> = HashMap::new();
    let mut tags: HashMap<BookId, BTreeMap<StrategyKind, String>> = HashMap::new();

    for (kind, scored) in outputs {
        let max = scored
            .iter()
            .map(|s| s.score)
            .filter(|s| s.is_finite())
            .fold(0.0_f64, f64::max);

        for item in scored.iter().filter(|s| s.score.is_finite()) {
            let normalized = if max > 0.0 {
                (item.score / max).max(0.0)
            } else {
                0.0
            };
            let candidate = merged
                .entry(item.book_id.clone())
                .or_insert_with(|| Candidate {
                    book_id: item.book_id.clone(),
                    strategy_scores: BTreeMap::new(),
                    combined_score: 0.0,
                    explanations: Vec::new(),
                });
            // a generator listing a book twice keeps its best score
            let slot = candidate.strategy_scores.entry(*kind).or_insert(normalized);
            *slot = slot.max(normalized);
            tags.entry(item.book_id.clone())
                .or_default()
                .entry(*kind)
                .or_insert_with(|| item.explanation.clone());
        }
    }

    merged
        .into_values()
        .map(|mut candidate| {
            candidate.combined_score = candidate
                .strategy_scores
                .iter()
                .map(|(kind, score)| weights.weight(*kind) * score)
                .sum();
            if let Some(by_strategy) = tags.remove(&candidate.book_id) {
                for tag in by_strategy.into_values() {
                    if !candidate.explanations.contains(&tag) {
                        candidate.explanations.push(tag);
                    }
                }
            }
            candidate
        })
        .collect()
}

/// Sort by combined score descending, book id ascending, and keep `count`
pub fn rank(mut candidates: Vec<Candidate>, count: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| rank_order(a.combined_score, &a.book_id, b.combined_score, &b.book_id));
    candidates.truncate(count);
    candidates
}

/// Greedy diversity rerank
///
/// Repeatedly selects the candidate maximizing
/// `combined + weight * (1 - mean similarity to the already selected)`;
/// the first pick has nothing to be similar to and scores a full bonus.
/// Selection order is rank order and the greedy score becomes the combined score.
pub struct DiversityReranker<'a> {
    similarity: &'a SimilaritySnapshot,
    weight: f64,
}

impl<'a> DiversityReranker<'a> {
    pub fn new(similarity: &'a SimilaritySnapshot, weight: f64) -> Self {
        Self { similarity, weight }
    }

    pub fn rerank(&self, candidates: Vec<Candidate>, count: usize) -> Vec<Candidate> {
        let mut pool = candidates;
        let mut selected: Vec<Candidate> = Vec::with_capacity(count.min(pool.len()));

        while selected.len() < count && !pool.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (i, candidate) in pool.iter().enumerate() {
                let score = candidate.combined_score + self.weight * self.novelty(candidate, &selected);
                let better = match best {
                    None => true,
                    Some((j, best_score)) => {
                        rank_order(score, &candidate.book_id, best_score, &pool[j].book_id)
                            == std::cmp::Ordering::Less
                    }
                };
                if better {
                    best = Some((i, score));
                }
            }

            let Some((index, score)) = best else {
                break;
            };
            let mut pick = pool.swap_remove(index);
            pick.combined_score = score;
            selected.push(pick);
        }

        selected
    }

    /// 1 - mean similarity to the selected books
    fn novelty(&self, candidate: &Candidate, selected: &[Candidate]) -> f64 {
        if selected.is_empty() {
            return 1.0;
        }
        let total: f64 = selected
            .iter()
            .map(|s| self.similarity.book_score(&candidate.book_id, &s.book_id))
            .sum();
        1.0 - total / selected.len() as f64
    }
}

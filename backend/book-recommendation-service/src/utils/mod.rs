// Utility functions for book-recommendation-service

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sparse dot product over named dimensions
pub fn dot_product(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(dim, w)| large.get(dim).map(|v| w * v))
        .sum()
}

/// Descending by score, ascending by id. NaN sorts last.
pub fn rank_order(a_score: f64, a_id: &str, b_score: f64, b_id: &str) -> Ordering {
    match (a_score.is_nan(), b_score.is_nan()) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}

/// Stable seed derived from a string, used when a request carries no explicit seed
pub fn seed_from(key: &str) -> u64 {
    // FNV-1a
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

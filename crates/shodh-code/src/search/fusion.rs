//! Reciprocal Rank Fusion.
//!
//! Rank-only merge of the two backend result lists:
//! `score(d) = Σ 1 / (k + rank(d))` over the backends that returned `d`,
//! with ranks starting at 1 and `k = 60`. Documents absent from a backend
//! contribute nothing from that backend, which makes the merge robust to
//! backend-specific score scales and to one side lagging or failing.

use std::collections::HashMap;

pub const DEFAULT_RRF_K: usize = 60;

pub fn reciprocal_rank_fusion(
    keyword_ids: &[String],
    vector_ids: &[String],
    k: usize,
) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, id) in keyword_ids.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f32 + rank as f32 + 1.0);
    }
    for (rank, id) in vector_ids.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f32 + rank as f32 + 1.0);
    }

    scores
}

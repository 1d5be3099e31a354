//! Score fusion for vector, lexical, and hybrid retrieval.
//!
//! The fusion step is pure: it takes the raw candidate lists produced by
//! the vector store and the lexical index and turns them into one ranked
//! list. Fetching the lists, hydrating chunks and degradation handling live
//! in the app crate's search service.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Normalize each list to `[0, 1]` independently (min-max).
//! 2. Combine: `score = α × vector + (1 - α) × lexical`. A chunk missing
//!    from one list gets nothing from that list; it is not penalized.
//! 3. Sort by score (desc), raw vector similarity (desc, chunks without a
//!    vector score last), chunk id (asc).
//! 4. Truncate to `k`.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::ChunkCandidate;

/// Which retrieval backends a query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Lexical,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Lexical => "lexical",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" | "semantic" => Some(SearchMode::Vector),
            "lexical" | "keyword" => Some(SearchMode::Lexical),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

/// One fused result, before hydration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedCandidate {
    pub chunk_id: String,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    pub vector_score: Option<f64>,
    pub lexical_score: Option<f64>,
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Fuse vector and lexical candidates into one ranked list of at most `k`.
///
/// `alpha` is the weight of the vector list. Callers running a single
/// backend pass `1.0` (vector only) or `0.0` (lexical only) so the
/// surviving list keeps its full weight.
pub fn fuse(
    vector: &[ChunkCandidate],
    lexical: &[ChunkCandidate],
    alpha: f64,
    k: usize,
) -> Vec<FusedCandidate> {
    let alpha = alpha.clamp(0.0, 1.0);

    let mut merged: HashMap<&str, FusedCandidate> = HashMap::new();
    for (c, norm) in normalize_scores(vector) {
        let entry = merged
            .entry(c.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: c.chunk_id.clone(),
                score: 0.0,
                vector_score: None,
                lexical_score: None,
            });
        // A backend may repeat an id; keep its best score.
        if entry.vector_score.map_or(true, |s| c.raw_score > s) {
            entry.vector_score = Some(c.raw_score);
            entry.score = alpha * norm;
        }
    }

    let mut lexical_norms: HashMap<&str, (f64, f64)> = HashMap::new();
    for (c, norm) in normalize_scores(lexical) {
        let slot = lexical_norms
            .entry(c.chunk_id.as_str())
            .or_insert((c.raw_score, norm));
        if c.raw_score > slot.0 {
            *slot = (c.raw_score, norm);
        }
    }
    for (id, (raw, norm)) in lexical_norms {
        let entry = merged.entry(id).or_insert_with(|| FusedCandidate {
            chunk_id: id.to_string(),
            score: 0.0,
            vector_score: None,
            lexical_score: None,
        });
        entry.lexical_score = Some(raw);
        entry.score += (1.0 - alpha) * norm;
    }

    let mut ranked: Vec<FusedCandidate> = merged.into_values().collect();
    ranked.sort_by(compare_fused);
    ranked.truncate(k);
    ranked
}

/// Total order used for ranking: score desc, raw vector score desc, id asc.
pub fn compare_fused(a: &FusedCandidate, b: &FusedCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            let av = a.vector_score.unwrap_or(f64::NEG_INFINITY);
            let bv = b.vector_score.unwrap_or(f64::NEG_INFINITY);
            bv.partial_cmp(&av).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn c(id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate::new(id, score)
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![c("c1", 5.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![c("c1", 10.0), c("c2", 5.0), c("c3", 0.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_negative_scores_stay_in_unit() {
        let candidates = vec![c("c1", -5.0), c("c2", 100.0), c("c3", 42.0)];
        for (_, s) in normalize_scores(&candidates) {
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn fuse_weights_both_lists() {
        let vector = vec![c("a", 0.9), c("b", 0.5)];
        let lexical = vec![c("b", 12.0), c("c", 3.0)];
        let out = fuse(&vector, &lexical, 0.5, 10);
        let scores: HashMap<&str, f64> =
            out.iter().map(|f| (f.chunk_id.as_str(), f.score)).collect();
        assert!((scores["a"] - 0.5).abs() < 1e-9);
        assert!((scores["b"] - 0.5).abs() < 1e-9);
        assert!(scores["c"].abs() < 1e-9);
        // a and b tie at 0.5; a has the higher raw vector score.
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[1].chunk_id, "b");
        assert_eq!(out[2].chunk_id, "c");
    }

    #[test]
    fn fuse_single_list_keeps_full_weight() {
        let lexical = vec![c("x", 4.0), c("y", 2.0)];
        let out = fuse(&[], &lexical, 0.0, 5);
        assert_eq!(out[0].chunk_id, "x");
        assert!((out[0].score - 1.0).abs() < 1e-9);
        assert!(out[0].vector_score.is_none());
        assert_eq!(out[0].lexical_score, Some(4.0));
    }

    #[test]
    fn fuse_tie_breaks_by_chunk_id_without_vector_scores() {
        let lexical = vec![c("zeta", 1.0), c("alpha", 1.0), c("mid", 1.0)];
        let out = fuse(&[], &lexical, 0.5, 10);
        let ids: Vec<&str> = out.iter().map(|f| f.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn fuse_is_deterministic() {
        let vector: Vec<ChunkCandidate> = (0..20).map(|i| c(&format!("v{i:02}"), 0.5)).collect();
        let lexical: Vec<ChunkCandidate> = (0..20).map(|i| c(&format!("l{i:02}"), 1.0)).collect();
        let first = fuse(&vector, &lexical, 0.5, 15);
        for _ in 0..10 {
            assert_eq!(fuse(&vector, &lexical, 0.5, 15), first);
        }
    }

    #[test]
    fn fuse_result_is_subset_of_union() {
        let vector = vec![c("a", 0.3), c("b", 0.2), c("d", 0.9)];
        let lexical = vec![c("b", 1.0), c("e", 7.0)];
        let union: HashSet<&str> = ["a", "b", "d", "e"].into_iter().collect();
        let out = fuse(&vector, &lexical, 0.7, 3);
        assert_eq!(out.len(), 3);
        for f in &out {
            assert!(union.contains(f.chunk_id.as_str()));
        }
    }

    #[test]
    fn search_mode_aliases() {
        assert_eq!(SearchMode::parse("keyword"), Some(SearchMode::Lexical));
        assert_eq!(SearchMode::parse("semantic"), Some(SearchMode::Vector));
        assert_eq!(SearchMode::parse("fuzzy"), None);
    }
}

//! Reciprocal rank fusion and query intent.
//!
//! `score(doc) = Σ weight_source / (k + rank_source(doc))` with 1-based ranks
//! and weights normalized to sum to 1. Documents are identified by
//! [`SearchResult::identity`]; the first list a document appears in supplies
//! its excerpt and other fields.

use std::collections::HashMap;

use crate::config::HybridWeights;
use crate::types::SearchResult;

/// Rank offset; dampens the advantage of top positions.
pub const RRF_K: f64 = 60.0;

/// Contribution of one ranked position.
#[must_use]
pub fn rrf_score(weight: f64, rank: usize, k: f64) -> f64 {
    // Ranks are small; precision loss above 2^52 is irrelevant here.
    #[allow(clippy::cast_precision_loss)]
    let rank = rank as f64;
    weight / (k + rank)
}

/// Scale weights to sum to 1. Non-positive totals give equal weights.
#[must_use]
pub fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    let clamped: Vec<f64> = weights.iter().map(|w| w.max(0.0)).collect();
    let total: f64 = clamped.iter().sum();
    if total > 0.0 {
        clamped.iter().map(|w| w / total).collect()
    } else if weights.is_empty() {
        Vec::new()
    } else {
        #[allow(clippy::cast_precision_loss)]
        let equal = 1.0 / weights.len() as f64;
        vec![equal; weights.len()]
    }
}

/// One ranked input list.
#[derive(Debug, Clone)]
pub struct RankedList {
    /// Signal name recorded in fused metadata (`fts`, `vector`)
    pub source: String,
    /// Relative weight before normalization
    pub weight: f64,
    /// Results, best first
    pub results: Vec<SearchResult>,
}

impl RankedList {
    /// A named list with a weight.
    #[must_use]
    pub fn new(source: impl Into<String>, weight: f64, results: Vec<SearchResult>) -> Self {
        Self {
            source: source.into(),
            weight,
            results,
        }
    }
}

/// Fuse ranked lists.
///
/// The output is ordered by fused score descending, ties by path then start
/// line. Each result carries `metadata.rrf_sources` naming the lists it came
/// from.
#[must_use]
pub fn reciprocal_rank_fusion(lists: Vec<RankedList>, k: f64) -> Vec<SearchResult> {
    let weights = normalize_weights(&lists.iter().map(|l| l.weight).collect::<Vec<_>>());

    let mut fused: Vec<(SearchResult, f64, Vec<String>)> = Vec::new();
    let mut positions: HashMap<_, usize> = HashMap::new();

    for (list, weight) in lists.into_iter().zip(weights) {
        let mut seen_in_list = std::collections::HashSet::new();
        for (index, result) in list.results.into_iter().enumerate() {
            let identity = result.identity();
            if !seen_in_list.insert(identity.clone()) {
                continue;
            }
            let contribution = rrf_score(weight, index + 1, k);
            if let Some(&at) = positions.get(&identity) {
                let entry = &mut fused[at];
                entry.1 += contribution;
                entry.2.push(list.source.clone());
            } else {
                positions.insert(identity, fused.len());
                fused.push((result, contribution, vec![list.source.clone()]));
            }
        }
    }

    let mut out: Vec<SearchResult> = fused
        .into_iter()
        .map(|(result, score, sources)| {
            result
                .with_score(score)
                .with_metadata("rrf_sources", sources)
        })
        .collect();
    crate::types::sort_results(&mut out);
    out
}

/// What a query most likely asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Identifier-shaped: `AuthManager`, `parse_config`, `std::fs::read`
    Keyword,
    /// Natural language: "how are sessions refreshed"
    Semantic,
    /// A bit of both
    Mixed,
}

fn is_identifier_token(token: &str) -> bool {
    let has_case_hump = token
        .chars()
        .zip(token.chars().skip(1))
        .any(|(a, b)| a.is_lowercase() && b.is_uppercase());
    let has_code_punct = token.contains("::")
        || token.contains('_')
        || token.contains("()")
        || (token.contains('.') && !token.ends_with('.'));
    let starts_upper = token.chars().next().is_some_and(char::is_uppercase)
        && token.chars().skip(1).any(char::is_lowercase)
        && token.len() > 1;
    has_case_hump || has_code_punct || (starts_upper && token.chars().all(|c| c.is_alphanumeric()))
}

/// Classify a query by the shape of its tokens.
#[must_use]
pub fn detect_intent(query: &str) -> QueryIntent {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() {
        return QueryIntent::Mixed;
    }
    let identifiers = tokens.iter().filter(|t| is_identifier_token(t)).count();
    if identifiers == tokens.len() && tokens.len() <= 2 {
        QueryIntent::Keyword
    } else if identifiers == 0 && tokens.len() >= 3 {
        QueryIntent::Semantic
    } else {
        QueryIntent::Mixed
    }
}

/// Shift hybrid weights toward the signal suited to `intent`.
///
/// The result is normalized to sum to 1.
#[must_use]
pub fn adjust_weights(base: HybridWeights, intent: QueryIntent) -> HybridWeights {
    let (fts, vector) = match intent {
        QueryIntent::Keyword => (base.fts * 1.5, base.vector * 0.5),
        QueryIntent::Semantic => (base.fts * 0.5, base.vector * 1.5),
        QueryIntent::Mixed => (base.fts, base.vector),
    };
    let normalized = normalize_weights(&[fts, vector]);
    HybridWeights {
        fts: normalized[0],
        vector: normalized[1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hits(paths: &[&str]) -> Vec<SearchResult> {
        paths.iter().map(|p| SearchResult::new(*p, 1.0)).collect()
    }

    #[test]
    fn weights_normalize_to_one() {
        let w = normalize_weights(&[2.0, 6.0]);
        assert!((w[0] - 0.25).abs() < 1e-12);
        assert!((w[1] - 0.75).abs() < 1e-12);
        assert_eq!(normalize_weights(&[0.0, 0.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn documents_in_both_lists_win() {
        let fused = reciprocal_rank_fusion(
            vec![
                RankedList::new("fts", 1.0, hits(&["/a", "/b"])),
                RankedList::new("vector", 1.0, hits(&["/c", "/b"])),
            ],
            RRF_K,
        );
        assert_eq!(fused[0].path, std::path::PathBuf::from("/b"));
        assert_eq!(
            fused[0].metadata.get("rrf_sources"),
            Some(&serde_json::json!(["fts", "vector"]))
        );
        // a and c tie on score; path breaks the tie.
        assert_eq!(fused[1].path, std::path::PathBuf::from("/a"));
        assert_eq!(fused[2].path, std::path::PathBuf::from("/c"));
    }

    #[test]
    fn fused_score_matches_formula() {
        let fused = reciprocal_rank_fusion(
            vec![RankedList::new("fts", 3.0, hits(&["/a"]))],
            RRF_K,
        );
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[rstest]
    #[case("AuthManager", QueryIntent::Keyword)]
    #[case("parse_config", QueryIntent::Keyword)]
    #[case("std::fs::read", QueryIntent::Keyword)]
    #[case("how are sessions refreshed", QueryIntent::Semantic)]
    #[case("where is AuthManager created", QueryIntent::Mixed)]
    #[case("", QueryIntent::Mixed)]
    fn intent_detection(#[case] query: &str, #[case] expected: QueryIntent) {
        assert_eq!(detect_intent(query), expected);
    }

    #[test]
    fn keyword_intent_favors_fts() {
        let base = HybridWeights::default();
        let keyword = adjust_weights(base, QueryIntent::Keyword);
        let semantic = adjust_weights(base, QueryIntent::Semantic);
        assert!(keyword.fts > keyword.vector);
        assert!(semantic.vector > semantic.fts);
        assert!((keyword.fts + keyword.vector - 1.0).abs() < 1e-12);
    }
}

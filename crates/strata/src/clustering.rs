//! Representative selection over an expanded result list.
//!
//! Strategies form a closed set. Each has an availability check; when the
//! preferred one cannot run, selection falls through [`FALLBACK_ORDER`]
//! starting at the preferred strategy's position. [`ClusteringStrategy::NoOp`]
//! is always available and always last.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{SearchResult, sort_results};

/// How stage 3 cuts results down to its target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringStrategy {
    /// Keep the best-scored results
    Score,
    /// Interleave directories so one directory cannot fill the budget
    DirRoundRobin,
    /// Group by embedding similarity, one representative per group
    #[default]
    Embedding,
    /// Keep the incoming order, truncated
    NoOp,
}

/// Fixed fallback priority.
pub const FALLBACK_ORDER: [ClusteringStrategy; 4] = [
    ClusteringStrategy::Embedding,
    ClusteringStrategy::DirRoundRobin,
    ClusteringStrategy::Score,
    ClusteringStrategy::NoOp,
];

impl ClusteringStrategy {
    /// Stable name used in configuration and statistics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::DirRoundRobin => "dir_round_robin",
            Self::Embedding => "embedding",
            Self::NoOp => "noop",
        }
    }

    /// Whether this strategy can run on `input`.
    #[must_use]
    pub fn is_available(&self, input: &ClusterInput) -> bool {
        match self {
            Self::Score | Self::DirRoundRobin | Self::NoOp => true,
            Self::Embedding => input.has_embeddings(),
        }
    }

    /// First available strategy at or after `preferred` in [`FALLBACK_ORDER`].
    #[must_use]
    pub fn resolve(preferred: Self, input: &ClusterInput) -> Self {
        let start = FALLBACK_ORDER
            .iter()
            .position(|s| *s == preferred)
            .unwrap_or(0);
        FALLBACK_ORDER[start..]
            .iter()
            .copied()
            .find(|s| s.is_available(input))
            .unwrap_or(Self::NoOp)
    }

    /// Reduce `results` to at most `target` entries.
    ///
    /// Callers must check availability first; an unavailable embedding
    /// strategy degrades to score order.
    #[must_use]
    pub fn apply(
        &self,
        results: Vec<SearchResult>,
        target: usize,
        input: &ClusterInput,
    ) -> Vec<SearchResult> {
        match self {
            Self::Score => by_score(results, target),
            Self::DirRoundRobin => dir_round_robin(results, target),
            Self::Embedding if input.has_embeddings() => by_embedding(results, target, input),
            Self::Embedding => by_score(results, target),
            Self::NoOp => {
                let mut results = results;
                results.truncate(target);
                results
            }
        }
    }
}

impl fmt::Display for ClusteringStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusteringStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "score" => Ok(Self::Score),
            "dir_round_robin" | "round_robin" => Ok(Self::DirRoundRobin),
            "embedding" | "similarity" => Ok(Self::Embedding),
            "noop" | "no_op" | "none" => Ok(Self::NoOp),
            _ => Err(format!("unknown clustering strategy: {s}")),
        }
    }
}

/// Side data a strategy may use, aligned with the results by index.
#[derive(Debug, Clone, Default)]
pub struct ClusterInput {
    /// One embedding per result, when known
    pub embeddings: Vec<Option<Vec<f32>>>,
    /// Cosine similarity at or above which two results share a cluster
    pub similarity_threshold: f32,
}

impl ClusterInput {
    /// Input for strategies that need no side data.
    #[must_use]
    pub fn empty(similarity_threshold: f32) -> Self {
        Self {
            embeddings: Vec::new(),
            similarity_threshold,
        }
    }

    fn has_embeddings(&self) -> bool {
        !self.embeddings.is_empty() && self.embeddings.iter().any(Option::is_some)
    }
}

/// Output of [`cluster`].
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// Selected representatives
    pub results: Vec<SearchResult>,
    /// Strategy that actually ran
    pub strategy: ClusteringStrategy,
}

/// Resolve `preferred` against `input` and apply it.
#[must_use]
pub fn cluster(
    preferred: ClusteringStrategy,
    results: Vec<SearchResult>,
    target: usize,
    input: &ClusterInput,
) -> ClusterOutcome {
    let strategy = ClusteringStrategy::resolve(preferred, input);
    if strategy != preferred {
        tracing::debug!(
            preferred = %preferred,
            used = %strategy,
            "Clustering strategy unavailable, falling back"
        );
    }
    ClusterOutcome {
        results: strategy.apply(results, target, input),
        strategy,
    }
}

fn by_score(mut results: Vec<SearchResult>, target: usize) -> Vec<SearchResult> {
    sort_results(&mut results);
    results.truncate(target);
    results
}

fn dir_round_robin(results: Vec<SearchResult>, target: usize) -> Vec<SearchResult> {
    let mut ranked = results;
    sort_results(&mut ranked);

    // Directories in order of their best result.
    let mut order: Vec<PathBuf> = Vec::new();
    let mut groups: BTreeMap<PathBuf, VecDeque<SearchResult>> = BTreeMap::new();
    for result in ranked {
        let dir = result.path.parent().map(PathBuf::from).unwrap_or_default();
        if !groups.contains_key(&dir) {
            order.push(dir.clone());
        }
        groups.entry(dir).or_default().push_back(result);
    }

    let mut picked = Vec::with_capacity(target);
    while picked.len() < target {
        let mut progressed = false;
        for dir in &order {
            if picked.len() == target {
                break;
            }
            if let Some(next) = groups.get_mut(dir).and_then(VecDeque::pop_front) {
                picked.push(next);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    picked
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Greedy leader clustering in score order.
///
/// A result joins the first kept leader it is similar enough to; otherwise
/// it becomes a new leader. Results without an embedding are always leaders.
fn by_embedding(
    results: Vec<SearchResult>,
    target: usize,
    input: &ClusterInput,
) -> Vec<SearchResult> {
    let mut indexed: Vec<(SearchResult, Option<&Vec<f32>>)> = results
        .into_iter()
        .enumerate()
        .map(|(i, r)| (r, input.embeddings.get(i).and_then(Option::as_ref)))
        .collect();
    indexed.sort_by(|(a, _), (b, _)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });

    let mut leaders: Vec<&Vec<f32>> = Vec::new();
    let mut picked = Vec::with_capacity(target);
    for (result, embedding) in indexed {
        if picked.len() == target {
            break;
        }
        match embedding {
            Some(e) => {
                if leaders
                    .iter()
                    .any(|l| cosine(l, e) >= input.similarity_threshold)
                {
                    continue;
                }
                leaders.push(e);
                picked.push(result);
            }
            None => picked.push(result),
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hit(path: &str, score: f64) -> SearchResult {
        SearchResult::new(path, score)
    }

    #[rstest]
    #[case("score", ClusteringStrategy::Score)]
    #[case("dir-round-robin", ClusteringStrategy::DirRoundRobin)]
    #[case("EMBEDDING", ClusteringStrategy::Embedding)]
    #[case("noop", ClusteringStrategy::NoOp)]
    #[case("none", ClusteringStrategy::NoOp)]
    fn parses_names(#[case] name: &str, #[case] expected: ClusteringStrategy) {
        assert_eq!(name.parse::<ClusteringStrategy>(), Ok(expected));
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("kmeans".parse::<ClusteringStrategy>().is_err());
    }

    #[rstest]
    #[case(ClusteringStrategy::Embedding, false, ClusteringStrategy::DirRoundRobin)]
    #[case(ClusteringStrategy::Embedding, true, ClusteringStrategy::Embedding)]
    #[case(ClusteringStrategy::Score, false, ClusteringStrategy::Score)]
    #[case(ClusteringStrategy::NoOp, false, ClusteringStrategy::NoOp)]
    fn resolve_falls_back_in_fixed_order(
        #[case] preferred: ClusteringStrategy,
        #[case] with_embeddings: bool,
        #[case] expected: ClusteringStrategy,
    ) {
        let mut input = ClusterInput::empty(0.9);
        if with_embeddings {
            input.embeddings = vec![Some(vec![1.0, 0.0])];
        }
        assert_eq!(ClusteringStrategy::resolve(preferred, &input), expected);
    }

    #[test]
    fn score_keeps_best() {
        let results = vec![hit("/a", 1.0), hit("/b", 3.0), hit("/c", 2.0)];
        let kept = ClusteringStrategy::Score.apply(results, 2, &ClusterInput::default());
        let paths: Vec<_> = kept.iter().map(|r| r.path.to_string_lossy().into_owned()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
    }

    #[test]
    fn round_robin_interleaves_directories() {
        let results = vec![
            hit("/x/1", 9.0),
            hit("/x/2", 8.0),
            hit("/x/3", 7.0),
            hit("/y/1", 1.0),
        ];
        let kept = ClusteringStrategy::DirRoundRobin.apply(results, 3, &ClusterInput::default());
        let paths: Vec<_> = kept.iter().map(|r| r.path.to_string_lossy().into_owned()).collect();
        assert_eq!(paths, vec!["/x/1", "/y/1", "/x/2"]);
    }

    #[test]
    fn embedding_keeps_one_per_group() {
        let results = vec![hit("/a", 3.0), hit("/b", 2.0), hit("/c", 1.0)];
        let input = ClusterInput {
            embeddings: vec![
                Some(vec![1.0, 0.0]),
                Some(vec![0.99, 0.05]),
                Some(vec![0.0, 1.0]),
            ],
            similarity_threshold: 0.9,
        };
        let outcome = cluster(ClusteringStrategy::Embedding, results, 10, &input);
        assert_eq!(outcome.strategy, ClusteringStrategy::Embedding);
        let paths: Vec<_> = outcome
            .results
            .iter()
            .map(|r| r.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["/a", "/c"]);
    }

    #[test]
    fn noop_keeps_incoming_order() {
        let results = vec![hit("/a", 1.0), hit("/b", 3.0)];
        let kept = ClusteringStrategy::NoOp.apply(results, 5, &ClusterInput::default());
        assert_eq!(kept[0].path, PathBuf::from("/a"));
    }

    #[test]
    fn serde_uses_snake_case() {
        let yaml = serde_yaml::to_string(&ClusteringStrategy::DirRoundRobin).expect("serialize");
        assert_eq!(yaml.trim(), "dir_round_robin");
    }
}

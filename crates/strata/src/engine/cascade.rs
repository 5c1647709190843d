//! Cascade retrieval: a cheap coarse pass narrows candidates for the
//! costlier passes after it.
//!
//! | Pipeline | Coarse | Then |
//! |----------|--------|------|
//! | `binary` | Hamming over packed embeddings | dense cosine re-score |
//! | `binary-rerank` | Hamming | reranker |
//! | `dense-rerank` | dense cosine | reranker |
//! | `staged` | Hamming | graph expansion, clustering, reranker |
//!
//! Coarse retrieval tries modes in the configured fallback order and seeds
//! from full-text search when no vector mode yields anything, so later
//! stages always have input when the text index does. Every later stage
//! degrades to a pass-through on collaborator failure.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Chain, ChainSearchEngine, chunk_result, elapsed_ms, gather};
use crate::clustering::{ClusterInput, cluster};
use crate::collaborators::run_with_timeout;
use crate::config::{FallbackMode, Stage2Mode};
use crate::error::{Result, SearchError, SearchErrorKind};
use crate::graph_expander::{GraphExpander, HOP_DECAY};
use crate::store::{DirIndexStore, FtsOptions, dot, l2_normalize};
use crate::types::{
    CascadeStats, ChainSearchResult, MAX_GRAPH_DEPTH, SearchResult, Symbol, dedupe_by_path,
    sort_results,
};

/// Which cascade pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CascadeMode {
    /// Binary coarse search, dense re-score
    Binary,
    /// Binary coarse search, reranker
    BinaryRerank,
    /// Dense coarse search, reranker
    DenseRerank,
    /// Binary coarse search, graph expansion, clustering, reranker
    #[default]
    Staged,
}

impl CascadeMode {
    /// Stable name used on the command line.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::BinaryRerank => "binary-rerank",
            Self::DenseRerank => "dense-rerank",
            Self::Staged => "staged",
        }
    }
}

impl fmt::Display for CascadeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CascadeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "binary" => Ok(Self::Binary),
            "binary-rerank" => Ok(Self::BinaryRerank),
            "dense-rerank" => Ok(Self::DenseRerank),
            "staged" => Ok(Self::Staged),
            _ => Err(format!("unknown cascade mode: {s}")),
        }
    }
}

/// A result plus the dense embedding of the chunk behind it, if any.
#[derive(Debug, Clone)]
struct Candidate {
    result: SearchResult,
    embedding: Option<Vec<f32>>,
}

impl Candidate {
    fn plain(result: SearchResult) -> Self {
        Self {
            result,
            embedding: None,
        }
    }
}

/// State carried through one cascade call.
struct CascadeRun {
    out: ChainSearchResult,
    chain: Chain,
    cascade: CascadeStats,
    started: Instant,
}

impl ChainSearchEngine {
    /// Run the pipeline selected by `mode`.
    pub fn cascade_search(
        &self,
        mode: CascadeMode,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
    ) -> Result<ChainSearchResult> {
        match mode {
            CascadeMode::Binary => self.binary_cascade_search(query, source_path, k, coarse_k),
            CascadeMode::BinaryRerank => {
                self.binary_rerank_cascade_search(query, source_path, k, coarse_k)
            }
            CascadeMode::DenseRerank => {
                self.dense_rerank_cascade_search(query, source_path, k, coarse_k)
            }
            CascadeMode::Staged => self.staged_cascade_search(query, source_path, k, coarse_k),
        }
    }

    /// Binary coarse retrieval, then cosine re-scoring against the query's
    /// dense embedding.
    pub fn binary_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
    ) -> Result<ChainSearchResult> {
        let mut run = self.begin_cascade(query, source_path)?;
        let candidates = self.coarse_stage(&mut run, query, FallbackMode::Binary, coarse_k);

        let stage = Instant::now();
        let results = self.fine_rank(query, candidates, &mut run.out.stats.errors);
        run.cascade.stage_times_ms.push(elapsed_ms(stage));

        Ok(self.finish(run, results, k))
    }

    /// Binary coarse retrieval, then the reranker.
    pub fn binary_rerank_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
    ) -> Result<ChainSearchResult> {
        let mut run = self.begin_cascade(query, source_path)?;
        let candidates = self.coarse_stage(&mut run, query, FallbackMode::Binary, coarse_k);
        let results = candidates.into_iter().map(|c| c.result).collect();
        let results = self.rerank_stage(&mut run, query, results);
        Ok(self.finish(run, results, k))
    }

    /// Dense coarse retrieval, then the reranker.
    pub fn dense_rerank_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
    ) -> Result<ChainSearchResult> {
        let mut run = self.begin_cascade(query, source_path)?;
        let candidates = self.coarse_stage(&mut run, query, FallbackMode::Dense, coarse_k);
        let results = candidates.into_iter().map(|c| c.result).collect();
        let results = self.rerank_stage(&mut run, query, results);
        Ok(self.finish(run, results, k))
    }

    /// The four-stage pipeline: coarse, expand, cluster, rerank.
    ///
    /// Stage 2 follows `cascade.stage2_mode` with `cascade.staged_lsp_depth`
    /// hops; the generic `search.graph_expansion_depth` does not apply here.
    /// Stage 3 cuts the expanded set to `cascade.target_count`
    /// representatives; the final list is then truncated to `k`.
    pub fn staged_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
    ) -> Result<ChainSearchResult> {
        let mut run = self.begin_cascade(query, source_path)?;
        let mut candidates = self.coarse_stage(&mut run, query, FallbackMode::Binary, coarse_k);

        // Stage 2
        let stage = Instant::now();
        let (related, depth) = self.expand_stage(&candidates, &mut run.out.stats.errors);
        run.cascade.stage2_expanded = related.len();
        run.cascade.stage2_depth = depth;
        candidates.extend(related);
        run.cascade.stage_times_ms.push(elapsed_ms(stage));

        // Stage 3
        let stage = Instant::now();
        let cascade = &self.config.cascade;
        let input = ClusterInput {
            embeddings: candidates.iter().map(|c| c.embedding.clone()).collect(),
            similarity_threshold: cascade.cluster_similarity_threshold,
        };
        let results: Vec<SearchResult> = candidates.into_iter().map(|c| c.result).collect();
        let outcome = cluster(cascade.clustering_strategy, results, cascade.target_count, &input);
        run.cascade.stage3_clustered = outcome.results.len();
        run.cascade.stage3_strategy = Some(outcome.strategy.as_str().to_string());
        run.cascade.stage_times_ms.push(elapsed_ms(stage));

        // Stage 4
        let results = self.rerank_stage(&mut run, query, outcome.results);
        Ok(self.finish(run, results, k))
    }

    fn begin_cascade(&self, query: &str, source_path: &Path) -> Result<CascadeRun> {
        let started = Instant::now();
        let scope = self.resolve(source_path)?;
        let mut out = ChainSearchResult {
            query: query.to_string(),
            ..ChainSearchResult::default()
        };
        let chain = if query.trim().is_empty() {
            Vec::new()
        } else {
            self.collect_chain(
                &scope.start.index_path,
                self.config.search.max_depth(),
                &mut out.stats.errors,
            )
        };
        out.stats.dirs_searched = chain.len();
        Ok(CascadeRun {
            out,
            chain,
            cascade: CascadeStats::default(),
            started,
        })
    }

    fn finish(&self, mut run: CascadeRun, results: Vec<SearchResult>, k: usize) -> ChainSearchResult {
        let mut results = dedupe_by_path(results);
        results.truncate(k);
        run.out.stats.files_matched = results.len();
        run.out.results = results;
        run.out.stats.time_ms = elapsed_ms(run.started);
        debug!(
            query = %run.out.query,
            results = run.out.results.len(),
            stage1 = run.cascade.stage1_candidates,
            fallback = run.cascade.stage1_fallback_used,
            expanded = run.cascade.stage2_expanded,
            reranked = run.cascade.stage4_reranked,
            "Cascade search finished"
        );
        run.out.cascade = Some(run.cascade);
        run.out
    }

    /// Stage 1: try coarse modes starting at `preferred` until one finds
    /// candidates.
    fn coarse_stage(
        &self,
        run: &mut CascadeRun,
        query: &str,
        preferred: FallbackMode,
        coarse_k: usize,
    ) -> Vec<Candidate> {
        let stage = Instant::now();
        let mut found = Vec::new();
        if !run.chain.is_empty() && coarse_k > 0 {
            for mode in self.config.cascade.order_from(preferred) {
                let errors = &mut run.out.stats.errors;
                found = match mode {
                    FallbackMode::Dense => self.dense_candidates(&run.chain, query, coarse_k, errors),
                    FallbackMode::Binary => {
                        self.binary_candidates(&run.chain, query, coarse_k, errors)
                    }
                    FallbackMode::Text => self.text_candidates(&run.chain, query, coarse_k, errors),
                };
                if mode == FallbackMode::Text && preferred != FallbackMode::Text {
                    run.cascade.stage1_fallback_used = 1;
                }
                if !found.is_empty() {
                    trace!(mode = ?mode, candidates = found.len(), "Coarse retrieval succeeded");
                    break;
                }
                debug!(mode = ?mode, "Coarse retrieval found nothing, trying next mode");
            }
        }
        sort_candidates(&mut found);
        found.truncate(coarse_k);
        run.cascade.stage1_candidates = found.len();
        run.cascade.stage_times_ms.push(elapsed_ms(stage));
        found
    }

    /// Query every store of `chain` until the stage deadline passes.
    ///
    /// Stores reached after the deadline are skipped and recorded as timeouts.
    fn query_stores<F>(&self, chain: &Chain, errors: &mut Vec<SearchError>, query: F) -> Vec<Candidate>
    where
        F: Fn(&DirIndexStore) -> Result<Vec<Candidate>> + Sync,
    {
        let deadline = Instant::now() + self.stage_timeout();
        let outcomes = self.fan_out(chain, self.config.search.max_workers, |store| {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            query(store).map(Some)
        });
        let (answers, _) = gather(outcomes, errors);

        let mut found = Vec::new();
        let mut skipped = 0usize;
        for answer in answers {
            match answer {
                Some(candidates) => found.extend(candidates),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "Coarse stage deadline passed, stores skipped");
            errors.push(SearchError::new(
                PathBuf::new(),
                SearchErrorKind::Timeout,
                format!("coarse stage deadline passed, {skipped} directories skipped"),
            ));
        }
        found
    }

    fn dense_candidates(
        &self,
        chain: &Chain,
        query: &str,
        coarse_k: usize,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Candidate> {
        let Some(vector) = self.embed_query(query, errors) else {
            return Vec::new();
        };
        self.query_stores(chain, errors, |store| {
            let scored = store.dense_search(&vector, coarse_k)?;
            let ids: Vec<i64> = scored.iter().map(|(id, _)| *id).collect();
            let similarity: HashMap<i64, f32> = scored.into_iter().collect();
            Ok(store
                .get_chunks(&ids)?
                .into_iter()
                .map(|chunk| {
                    let score = f64::from(similarity.get(&chunk.id).copied().unwrap_or(0.0));
                    let embedding = chunk.embedding_dense.clone();
                    Candidate {
                        result: chunk_result(chunk, score).with_metadata("source", "dense"),
                        embedding,
                    }
                })
                .collect())
        })
    }

    fn binary_candidates(
        &self,
        chain: &Chain,
        query: &str,
        coarse_k: usize,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Candidate> {
        let Some(embedder) = self.embedder.as_ref().map(Arc::clone) else {
            return Vec::new();
        };
        let text = query.to_string();
        let packed = match run_with_timeout(self.stage_timeout(), move || embedder.embed_binary(&text)) {
            Ok(packed) if !packed.is_empty() => packed,
            Ok(_) => return Vec::new(),
            Err(e) => {
                debug!(error = %e, "Binary query embedding failed");
                errors.push(SearchError::external(PathBuf::new(), &e));
                return Vec::new();
            }
        };
        let bits = f64::from(u32::try_from(packed.len() * 8).unwrap_or(u32::MAX));

        self.query_stores(chain, errors, |store| {
            let Some(searcher) = store.binary_searcher()? else {
                return Ok(Vec::new());
            };
            if searcher.bytes_per_vector() != packed.len() {
                trace!(
                    db = %store.db_path().display(),
                    stored = searcher.bytes_per_vector(),
                    query = packed.len(),
                    "Binary width mismatch, skipping store"
                );
                return Ok(Vec::new());
            }
            let (ids, distances) = searcher.search(&packed, coarse_k)?;
            let distance: HashMap<i64, u32> = ids.iter().copied().zip(distances).collect();
            Ok(store
                .get_chunks(&ids)?
                .into_iter()
                .map(|chunk| {
                    let d = distance.get(&chunk.id).copied().unwrap_or(u32::MAX);
                    let score = (1.0 - f64::from(d) / bits).max(0.0);
                    let embedding = chunk.embedding_dense.clone();
                    Candidate {
                        result: chunk_result(chunk, score)
                            .with_metadata("source", "binary")
                            .with_metadata("hamming_distance", d),
                        embedding,
                    }
                })
                .collect())
        })
    }

    /// Full-text hits plus symbols whose name starts with the query.
    ///
    /// Symbol hits carry line ranges so graph expansion has something to
    /// start from; they score as the store's best text hit.
    fn text_candidates(
        &self,
        chain: &Chain,
        query: &str,
        coarse_k: usize,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Candidate> {
        let name = query.trim();
        self.query_stores(chain, errors, |store| {
            let mut found: Vec<Candidate> = store
                .search_fts(query, coarse_k, FtsOptions::default())?
                .into_iter()
                .map(Candidate::plain)
                .collect();
            let best = found.iter().map(|c| c.result.score).fold(0.0_f64, f64::max);
            let score = if best > 0.0 { best } else { 1.0 };
            for symbol in store.search_symbols(name, None, coarse_k, true)? {
                let Some(path) = symbol.file_path.clone() else {
                    continue;
                };
                found.push(Candidate::plain(
                    SearchResult::new(path, score)
                        .with_lines(symbol.start_line, symbol.end_line)
                        .with_symbol(symbol.name, symbol.kind)
                        .with_metadata("source", "symbol"),
                ));
            }
            Ok(found)
        })
    }

    /// Cosine re-score of candidates that carry a dense embedding.
    fn fine_rank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        errors: &mut Vec<SearchError>,
    ) -> Vec<SearchResult> {
        let query_vector = if candidates.iter().any(|c| c.embedding.is_some()) {
            self.embed_query(query, errors).map(|v| l2_normalize(&v))
        } else {
            None
        };
        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|candidate| match (&query_vector, &candidate.embedding) {
                (Some(q), Some(e)) if q.len() == e.len() => {
                    let coarse = candidate.result.score;
                    candidate
                        .result
                        .with_score(f64::from(dot(q, e)))
                        .with_metadata("coarse_score", coarse)
                }
                _ => candidate.result,
            })
            .collect();
        sort_results(&mut results);
        results
    }

    /// Stage 2: related code for the best candidates, and the hop bound used.
    fn expand_stage(&self, candidates: &[Candidate], errors: &mut Vec<SearchError>) -> (Vec<Candidate>, u32) {
        let cascade = &self.config.cascade;
        let budget = cascade.graph_max_related.min(cascade.staged_max_nodes);
        if candidates.is_empty() || budget == 0 {
            return (Vec::new(), 0);
        }
        match cascade.stage2_mode {
            Stage2Mode::None => (Vec::new(), 0),
            Stage2Mode::Precomputed => {
                let depth = cascade.staged_lsp_depth.min(MAX_GRAPH_DEPTH);
                let results: Vec<SearchResult> = candidates.iter().map(|c| c.result.clone()).collect();
                let expander = GraphExpander::new(Arc::clone(&self.stores));
                let max_expand = cascade.graph_max_expand;
                let expansion = run_with_timeout(self.stage_timeout(), move || {
                    Ok(expander.expand(&results, depth, max_expand, budget))
                });
                match expansion {
                    Ok(related) => (related.into_iter().map(Candidate::plain).collect(), depth),
                    Err(e) => {
                        debug!(error = %e, "Graph expansion did not finish, skipping");
                        errors.push(SearchError::external(PathBuf::new(), &e));
                        (Vec::new(), depth)
                    }
                }
            }
            Stage2Mode::Realtime => {
                let depth = cascade.staged_lsp_depth;
                (self.realtime_expand(candidates, depth, budget, errors), depth)
            }
        }
    }

    /// Neighbors from the call-hierarchy provider, best candidates first.
    ///
    /// The first failed request ends expansion; what was found so far is kept.
    fn realtime_expand(
        &self,
        candidates: &[Candidate],
        depth: u32,
        budget: usize,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Candidate> {
        let Some(provider) = self.hierarchy.as_ref() else {
            debug!("No call hierarchy provider, skipping realtime expansion");
            return Vec::new();
        };
        if depth == 0 {
            return Vec::new();
        }

        let mut base: Vec<SearchResult> = candidates.iter().map(|c| c.result.clone()).collect();
        sort_results(&mut base);
        let mut seen: HashSet<_> = base.iter().map(SearchResult::identity).collect();
        let mut related = Vec::new();

        for result in base.iter().take(self.config.cascade.graph_max_expand) {
            let Some(symbol) = self.seed_symbol(result) else {
                continue;
            };
            let provider = Arc::clone(provider);
            let remaining = budget - related.len();
            let lookup = run_with_timeout(self.stage_timeout(), move || {
                provider.neighbors(&symbol, depth, remaining)
            });
            let neighbors = match lookup {
                Ok(neighbors) => neighbors,
                Err(e) => {
                    debug!(path = %result.path.display(), error = %e, "Realtime expansion failed");
                    errors.push(SearchError::external(result.path.clone(), &e));
                    break;
                }
            };
            for (neighbor, hop) in neighbors {
                if hop == 0 || hop > depth {
                    continue;
                }
                let Some(path) = neighbor.file_path.clone() else {
                    continue;
                };
                let decay = HOP_DECAY.powi(i32::try_from(hop).unwrap_or(i32::MAX));
                let candidate = SearchResult::new(path, result.score * decay)
                    .with_lines(neighbor.start_line, neighbor.end_line)
                    .with_symbol(neighbor.name, neighbor.kind)
                    .with_metadata("relationship_depth", hop)
                    .with_metadata("source", "lsp");
                if !seen.insert(candidate.identity()) {
                    continue;
                }
                related.push(Candidate::plain(candidate));
                if related.len() >= budget {
                    return related;
                }
            }
        }
        related
    }

    /// The symbol a result points at, if it can be determined.
    fn seed_symbol(&self, result: &SearchResult) -> Option<Symbol> {
        if let (Some(name), Some(kind), Some(start), Some(end)) = (
            result.symbol_name.as_ref(),
            result.symbol_kind,
            result.start_line,
            result.end_line,
        ) {
            return Symbol::new(name.clone(), kind, start, end)
                .map(|s| s.with_file_path(result.path.clone()));
        }
        let line = result.start_line?;
        let store = self.stores.for_file(&result.path).ok()?;
        store.symbol_at(&result.path, line).ok().flatten()
    }

    /// Stage 4: reorder by reranker score; unchanged when reranking is off
    /// or fails.
    fn rerank_stage(&self, run: &mut CascadeRun, query: &str, results: Vec<SearchResult>) -> Vec<SearchResult> {
        let stage = Instant::now();
        let reranked = self.rerank(query, results, run);
        run.cascade.stage_times_ms.push(elapsed_ms(stage));
        reranked
    }

    fn rerank(&self, query: &str, results: Vec<SearchResult>, run: &mut CascadeRun) -> Vec<SearchResult> {
        let cascade = &self.config.cascade;
        let Some(reranker) = self.reranker.as_ref().filter(|_| cascade.enable_rerank) else {
            return results;
        };
        if results.is_empty() {
            return results;
        }

        let pairs: Vec<(String, String)> = results
            .iter()
            .map(|r| (query.to_string(), document_text(r)))
            .collect();
        let reranker = Arc::clone(reranker);
        let timeout = std::time::Duration::from_millis(cascade.rerank_timeout_ms);
        let scores = match run_with_timeout(timeout, move || reranker.score_pairs(&pairs)) {
            Ok(scores) => scores,
            Err(e) => {
                debug!(error = %e, "Reranker unavailable, keeping previous order");
                run.out.stats.errors.push(SearchError::external(PathBuf::new(), &e));
                return results;
            }
        };
        if scores.len() != results.len() {
            debug!(
                expected = results.len(),
                got = scores.len(),
                "Reranker returned wrong number of scores, keeping previous order"
            );
            run.out.stats.errors.push(SearchError::new(
                PathBuf::new(),
                SearchErrorKind::ExternalService,
                format!("reranker returned {} scores for {} documents", scores.len(), results.len()),
            ));
            return results;
        }

        let mut reranked: Vec<SearchResult> = results
            .into_iter()
            .zip(scores)
            .map(|(result, score)| {
                let previous = result.score;
                result
                    .with_score(sigmoid(score))
                    .with_metadata("pre_rerank_score", previous)
            })
            .collect();
        sort_results(&mut reranked);
        run.cascade.stage4_reranked = reranked.len();
        reranked
    }
}

/// Text the reranker sees for a result.
fn document_text(result: &SearchResult) -> String {
    result
        .content
        .clone()
        .or_else(|| result.excerpt.clone())
        .unwrap_or_else(|| result.path.to_string_lossy().into_owned())
}

/// Squash a raw relevance logit into `0..=1`.
fn sigmoid(x: f32) -> f64 {
    1.0 / (1.0 + (-f64::from(x)).exp())
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.result
            .score
            .total_cmp(&a.result.score)
            .then_with(|| a.result.path.cmp(&b.result.path))
            .then_with(|| a.result.start_line.cmp(&b.result.start_line))
    });
}

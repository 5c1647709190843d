//! Integration tests for the cascade pipelines.
//!
//! Two fixtures are used: a call chain `authenticate -> validate -> hashpass`
//! spread over three files of one directory (no embeddings, so stage 1
//! falls back to text), and three embedded files whose contents map onto
//! distinct keyword vectors.

mod common;

use std::sync::Arc;

use common::{Fixture, KeywordEmbedder, file_name};
use rstest::rstest;
use strata::{
    CallHierarchyProvider, CascadeMode, ChainSearchEngine, CollabResult, CollaboratorError,
    EngineConfig, Reranker, SearchErrorKind, Stage2Mode, Symbol, SymbolKind,
};

fn call_chain() -> Fixture {
    let fixture = Fixture::new(&[
        ("src/a.rs", "fn authenticate() { validate() }\n"),
        ("src/b.rs", "fn validate() { hashpass() }\n"),
        ("src/c.rs", "fn hashpass() {}\n"),
    ]);
    fixture.index();
    fixture
}

fn embedded() -> Fixture {
    let fixture = Fixture::new(&[
        ("src/auth.rs", "auth token session\n"),
        ("src/config.rs", "parse config\n"),
        ("src/view.rs", "render cache\n"),
    ]);
    fixture.index_with_embeddings();
    fixture
}

fn engine(fixture: &Fixture, config: EngineConfig) -> ChainSearchEngine {
    ChainSearchEngine::new(Arc::clone(&fixture.registry), config).expect("failed to create engine")
}

fn names(result: &strata::ChainSearchResult) -> Vec<String> {
    result.results.iter().map(|r| file_name(&r.path)).collect()
}

/// Scores documents mentioning "render" highly, everything else low.
struct RenderReranker;

impl Reranker for RenderReranker {
    fn score_pairs(&self, pairs: &[(String, String)]) -> CollabResult<Vec<f32>> {
        Ok(pairs
            .iter()
            .map(|(_, doc)| if doc.contains("render") { 4.0 } else { -4.0 })
            .collect())
    }
}

/// Returns one score regardless of how many documents were sent.
struct ShortReranker;

impl Reranker for ShortReranker {
    fn score_pairs(&self, _pairs: &[(String, String)]) -> CollabResult<Vec<f32>> {
        Ok(vec![1.0])
    }
}

/// Reports a fixed neighbor at hop 1 and another at hop 3.
struct FixedHierarchy {
    near: Symbol,
    far: Symbol,
}

impl CallHierarchyProvider for FixedHierarchy {
    fn neighbors(&self, _symbol: &Symbol, _depth: u32, _max: usize) -> CollabResult<Vec<(Symbol, u32)>> {
        Ok(vec![(self.near.clone(), 1), (self.far.clone(), 3)])
    }
}

struct DownHierarchy;

impl CallHierarchyProvider for DownHierarchy {
    fn neighbors(&self, _symbol: &Symbol, _depth: u32, _max: usize) -> CollabResult<Vec<(Symbol, u32)>> {
        Err(CollaboratorError::Unavailable("language server exited".into()))
    }
}

// ============================================================================
// Stage 1: coarse retrieval and fallback
// ============================================================================

#[test]
fn text_fallback_is_used_without_embeddings() {
    let fixture = call_chain();
    let engine = engine(&fixture, EngineConfig::default());

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");
    let cascade = result.cascade.as_ref().expect("cascade stats present");

    assert_eq!(cascade.stage1_fallback_used, 1);
    assert!(cascade.stage1_candidates >= 1);
    assert_eq!(names(&result)[0], "a.rs");
}

#[test]
fn binary_coarse_stage_finds_closest_chunk() {
    let fixture = embedded();
    let engine = engine(&fixture, EngineConfig::default()).with_embedder(Arc::new(KeywordEmbedder));

    let result = engine
        .binary_cascade_search("auth token session", &fixture.root, 10, 50)
        .expect("cascade failed");
    let cascade = result.cascade.as_ref().expect("cascade stats present");

    assert_eq!(cascade.stage1_fallback_used, 0);
    assert_eq!(cascade.stage1_candidates, 3);
    assert_eq!(names(&result)[0], "auth.rs");
    assert!((result.results[0].score - 1.0).abs() < 1e-5);
}

#[rstest]
#[case(CascadeMode::Binary)]
#[case(CascadeMode::BinaryRerank)]
#[case(CascadeMode::DenseRerank)]
#[case(CascadeMode::Staged)]
fn every_mode_ranks_exact_match_first(#[case] mode: CascadeMode) {
    let fixture = embedded();
    let engine = engine(&fixture, EngineConfig::default()).with_embedder(Arc::new(KeywordEmbedder));

    let result = engine
        .cascade_search(mode, "auth token session", &fixture.root, 2, 50)
        .expect("cascade failed");

    assert_eq!(result.results.len(), 2, "{mode} should truncate to k");
    assert_eq!(names(&result)[0], "auth.rs", "{mode} ranked wrong chunk first");
}

#[test]
fn empty_query_returns_nothing() {
    let fixture = call_chain();
    let engine = engine(&fixture, EngineConfig::default());

    let result = engine
        .staged_cascade_search("   ", &fixture.root, 10, 50)
        .expect("cascade failed");
    assert!(result.results.is_empty());
    assert_eq!(result.stats.dirs_searched, 0);
}

// ============================================================================
// Stage 2: expansion
// ============================================================================

#[test]
fn staged_expansion_uses_its_own_depth() {
    let fixture = call_chain();
    let mut config = EngineConfig::default();
    config.cascade.staged_lsp_depth = 1;
    config.search.graph_expansion_depth = 2;
    let engine = engine(&fixture, config);

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");
    let found = names(&result);
    let cascade = result.cascade.as_ref().expect("cascade stats present");

    assert_eq!(cascade.stage2_depth, 1);
    assert!(found.contains(&"b.rs".to_string()), "one hop reaches validate: {found:?}");
    assert!(!found.contains(&"c.rs".to_string()), "two hops must not be followed: {found:?}");
}

#[test]
fn deeper_staged_expansion_reaches_two_hops() {
    let fixture = call_chain();
    let mut config = EngineConfig::default();
    config.cascade.staged_lsp_depth = 2;
    let engine = engine(&fixture, config);

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");
    let found = names(&result);

    assert!(found.contains(&"c.rs".to_string()), "{found:?}");
    let hashpass = result
        .results
        .iter()
        .find(|r| file_name(&r.path) == "c.rs")
        .expect("c.rs present");
    assert_eq!(hashpass.relationship_depth(), Some(2));
}

#[test]
fn stage2_none_skips_expansion() {
    let fixture = call_chain();
    let mut config = EngineConfig::default();
    config.cascade.stage2_mode = Stage2Mode::None;
    let engine = engine(&fixture, config);

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");

    assert_eq!(names(&result), vec!["a.rs"]);
    assert_eq!(result.cascade.expect("stats").stage2_expanded, 0);
}

#[test]
fn realtime_expansion_respects_hop_bound() {
    let fixture = call_chain();
    let near = Symbol::new("validate", SymbolKind::Function, 1, 1)
        .expect("valid symbol")
        .with_file_path(fixture.path("src/b.rs"));
    let far = Symbol::new("hashpass", SymbolKind::Function, 1, 1)
        .expect("valid symbol")
        .with_file_path(fixture.path("src/c.rs"));

    let mut config = EngineConfig::default();
    config.cascade.stage2_mode = Stage2Mode::Realtime;
    let engine = engine(&fixture, config).with_call_hierarchy(Arc::new(FixedHierarchy { near, far }));

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");
    let found = names(&result);

    assert!(found.contains(&"b.rs".to_string()), "{found:?}");
    assert!(!found.contains(&"c.rs".to_string()), "{found:?}");
    let validate = result
        .results
        .iter()
        .find(|r| file_name(&r.path) == "b.rs")
        .expect("b.rs present");
    assert_eq!(validate.metadata.get("source").and_then(|v| v.as_str()), Some("lsp"));
}

#[test]
fn failed_realtime_expansion_keeps_coarse_results() {
    let fixture = call_chain();
    let mut config = EngineConfig::default();
    config.cascade.stage2_mode = Stage2Mode::Realtime;
    let engine = engine(&fixture, config).with_call_hierarchy(Arc::new(DownHierarchy));

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 10, 50)
        .expect("cascade failed");

    assert_eq!(names(&result), vec!["a.rs"]);
    assert!(
        result
            .stats
            .errors
            .iter()
            .any(|e| e.kind == SearchErrorKind::ExternalService)
    );
}

// ============================================================================
// Stage 3: clustering
// ============================================================================

#[test]
fn clustering_cuts_to_target_count_not_k() {
    let fixture = call_chain();
    let mut config = EngineConfig::default();
    config.cascade.staged_lsp_depth = 2;
    config.cascade.target_count = 2;
    let engine = engine(&fixture, config);

    let result = engine
        .staged_cascade_search("authenticate", &fixture.root, 1, 50)
        .expect("cascade failed");
    let cascade = result.cascade.as_ref().expect("cascade stats present");

    assert!(cascade.stage2_expanded >= 2);
    assert_eq!(cascade.stage3_clustered, 2);
    assert_eq!(result.results.len(), 1);
}

// ============================================================================
// Stage 4: reranking
// ============================================================================

#[test]
fn reranker_reorders_candidates() {
    let fixture = embedded();
    let engine = engine(&fixture, EngineConfig::default())
        .with_embedder(Arc::new(KeywordEmbedder))
        .with_reranker(Arc::new(RenderReranker));

    let result = engine
        .binary_rerank_cascade_search("auth token session", &fixture.root, 10, 50)
        .expect("cascade failed");
    let top = &result.results[0];

    assert_eq!(file_name(&top.path), "view.rs");
    assert!(top.score > 0.9 && top.score <= 1.0);
    assert!(top.metadata.contains_key("pre_rerank_score"));
    assert_eq!(result.cascade.expect("stats").stage4_reranked, 3);
}

#[test]
fn disabled_rerank_keeps_coarse_order() {
    let fixture = embedded();
    let mut config = EngineConfig::default();
    config.cascade.enable_rerank = false;
    let engine = engine(&fixture, config)
        .with_embedder(Arc::new(KeywordEmbedder))
        .with_reranker(Arc::new(RenderReranker));

    let result = engine
        .dense_rerank_cascade_search("auth token session", &fixture.root, 10, 50)
        .expect("cascade failed");

    assert_eq!(names(&result)[0], "auth.rs");
    assert_eq!(result.cascade.expect("stats").stage4_reranked, 0);
}

#[test]
fn mismatched_rerank_scores_are_reported() {
    let fixture = embedded();
    let engine = engine(&fixture, EngineConfig::default())
        .with_embedder(Arc::new(KeywordEmbedder))
        .with_reranker(Arc::new(ShortReranker));

    let result = engine
        .binary_rerank_cascade_search("auth token session", &fixture.root, 10, 50)
        .expect("cascade failed");

    assert_eq!(names(&result)[0], "auth.rs");
    assert!(
        result
            .stats
            .errors
            .iter()
            .any(|e| e.kind == SearchErrorKind::ExternalService)
    );
    assert_eq!(result.cascade.expect("stats").stage4_reranked, 0);
}

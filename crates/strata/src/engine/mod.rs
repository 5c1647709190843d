//! Chain search over a project's directory indexes.
//!
//! A search starts at the deepest registered directory containing the
//! requested path and walks downward through each store's `subdirs` links.
//! Stores are queried on a bounded rayon pool; results are merged, fused and
//! deduplicated by path. A store that fails is recorded in
//! [`SearchStats::errors`](crate::SearchStats) and the walk goes on.
//!
//! Symbol-shaped lookups are answered from the project's
//! [`GlobalSymbolIndex`] when it has hits, after every candidate path has
//! been validated against the project root.
//!
//! The cascade pipelines live in [`cascade`].

mod cascade;

pub use cascade::CascadeMode;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::collaborators::{CallHierarchyProvider, Embedder, Reranker, run_with_timeout};
use crate::config::{EngineConfig, SearchOptions};
use crate::error::{Error, Result, SearchError, SearchErrorKind};
use crate::global_index::{GlobalSymbol, GlobalSymbolIndex, global_index_db};
use crate::graph_expander::{GraphExpander, StoreCache};
use crate::ranking::{RRF_K, RankedList, adjust_weights, detect_intent, reciprocal_rank_fusion};
use crate::registry::RegistryStore;
use crate::store::{DirIndexStore, FtsOptions};
use crate::types::{
    ChainSearchResult, Chunk, DirMapping, ProjectInfo, SearchResult, Symbol, SymbolKind,
    dedupe_by_path, sort_results,
};

/// Stores reached by one traversal, with their database paths, in walk order.
type Chain = Vec<(PathBuf, Arc<DirIndexStore>)>;

/// Where a search starts.
#[derive(Debug, Clone)]
struct Scope {
    start: DirMapping,
    project: Option<ProjectInfo>,
}

/// Text and vector hits of one store.
#[derive(Debug, Default)]
struct DirHits {
    text: Vec<SearchResult>,
    vector: Vec<SearchResult>,
}

/// Search orchestrator over a registry of directory indexes.
pub struct ChainSearchEngine {
    registry: Arc<RegistryStore>,
    stores: Arc<StoreCache>,
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    hierarchy: Option<Arc<dyn CallHierarchyProvider>>,
    pool: rayon::ThreadPool,
}

impl ChainSearchEngine {
    /// Engine over `registry`, with a worker pool of
    /// `config.search.max_workers` threads.
    pub fn new(registry: Arc<RegistryStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.search.max_workers)
            .thread_name(|i| format!("strata-search-{i}"))
            .build()
            .map_err(|e| Error::Internal(format!("cannot build search pool: {e}")))?;
        let stores = Arc::new(StoreCache::new(registry.mapper().clone()));
        Ok(Self {
            registry,
            stores,
            config,
            embedder: None,
            reranker: None,
            hierarchy: None,
            pool,
        })
    }

    /// Use `embedder` for query vectors.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use `reranker` for the rerank stage.
    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Use `provider` for realtime graph expansion.
    #[must_use]
    pub fn with_call_hierarchy(mut self, provider: Arc<dyn CallHierarchyProvider>) -> Self {
        self.hierarchy = Some(provider);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry the engine resolves paths through.
    #[must_use]
    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.registry
    }

    /// Forget every opened directory store.
    ///
    /// Needed after an index rebuild replaced store files on disk.
    pub fn clear_cache(&self) -> Result<()> {
        self.stores.clear()
    }

    /// Text search from `source_path` with the configured options.
    pub fn search(&self, query: &str, source_path: &Path) -> Result<ChainSearchResult> {
        self.search_with_options(query, source_path, &self.config.search)
    }

    /// Text search from `source_path`.
    ///
    /// Fails only when no index covers `source_path`; per-directory problems
    /// land in the result's statistics.
    pub fn search_with_options(
        &self,
        query: &str,
        source_path: &Path,
        options: &SearchOptions,
    ) -> Result<ChainSearchResult> {
        let started = Instant::now();
        let mut out = ChainSearchResult {
            query: query.to_string(),
            ..ChainSearchResult::default()
        };
        let scope = self.resolve(source_path)?;
        if query.trim().is_empty() {
            return Ok(out);
        }
        let chain = self.collect_chain(&scope.start.index_path, options.max_depth(), &mut out.stats.errors);

        let query_vector = if options.hybrid_mode && !options.files_only {
            self.embed_query(query, &mut out.stats.errors)
        } else {
            None
        };
        if options.hybrid_mode && self.embedder.is_none() {
            debug!("Hybrid mode without an embedder, using text ranking only");
        }

        let fts = FtsOptions {
            code_only: options.code_only,
            files_only: options.files_only,
        };
        let limit = options.limit_per_dir;
        let outcomes = self.fan_out(&chain, options.max_workers, |store| {
            let text = store.search_fts(query, limit, fts)?;
            let vector = match &query_vector {
                Some(vector) => dense_hits(store, vector, limit)?,
                None => Vec::new(),
            };
            Ok(DirHits { text, vector })
        });
        let (hits, searched) = gather(outcomes, &mut out.stats.errors);
        out.stats.dirs_searched = searched;

        let mut text = Vec::new();
        let mut vector = Vec::new();
        for dir in hits {
            text.extend(dir.text);
            vector.extend(dir.vector);
        }
        sort_results(&mut text);
        sort_results(&mut vector);

        let mut results = if query_vector.is_some() {
            let weights = adjust_weights(options.hybrid_weights, detect_intent(query));
            trace!(fts = weights.fts, vector = weights.vector, "Fusing hybrid rankings");
            reciprocal_rank_fusion(
                vec![
                    RankedList::new("fts", weights.fts, text),
                    RankedList::new("vector", weights.vector, vector),
                ],
                RRF_K,
            )
        } else {
            text
        };

        if options.enable_graph_expansion && !options.files_only {
            let cascade = &self.config.cascade;
            let related = GraphExpander::new(Arc::clone(&self.stores)).expand(
                &results,
                options.graph_expansion_depth,
                cascade.graph_max_expand,
                cascade.graph_max_related,
            );
            trace!(related = related.len(), "Added graph neighbors");
            results.extend(related);
            sort_results(&mut results);
        }

        let mut results = dedupe_by_path(results);
        results.truncate(options.total_limit);

        if options.include_symbols {
            let name = query.trim();
            out.symbols = self
                .global_symbols(name, None, options.total_limit, options, &scope, &mut out.stats.errors)
                .filter(|hits| !hits.is_empty())
                .unwrap_or_else(|| {
                    self.chain_symbols(
                        &chain,
                        name,
                        None,
                        options.total_limit,
                        options.max_workers,
                        &mut out.stats.errors,
                    )
                });
        }

        out.stats.files_matched = results.len();
        out.results = results;
        out.stats.time_ms = elapsed_ms(started);
        debug!(
            query,
            dirs = out.stats.dirs_searched,
            results = out.results.len(),
            errors = out.stats.errors.len(),
            "Chain search finished"
        );
        Ok(out)
    }

    /// Paths of files matching `query` under `source_path`, best first.
    pub fn search_files_only(&self, query: &str, source_path: &Path) -> Result<Vec<PathBuf>> {
        let options = SearchOptions {
            files_only: true,
            include_symbols: false,
            hybrid_mode: false,
            enable_graph_expansion: false,
            ..self.config.search.clone()
        };
        Ok(self
            .search_with_options(query, source_path, &options)?
            .results
            .into_iter()
            .map(|r| r.path)
            .collect())
    }

    /// Symbols whose name starts with `name`, under `source_path`.
    ///
    /// Tries the global symbol index first; falls back to walking the
    /// directory chain when the fast path is off or finds nothing. Ordered
    /// by name, then path, then line.
    pub fn search_symbols(
        &self,
        name: &str,
        source_path: &Path,
        kind: Option<SymbolKind>,
        limit: usize,
    ) -> Result<Vec<Symbol>> {
        let scope = self.resolve(source_path)?;
        let name = name.trim();
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let options = &self.config.search;
        let mut errors = Vec::new();

        if let Some(hits) = self.global_symbols(name, kind, limit, options, &scope, &mut errors) {
            if !hits.is_empty() {
                trace!(name, hits = hits.len(), "Answered from global symbol index");
                return Ok(hits);
            }
        }

        let chain = self.collect_chain(&scope.start.index_path, options.max_depth(), &mut errors);
        let symbols = self.chain_symbols(&chain, name, kind, limit, options.max_workers, &mut errors);
        if !errors.is_empty() {
            debug!(name, errors = errors.len(), "Symbol search had non-fatal errors");
        }
        Ok(symbols)
    }

    /// Nearest indexed directory for `source_path` and its project.
    fn resolve(&self, source_path: &Path) -> Result<Scope> {
        let start = self
            .registry
            .find_nearest_index(source_path)?
            .ok_or_else(|| Error::NotFound(format!("no index covers {}", source_path.display())))?;
        let project = self.registry.get_project(start.project_id)?;
        Ok(Scope { start, project })
    }

    /// Breadth-first walk from `start` through `subdirs` links.
    ///
    /// `max_depth` bounds how many levels below `start` are visited.
    fn collect_chain(
        &self,
        start: &Path,
        max_depth: Option<u32>,
        errors: &mut Vec<SearchError>,
    ) -> Chain {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(start.to_path_buf(), 0u32)]);

        while let Some((db_path, level)) = queue.pop_front() {
            if !visited.insert(db_path.clone()) {
                continue;
            }
            let store = match self.stores.get(&db_path) {
                Ok(store) => store,
                Err(e) => {
                    warn!(db = %db_path.display(), error = %e, "Skipping unreadable directory index");
                    errors.push(SearchError::storage(db_path, &e));
                    continue;
                }
            };
            if max_depth.is_none_or(|max| level < max) {
                match store.list_subdirs() {
                    Ok(children) => {
                        for child in children {
                            queue.push_back((child.index_path, level + 1));
                        }
                    }
                    Err(e) => {
                        warn!(db = %db_path.display(), error = %e, "Cannot list subdirectories");
                        errors.push(SearchError::storage(db_path.clone(), &e));
                    }
                }
            }
            chain.push((db_path, store));
        }
        trace!(start = %start.display(), stores = chain.len(), "Collected index chain");
        chain
    }

    /// Run `f` against every store of `chain`, keeping chain order.
    fn fan_out<T, F>(&self, chain: &Chain, workers: usize, f: F) -> Vec<(PathBuf, Result<T>)>
    where
        T: Send,
        F: Fn(&DirIndexStore) -> Result<T> + Sync,
    {
        if workers <= 1 || chain.len() <= 1 {
            return chain.iter().map(|(path, store)| (path.clone(), f(store))).collect();
        }
        self.pool.install(|| {
            chain
                .par_iter()
                .map(|(path, store)| (path.clone(), f(store)))
                .collect()
        })
    }

    fn global_symbols(
        &self,
        name: &str,
        kind: Option<SymbolKind>,
        limit: usize,
        options: &SearchOptions,
        scope: &Scope,
        errors: &mut Vec<SearchError>,
    ) -> Option<Vec<Symbol>> {
        if !options.enable_global_index_fast_path {
            return None;
        }
        let project = scope.project.as_ref()?;
        let db = global_index_db(self.registry.mapper(), &project.source_root);
        if !db.exists() {
            return None;
        }
        let hits = match GlobalSymbolIndex::open(&db, project.id)
            .and_then(|index| index.search(name, kind, limit, true))
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(db = %db.display(), error = %e, "Global symbol index unavailable");
                errors.push(SearchError::storage(db, &e));
                return None;
            }
        };
        Some(self.validate_hits(hits, &project.source_root, &scope.start.source_path, errors))
    }

    /// Keep hits whose file path is valid for `project_root` and lies under `scope_dir`.
    ///
    /// Invalid paths are logged and recorded, never raised.
    fn validate_hits(
        &self,
        hits: Vec<GlobalSymbol>,
        project_root: &Path,
        scope_dir: &Path,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Symbol> {
        let mapper = self.registry.mapper();
        let scope_key = mapper.key(scope_dir);
        let mut kept = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(path) = hit.symbol.file_path.clone() else {
                continue;
            };
            let text = path.to_string_lossy();
            match mapper.validate_candidate_path(&text, project_root) {
                Ok(resolved) => {
                    if is_within(&mapper.key(&resolved), &scope_key) {
                        kept.push(Symbol {
                            file_path: Some(resolved),
                            ..hit.symbol
                        });
                    }
                }
                Err(reason) => {
                    debug!(
                        path = %text.escape_debug(),
                        reason = %reason,
                        "Dropping global symbol with invalid path"
                    );
                    errors.push(SearchError::new(
                        path.clone(),
                        SearchErrorKind::InvalidPath,
                        reason.to_string(),
                    ));
                }
            }
        }
        kept
    }

    fn chain_symbols(
        &self,
        chain: &Chain,
        name: &str,
        kind: Option<SymbolKind>,
        limit: usize,
        workers: usize,
        errors: &mut Vec<SearchError>,
    ) -> Vec<Symbol> {
        let outcomes = self.fan_out(chain, workers, |store| store.search_symbols(name, kind, limit, true));
        let (found, _) = gather(outcomes, errors);
        let mut symbols: Vec<Symbol> = found.into_iter().flatten().collect();
        symbols.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        symbols.truncate(limit);
        symbols
    }

    /// Dense embedding of `query`, bounded by the stage timeout.
    fn embed_query(&self, query: &str, errors: &mut Vec<SearchError>) -> Option<Vec<f32>> {
        let embedder = Arc::clone(self.embedder.as_ref()?);
        let text = query.to_string();
        match run_with_timeout(self.stage_timeout(), move || embedder.embed(&text)) {
            Ok(vector) if !vector.is_empty() => Some(vector),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Query embedding failed");
                errors.push(SearchError::external(PathBuf::new(), &e));
                None
            }
        }
    }

    fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.config.cascade.stage_timeout_ms)
    }
}

impl std::fmt::Debug for ChainSearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSearchEngine")
            .field("registry", &self.registry.path())
            .field("embedder", &self.embedder.is_some())
            .field("reranker", &self.reranker.is_some())
            .field("hierarchy", &self.hierarchy.is_some())
            .field("workers", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

/// Split fan-out outcomes into values and recorded errors.
///
/// Returns the values and how many stores answered.
fn gather<T>(outcomes: Vec<(PathBuf, Result<T>)>, errors: &mut Vec<SearchError>) -> (Vec<T>, usize) {
    let mut values = Vec::with_capacity(outcomes.len());
    for (path, outcome) in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(db = %path.display(), error = %e, "Directory search failed");
                errors.push(SearchError::storage(path, &e));
            }
        }
    }
    let answered = values.len();
    (values, answered)
}

/// Chunks of `store` closest to `query`, as results scored by cosine similarity.
fn dense_hits(store: &DirIndexStore, query: &[f32], limit: usize) -> Result<Vec<SearchResult>> {
    let scored = store.dense_search(query, limit)?;
    let ids: Vec<i64> = scored.iter().map(|(id, _)| *id).collect();
    let similarity: HashMap<i64, f32> = scored.into_iter().collect();
    let mut results: Vec<SearchResult> = store
        .get_chunks(&ids)?
        .into_iter()
        .map(|chunk| {
            let score = f64::from(similarity.get(&chunk.id).copied().unwrap_or(0.0));
            chunk_result(chunk, score).with_metadata("source", "vector")
        })
        .collect();
    sort_results(&mut results);
    Ok(results)
}

/// A result pointing at a stored chunk.
fn chunk_result(chunk: Chunk, score: f64) -> SearchResult {
    let lines = chunk.start_line().zip(chunk.end_line());
    let mut result = SearchResult::new(chunk.file_path, score)
        .with_content(chunk.content)
        .with_metadata("chunk_id", chunk.id);
    if let Some((start, end)) = lines {
        result = result.with_lines(start, end);
    }
    result
}

/// Whether the path key `key` is `scope` or lies below it.
fn is_within(key: &str, scope: &str) -> bool {
    key == scope
        || key
            .strip_prefix(scope.trim_end_matches('/'))
            .is_some_and(|rest| rest.starts_with('/'))
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollabResult, ParsedSource, SourceParser};
    use crate::indexer::IndexBuilder;
    use crate::path_mapper::{PathMapper, canonicalize_path};
    use crate::types::Language;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        fs::write(path, content).expect("write file");
    }

    fn indexed(files: &[(&str, &str)]) -> (TempDir, TempDir, ChainSearchEngine) {
        let src = tempfile::tempdir().expect("create source dir");
        let idx = tempfile::tempdir().expect("create index dir");
        for (rel, content) in files {
            write(src.path(), rel, content);
        }
        let registry =
            Arc::new(RegistryStore::open(PathMapper::new(idx.path())).expect("open registry"));
        IndexBuilder::new(Arc::clone(&registry))
            .build(src.path())
            .expect("build index");
        let engine = ChainSearchEngine::new(registry, EngineConfig::default()).expect("engine");
        (src, idx, engine)
    }

    #[test]
    fn search_walks_down_the_chain() {
        let (src, _idx, engine) = indexed(&[
            ("lib.rs", "fn top() { token_refresh(); }"),
            ("auth/session.rs", "fn token_refresh() {}"),
            ("auth/deep/store.rs", "// token cache\nfn cache() {}"),
        ]);

        let result = engine.search("token", src.path()).expect("search");
        assert_eq!(result.stats.dirs_searched, 3);
        assert_eq!(result.results.len(), 3);
        assert!(result.stats.errors.is_empty());

        let from_auth = engine.search("token", &src.path().join("auth")).expect("search");
        assert_eq!(from_auth.stats.dirs_searched, 2);
        assert_eq!(from_auth.results.len(), 2);
    }

    #[test]
    fn depth_limits_traversal() {
        let (src, _idx, engine) = indexed(&[
            ("lib.rs", "fn token() {}"),
            ("a/mod.rs", "fn token_a() {}"),
            ("a/b/mod.rs", "fn token_b() {}"),
        ]);
        let options = SearchOptions {
            depth: 1,
            ..SearchOptions::default()
        };
        let result = engine
            .search_with_options("token", src.path(), &options)
            .expect("search");
        assert_eq!(result.stats.dirs_searched, 2);
    }

    #[test]
    fn unindexed_path_is_an_error() {
        let (_src, _idx, engine) = indexed(&[("lib.rs", "fn a() {}")]);
        let other = tempfile::tempdir().expect("create dir");
        let err = engine.search("a", other.path()).expect_err("no index");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn results_are_unique_per_path_and_truncated() {
        let files: Vec<(String, String)> = (0..6)
            .map(|i| (format!("m{i}.rs"), format!("fn widget_{i}() {{ widget(); }}")))
            .collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let (src, _idx, engine) = indexed(&refs);

        let options = SearchOptions {
            total_limit: 4,
            ..SearchOptions::default()
        };
        let result = engine
            .search_with_options("widget", src.path(), &options)
            .expect("search");
        assert_eq!(result.results.len(), 4);
        let paths: HashSet<_> = result.results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn files_only_returns_paths() {
        let (src, _idx, engine) = indexed(&[("auth.rs", "fn login() {}"), ("other.rs", "fn x() {}")]);
        let paths = engine.search_files_only("login", src.path()).expect("search");
        let root = canonicalize_path(src.path());
        assert_eq!(paths, vec![root.join("auth.rs")]);
    }

    #[test]
    fn symbol_search_uses_global_index_then_chain() {
        let (src, _idx, engine) = indexed(&[
            ("lib.rs", "pub struct AuthManager;"),
            ("auth/mod.rs", "pub fn login() {}"),
        ]);

        let hits = engine
            .search_symbols("Auth", src.path(), None, 10)
            .expect("search symbols");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "AuthManager");

        let scoped = engine
            .search_symbols("Auth", &src.path().join("auth"), None, 10)
            .expect("search symbols");
        assert!(scoped.is_empty(), "symbols outside the scope leaked: {scoped:?}");

        let no_fast_path = {
            let mut config = EngineConfig::default();
            config.search.enable_global_index_fast_path = false;
            ChainSearchEngine::new(Arc::clone(engine.registry()), config).expect("engine")
        };
        let walked = no_fast_path
            .search_symbols("log", src.path(), Some(SymbolKind::Function), 10)
            .expect("search symbols");
        assert_eq!(walked.len(), 1);
        assert_eq!(walked[0].name, "login");
    }

    #[test]
    fn invalid_global_hits_are_dropped_and_recorded() {
        let (src, _idx, engine) = indexed(&[("lib.rs", "fn a() {}")]);
        let root = canonicalize_path(src.path());
        let good = Symbol::new("ok", SymbolKind::Function, 1, 1)
            .expect("valid symbol")
            .with_file_path(root.join("lib.rs"));
        let nul = Symbol::new("bad", SymbolKind::Function, 1, 1)
            .expect("valid symbol")
            .with_file_path(root.join("li\0b.rs"));
        let outside = Symbol::new("far", SymbolKind::Function, 1, 1)
            .expect("valid symbol")
            .with_file_path("/elsewhere/x.rs");
        let hits = [good, nul, outside]
            .into_iter()
            .map(|symbol| GlobalSymbol {
                symbol,
                index_path: PathBuf::from("unused"),
            })
            .collect();

        let mut errors = Vec::new();
        let kept = engine.validate_hits(hits, &root, &root, &mut errors);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "ok");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == SearchErrorKind::InvalidPath));
    }

    #[test]
    fn include_symbols_fills_symbol_hits() {
        let (src, _idx, engine) = indexed(&[("lib.rs", "pub fn parse_config() {}")]);
        let options = SearchOptions {
            include_symbols: true,
            ..SearchOptions::default()
        };
        let result = engine
            .search_with_options("parse_config", src.path(), &options)
            .expect("search");
        assert_eq!(result.symbols.len(), 1);
        assert_eq!(result.symbols[0].name, "parse_config");
    }

    #[test]
    fn is_within_respects_component_boundaries() {
        assert!(is_within("/p/src", "/p"));
        assert!(is_within("/p", "/p"));
        assert!(!is_within("/pp/src", "/p"));
        assert!(is_within("/anything", "/"));
    }

    struct Nothing;

    impl SourceParser for Nothing {
        fn supports(&self, _language: Language) -> bool {
            true
        }

        fn parse(&self, _text: &str, _language: Language) -> CollabResult<ParsedSource> {
            Ok(ParsedSource::default())
        }
    }

    #[test]
    fn broken_store_is_recorded_not_fatal() {
        let src = tempfile::tempdir().expect("create source dir");
        let idx = tempfile::tempdir().expect("create index dir");
        write(src.path(), "lib.rs", "fn needle() {}");
        write(src.path(), "sub/mod.rs", "fn needle_two() {}");
        let registry =
            Arc::new(RegistryStore::open(PathMapper::new(idx.path())).expect("open registry"));
        IndexBuilder::new(Arc::clone(&registry))
            .with_parser(Arc::new(Nothing))
            .build(src.path())
            .expect("build index");

        let root = canonicalize_path(src.path());
        let child_db = registry.mapper().source_to_index_db(&root.join("sub"));
        fs::write(&child_db, b"not a database").expect("corrupt child index");

        let engine = ChainSearchEngine::new(registry, EngineConfig::default()).expect("engine");
        let result = engine.search("needle", src.path()).expect("search survives");
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.stats.errors.len(), 1);
        assert_eq!(result.stats.errors[0].kind, SearchErrorKind::Storage);
    }
}

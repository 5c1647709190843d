//! Result expansion through precomputed graph neighbors.
//!
//! For the best base results, look up the symbol each one points at, read
//! its neighbors from the owning directory store, and synthesize a result
//! per neighbor with a geometrically decayed score.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::path_mapper::PathMapper;
use crate::store::DirIndexStore;
use crate::types::{MAX_GRAPH_DEPTH, SearchResult, SymbolId, sort_results};

/// Score multiplier per hop.
pub const HOP_DECAY: f64 = 0.5;

/// Opened directory stores, keyed by database path.
///
/// Opening a store runs its schema check, so each one is opened once and
/// shared.
pub struct StoreCache {
    mapper: PathMapper,
    stores: Mutex<HashMap<PathBuf, Arc<DirIndexStore>>>,
}

impl StoreCache {
    /// Empty cache resolving file locations through `mapper`.
    #[must_use]
    pub fn new(mapper: PathMapper) -> Self {
        Self {
            mapper,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Mapper used to locate stores.
    #[must_use]
    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// The store at `db_path`, opening it on first use.
    pub fn get(&self, db_path: &Path) -> Result<Arc<DirIndexStore>> {
        let mut stores = self.stores.lock().map_err(|e| {
            Error::Internal(format!("store cache mutex poisoned: {e}"))
        })?;
        if let Some(store) = stores.get(db_path) {
            return Ok(Arc::clone(store));
        }
        if !db_path.exists() {
            return Err(Error::NotFound(format!("no index at {}", db_path.display())));
        }
        let store = Arc::new(DirIndexStore::open(db_path)?);
        stores.insert(db_path.to_path_buf(), Arc::clone(&store));
        Ok(store)
    }

    /// The store holding `file_path`, i.e. the index of its parent directory.
    pub fn for_file(&self, file_path: &Path) -> Result<Arc<DirIndexStore>> {
        let dir = file_path.parent().ok_or_else(|| {
            Error::InvalidInput(format!("{} has no parent directory", file_path.display()))
        })?;
        self.get(&self.mapper.source_to_index_db(dir))
    }

    /// Forget every opened store.
    pub fn clear(&self) -> Result<()> {
        self.stores
            .lock()
            .map_err(|e| Error::Internal(format!("store cache mutex poisoned: {e}")))?
            .clear();
        Ok(())
    }
}

impl std::fmt::Debug for StoreCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCache")
            .field("index_root", &self.mapper.index_root())
            .finish_non_exhaustive()
    }
}

/// Expands results with related symbols.
#[derive(Debug, Clone)]
pub struct GraphExpander {
    stores: Arc<StoreCache>,
}

impl GraphExpander {
    /// Expander reading neighbors through `stores`.
    #[must_use]
    pub fn new(stores: Arc<StoreCache>) -> Self {
        Self { stores }
    }

    /// Related results for the best `max_expand` entries of `results`.
    ///
    /// Only new results are returned; anything already in `results` (same
    /// path, symbol and line range) is skipped, as is anything emitted
    /// earlier. Neighbors come in hop order, then neighbor id. Each carries
    /// `score = base.score * 0.5^hop` and `metadata.relationship_depth`.
    /// Stops after `max_related` results. A failure for one base result is
    /// logged and expansion continues with the next.
    #[must_use]
    pub fn expand(
        &self,
        results: &[SearchResult],
        depth: u32,
        max_expand: usize,
        max_related: usize,
    ) -> Vec<SearchResult> {
        let depth = depth.min(MAX_GRAPH_DEPTH);
        if depth == 0 || max_expand == 0 || max_related == 0 {
            return Vec::new();
        }

        let mut seen: HashSet<_> = results.iter().map(SearchResult::identity).collect();
        let mut base: Vec<SearchResult> = results.to_vec();
        sort_results(&mut base);

        let mut related = Vec::new();
        for result in base.iter().take(max_expand) {
            let neighbors = match self.neighbors_of(result, depth) {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(
                        path = %result.path.display(),
                        error = %e,
                        "Graph expansion failed for result, skipping"
                    );
                    continue;
                }
            };
            for neighbor in neighbors {
                let hop = neighbor.neighbor.relationship_depth;
                let symbol = neighbor.symbol;
                let Some(path) = symbol.file_path.clone() else {
                    continue;
                };
                let decay = HOP_DECAY.powi(i32::try_from(hop).unwrap_or(i32::MAX));
                let candidate = SearchResult::new(path, result.score * decay)
                    .with_lines(symbol.start_line, symbol.end_line)
                    .with_symbol(symbol.name, symbol.kind)
                    .with_metadata("relationship_depth", hop)
                    .with_metadata("source", "graph");
                if !seen.insert(candidate.identity()) {
                    continue;
                }
                related.push(candidate);
                if related.len() >= max_related {
                    return related;
                }
            }
        }
        related
    }

    fn neighbors_of(
        &self,
        result: &SearchResult,
        depth: u32,
    ) -> Result<Vec<crate::store::NeighborSymbol>> {
        let store = self.stores.for_file(&result.path)?;
        let ids = self.symbol_ids(&store, result)?;
        let mut all = Vec::new();
        for id in ids {
            all.extend(store.graph_neighbors(id, depth)?);
        }
        Ok(all)
    }

    fn symbol_ids(&self, store: &DirIndexStore, result: &SearchResult) -> Result<Vec<SymbolId>> {
        if let Some(name) = &result.symbol_name {
            return store.find_symbol_ids(&result.path, name, result.start_line);
        }
        let Some(line) = result.start_line else {
            return Ok(Vec::new());
        };
        match store.symbol_at(&result.path, line)? {
            Some(symbol) => {
                store.find_symbol_ids(&result.path, &symbol.name, Some(symbol.start_line))
            }
            None => Ok(Vec::new()),
        }
    }
}

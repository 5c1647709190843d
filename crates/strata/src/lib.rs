//! # Strata: Hierarchical Code Search Index
//!
//! Strata indexes a source tree into one `SQLite` database per directory and
//! answers code-search queries by walking that chain of indexes and fusing
//! several retrieval signals: full-text ranking, dense and binary vector
//! search, precomputed relationship graphs and live call hierarchies.
//!
//! ## Design Philosophy
//!
//! - **Layers, not a monolith** - Each directory owns its index; a project is the chain
//! - **Incremental by content** - Merkle snapshots decide what to reparse
//! - **Degrade, don't fail** - Broken stores and absent services shrink results, they don't abort searches
//! - **Pluggable collaborators** - Parsing, embedding, reranking and call hierarchies are traits
//! - **Library first, CLI second**
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use strata::{ChainSearchEngine, EngineConfig, IndexBuilder, PathMapper, RegistryStore};
//!
//! let registry = Arc::new(RegistryStore::open(PathMapper::new("/var/cache/strata"))?);
//!
//! // Index the project
//! let stats = IndexBuilder::new(Arc::clone(&registry)).build(Path::new("/path/to/project"))?;
//! println!("Indexed {} files, found {} symbols", stats.files_indexed, stats.symbols_found);
//!
//! // Search from any directory inside it
//! let engine = ChainSearchEngine::new(registry, EngineConfig::default())?;
//! let result = engine.search("session refresh", Path::new("/path/to/project/src"))?;
//! for hit in &result.results {
//!     println!("{} ({:.3})", hit.path.display(), hit.score);
//! }
//!
//! // Symbol lookup, answered from the project's global symbol table
//! let symbols = engine.search_symbols("Auth", Path::new("/path/to/project"), None, 20)?;
//! # Ok::<(), strata::Error>(())
//! ```
//!
//! ## Module Map
//!
//! - [`registry`] / [`path_mapper`] - project registry and source-to-index path mapping
//! - [`merkle`] - content-hash trees for change detection
//! - [`store`] - the per-directory index database
//! - [`global_index`] - project-wide symbol table
//! - [`binary_search`] - Hamming search over packed embeddings
//! - [`graph_expander`], [`clustering`], [`ranking`] - result expansion, pruning and fusion
//! - [`engine`] - chain search and the cascade pipelines
//! - [`indexer`] - building and refreshing a project's indexes
//! - [`collaborators`], [`parser`], [`lsp`] - external service contracts and default implementations

pub mod binary_search;
pub mod clustering;
pub mod collaborators;
pub mod config;
pub mod engine;
mod error;
pub mod global_index;
pub mod graph_expander;
pub mod indexer;
pub mod lsp;
pub mod merkle;
mod migrations;
pub mod parser;
pub mod path_mapper;
pub mod ranking;
pub mod registry;
pub mod store;
mod types;

pub use binary_search::BinarySearcher;
pub use clustering::ClusteringStrategy;
pub use collaborators::{
    CallHierarchyProvider, CollabResult, Embedder, ParsedSource, Reranker, SourceParser,
    run_with_timeout,
};
pub use config::{
    CascadeConfig, EngineConfig, FallbackMode, HybridWeights, SearchOptions, Stage2Mode,
};
pub use engine::{CascadeMode, ChainSearchEngine};
pub use error::{
    CollaboratorError, Error, IndexError, Result, SearchError, SearchErrorKind,
};
pub use global_index::{GlobalSymbol, GlobalSymbolIndex};
pub use graph_expander::{GraphExpander, StoreCache};
pub use indexer::IndexBuilder;
pub use merkle::{MerkleTree, find_changed_files};
pub use path_mapper::{CaseSensitivity, PathMapper};
pub use registry::RegistryStore;
pub use store::DirIndexStore;
pub use types::{
    CascadeStats, ChainSearchResult, Chunk, ChunkData, DirMapping, FileId, FileRecord,
    GraphNeighbor, IndexStats, IndexedFile, Language, MAX_GRAPH_DEPTH, ProjectId, ProjectInfo,
    Relationship, RelationshipType, SearchResult, SearchStats, Symbol, SymbolId, SymbolKind,
    dedupe_by_path, sort_results,
};

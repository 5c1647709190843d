//! Domain types for Strata.
//!
//! These types represent the core domain model:
//! - **Entities**: `FileRecord`, `Symbol`, `Relationship`, `Chunk`, `ProjectInfo`,
//!   `DirMapping` (stored in a database)
//! - **Transient**: `IndexedFile`, `ChunkData` (produced while indexing)
//! - **Results**: `SearchResult`, `ChainSearchResult`, `SearchStats`,
//!   `CascadeStats`, `IndexStats` (query results)
//!
//! ## Design Decisions
//!
//! | Decision | Choice | Rationale |
//! |----------|--------|-----------|
//! | Language | Enum not String | Unknown extensions are never indexed |
//! | `SearchResult` | Value object | Merging builds new results, never patches old ones |
//! | Metadata | `BTreeMap` | Stable key order in serialized output |

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, SearchError};

// ============================================================================
// Strongly-typed ID wrappers
// ============================================================================

/// A strongly-typed symbol ID, scoped to one directory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub i64);

impl SymbolId {
    /// Extract the raw i64 value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for SymbolId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A strongly-typed file ID, scoped to one directory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub i64);

impl FileId {
    /// Extract the raw i64 value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A strongly-typed project ID from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub i64);

impl ProjectId {
    /// Extract the raw i64 value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for ProjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Languages recognized when walking a source tree.
///
/// Every recognized file is stored for text search; only languages with a
/// registered parser also contribute symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Rust source files (`.rs`)
    Rust,
    /// Python source files (`.py`)
    Python,
    /// JavaScript source files
    JavaScript,
    /// TypeScript source files
    TypeScript,
    /// Go source files (`.go`)
    Go,
    /// Java source files (`.java`)
    Java,
    /// C# source files (`.cs`)
    CSharp,
    /// C and C++ sources and headers
    Cpp,
    /// Markdown documentation
    Markdown,
    /// Configuration and data files (TOML, YAML, JSON)
    Config,
}

impl Language {
    /// Detect language from file extension.
    ///
    /// # Returns
    ///
    /// `None` if the extension is not recognized.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "rs" => Some(Self::Rust),
            "py" | "pyi" => Some(Self::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "ts" | "tsx" => Some(Self::TypeScript),
            "go" => Some(Self::Go),
            "java" => Some(Self::Java),
            "cs" => Some(Self::CSharp),
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" => Some(Self::Cpp),
            "md" | "markdown" => Some(Self::Markdown),
            "toml" | "yaml" | "yml" | "json" => Some(Self::Config),
            _ => None,
        }
    }

    /// Whether files of this language count as code for `code_only` searches.
    #[must_use]
    pub fn is_code(&self) -> bool {
        !matches!(self, Self::Markdown | Self::Config)
    }

    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::CSharp => "csharp",
            Self::Cpp => "cpp",
            Self::Markdown => "markdown",
            Self::Config => "config",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rust" => Ok(Self::Rust),
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::JavaScript),
            "typescript" => Ok(Self::TypeScript),
            "go" => Ok(Self::Go),
            "java" => Ok(Self::Java),
            "csharp" => Ok(Self::CSharp),
            "cpp" => Ok(Self::Cpp),
            "markdown" => Ok(Self::Markdown),
            "config" => Ok(Self::Config),
            unknown => Err(format!("unknown language '{unknown}'")),
        }
    }
}

/// Symbol kinds, normalized across languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Free function (not associated with a type)
    Function,
    /// Method (function associated with a type)
    Method,
    /// Class
    Class,
    /// Struct
    Struct,
    /// Enum type
    Enum,
    /// Trait
    Trait,
    /// Interface
    Interface,
    /// Constant value
    Const,
    /// Static or module-level variable
    Variable,
    /// Module or namespace
    Module,
    /// Type alias
    TypeAlias,
    /// Macro
    Macro,
}

impl SymbolKind {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Interface => "interface",
            Self::Const => "const",
            Self::Variable => "variable",
            Self::Module => "module",
            Self::TypeAlias => "type_alias",
            Self::Macro => "macro",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class" => Ok(Self::Class),
            "struct" => Ok(Self::Struct),
            "enum" => Ok(Self::Enum),
            "trait" => Ok(Self::Trait),
            "interface" => Ok(Self::Interface),
            "const" => Ok(Self::Const),
            "variable" => Ok(Self::Variable),
            "module" => Ok(Self::Module),
            "type_alias" => Ok(Self::TypeAlias),
            "macro" => Ok(Self::Macro),
            unknown => Err(format!("unknown symbol kind '{unknown}'")),
        }
    }
}

/// How one symbol relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Function or method call
    Call,
    /// Import statement
    Import,
    /// Trait implementation or class inheritance
    Inherit,
    /// Any other reference (type annotation, field access)
    Reference,
}

impl RelationshipType {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Import => "import",
            Self::Inherit => "inherit",
            Self::Reference => "reference",
        }
    }
}

impl FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Self::Call),
            "import" => Ok(Self::Import),
            "inherit" => Ok(Self::Inherit),
            "reference" => Ok(Self::Reference),
            unknown => Err(format!("unknown relationship type '{unknown}'")),
        }
    }
}

// ============================================================================
// Core Entities
// ============================================================================

/// A code symbol definition.
///
/// Lines are 1-indexed and inclusive. Construct through [`Symbol::new`] to
/// keep `start_line >= 1` and `end_line >= start_line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Simple name (e.g., "`AuthManager`")
    pub name: String,
    /// What kind of symbol this is
    pub kind: SymbolKind,
    /// First line of the definition
    pub start_line: u32,
    /// Last line of the definition
    pub end_line: u32,
    /// Containing file, filled in when read back from a store
    pub file_path: Option<PathBuf>,
}

impl Symbol {
    /// Create a new symbol with a validated line range.
    ///
    /// Returns `None` if `start_line` is 0 or `end_line` precedes `start_line`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SymbolKind, start_line: u32, end_line: u32) -> Option<Self> {
        if start_line == 0 || end_line < start_line {
            return None;
        }
        Some(Self {
            name: name.into(),
            kind,
            start_line,
            end_line,
            file_path: None,
        })
    }

    /// Attach the containing file path.
    #[must_use]
    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// A relationship emitted by the parser.
///
/// The source is named rather than identified: ids only exist once the
/// containing file's symbols have been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Name of the enclosing symbol at the reference site
    pub source_symbol: String,
    /// Name (possibly qualified) of the referenced symbol
    pub target_qualified_name: String,
    /// How the source uses the target
    pub relationship_type: RelationshipType,
    /// Line of the reference (1-indexed)
    pub source_line: u32,
    /// File defining the target, when the parser knows it
    pub target_file: Option<String>,
}

/// A precomputed, hop-bounded neighbor of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNeighbor {
    /// Symbol the expansion starts from
    pub source_symbol_id: SymbolId,
    /// Symbol reachable from the source
    pub neighbor_symbol_id: SymbolId,
    /// Hop distance, always in `1..=MAX_GRAPH_DEPTH`
    pub relationship_depth: u32,
}

/// Hop bound for precomputed graph neighbors.
pub const MAX_GRAPH_DEPTH: u32 = 2;

/// A file row in a directory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Database primary key
    pub id: FileId,
    /// File name within its directory
    pub name: String,
    /// Resolved absolute path
    pub path: PathBuf,
    /// Detected language
    pub language: Language,
    /// File modification time in nanoseconds since epoch
    pub mtime_ns: i64,
    /// xxh3 of file content (for change detection)
    pub content_hash: Option<u64>,
    /// Number of lines in the stored content
    pub line_count: u32,
    /// When this file was last indexed (unix timestamp)
    pub indexed_at: i64,
}

/// Unit of reindexing: everything extracted from one source file.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Resolved absolute path
    pub path: PathBuf,
    /// Detected language
    pub language: Language,
    /// File content as indexed
    pub content: String,
    /// Symbols extracted by the parser
    pub symbols: Vec<Symbol>,
    /// Relationships extracted by the parser
    pub relationships: Vec<Relationship>,
    /// Content slices prepared for vector search
    pub chunks: Vec<ChunkData>,
}

/// A chunk ready to be written to a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    /// Owning file
    pub file_path: PathBuf,
    /// Chunk text
    pub content: String,
    /// Raw embedding as produced by the embedder
    pub embedding: Option<Vec<f32>>,
    /// Packed sign bits of the embedding
    pub embedding_binary: Option<Vec<u8>>,
    /// Free-form metadata (line range, symbol name)
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A chunk read back from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Store-scoped chunk id
    pub id: i64,
    /// Owning file
    pub file_path: PathBuf,
    /// Chunk text
    pub content: String,
    /// Packed sign bits
    pub embedding_binary: Option<Vec<u8>>,
    /// L2-normalized dense embedding
    pub embedding_dense: Option<Vec<f32>>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Chunk {
    /// Start line recorded in metadata, if any.
    #[must_use]
    pub fn start_line(&self) -> Option<u32> {
        metadata_line(&self.metadata, "start_line")
    }

    /// End line recorded in metadata, if any.
    #[must_use]
    pub fn end_line(&self) -> Option<u32> {
        metadata_line(&self.metadata, "end_line")
    }
}

fn metadata_line(metadata: &BTreeMap<String, serde_json::Value>, key: &str) -> Option<u32> {
    metadata
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// A registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Registry primary key
    pub id: ProjectId,
    /// Source root as registered
    pub source_root: PathBuf,
    /// Index root holding the per-directory databases
    pub index_root: PathBuf,
    /// Registration time (unix timestamp)
    pub created_at: i64,
    /// Last completed indexing run (unix timestamp)
    pub last_indexed: Option<i64>,
    /// Files indexed in the last run
    pub total_files: u64,
    /// Directories indexed in the last run
    pub total_dirs: u64,
}

/// A directory mapping from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirMapping {
    /// Registry primary key
    pub id: i64,
    /// Owning project
    pub project_id: ProjectId,
    /// Source directory as registered
    pub source_path: PathBuf,
    /// Path of the directory's `_index.db`
    pub index_path: PathBuf,
    /// Distance from the project root (root is 0)
    pub depth: u32,
    /// Files stored in this directory's index
    pub files_count: u64,
    /// Last update (unix timestamp)
    pub last_updated: i64,
}

// ============================================================================
// Search results
// ============================================================================

/// A single search hit.
///
/// Results are values: the `with_*` builders consume and return a new
/// instance so merging never mutates a result another list still holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// File containing the hit
    pub path: PathBuf,
    /// Relevance score, never negative
    pub score: f64,
    /// Highlighted snippet
    pub excerpt: Option<String>,
    /// Full content slice, when requested
    pub content: Option<String>,
    /// First line of the hit
    pub start_line: Option<u32>,
    /// Last line of the hit
    pub end_line: Option<u32>,
    /// Symbol the hit points at
    pub symbol_name: Option<String>,
    /// Kind of that symbol
    pub symbol_kind: Option<SymbolKind>,
    /// Extra facts (`relationship_depth`, `source`, `chunk_id`)
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SearchResult {
    /// Create a result for a file with the given score.
    ///
    /// Negative and NaN scores are clamped to 0.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, score: f64) -> Self {
        Self {
            path: path.into(),
            score: clamp_score(score),
            excerpt: None,
            content: None,
            start_line: None,
            end_line: None,
            symbol_name: None,
            symbol_kind: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Replace the score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = clamp_score(score);
        self
    }

    /// Attach an excerpt.
    #[must_use]
    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }

    /// Attach content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Attach a line range.
    #[must_use]
    pub fn with_lines(mut self, start_line: u32, end_line: u32) -> Self {
        self.start_line = Some(start_line);
        self.end_line = Some(end_line);
        self
    }

    /// Attach the symbol this hit points at.
    #[must_use]
    pub fn with_symbol(mut self, name: impl Into<String>, kind: SymbolKind) -> Self {
        self.symbol_name = Some(name.into());
        self.symbol_kind = Some(kind);
        self
    }

    /// Set a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Hop distance assigned by graph expansion, if this hit came from one.
    #[must_use]
    pub fn relationship_depth(&self) -> Option<u32> {
        metadata_line(&self.metadata, "relationship_depth")
    }

    /// Key used to recognize the same hit across result lists.
    #[must_use]
    pub fn identity(&self) -> (PathBuf, Option<String>, Option<u32>, Option<u32>) {
        (
            self.path.clone(),
            self.symbol_name.clone(),
            self.start_line,
            self.end_line,
        )
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.max(0.0) }
}

/// Sort results by descending score, ties by ascending path then line.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

/// Keep the first occurrence of each path, preserving order.
#[must_use]
pub fn dedupe_by_path(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen = std::collections::HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(r.path.clone()))
        .collect()
}

/// Traversal statistics for one search call.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    /// Directory indexes queried
    pub dirs_searched: usize,
    /// Distinct files among the returned results
    pub files_matched: usize,
    /// Wall time spent
    pub time_ms: f64,
    /// Non-fatal problems encountered along the way
    pub errors: Vec<SearchError>,
}

/// Per-stage counters of a cascade run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeStats {
    /// Candidates produced by stage 1
    pub stage1_candidates: usize,
    /// 1 when stage 1 was seeded from text search
    pub stage1_fallback_used: u32,
    /// Results added by stage 2
    pub stage2_expanded: usize,
    /// Hop bound stage 2 ran with (0 when skipped)
    pub stage2_depth: u32,
    /// Results kept by stage 3
    pub stage3_clustered: usize,
    /// Clustering strategy that actually ran
    pub stage3_strategy: Option<String>,
    /// Results scored by the reranker (0 when skipped or failed)
    pub stage4_reranked: usize,
    /// Milliseconds per stage, in stage order
    pub stage_times_ms: Vec<f64>,
}

/// Result of a chain or cascade search.
#[derive(Debug, Clone, Default)]
pub struct ChainSearchResult {
    /// The query as given
    pub query: String,
    /// Ranked hits, one per path
    pub results: Vec<SearchResult>,
    /// Symbol hits, when symbols were requested
    pub symbols: Vec<Symbol>,
    /// Traversal statistics
    pub stats: SearchStats,
    /// Stage counters, present for cascade searches
    pub cascade: Option<CascadeStats>,
}

/// Summary of an indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Files parsed and written
    pub files_indexed: usize,
    /// Files whose content was unchanged
    pub files_unchanged: usize,
    /// Files removed from their store
    pub files_removed: usize,
    /// Directory stores written
    pub dirs_indexed: usize,
    /// Symbols written
    pub symbols_found: usize,
    /// Wall time spent
    pub duration: Duration,
    /// Files that could not be indexed
    pub errors: Vec<IndexError>,
}

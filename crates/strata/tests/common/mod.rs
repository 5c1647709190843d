//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::{
    CollabResult, Embedder, IndexBuilder, IndexStats, Language, ParsedSource, PathMapper,
    RegistryStore, Relationship, RelationshipType, SourceParser, Symbol, SymbolKind,
};
use tempfile::TempDir;

/// A project tree and an index root side by side in one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub registry: Arc<RegistryStore>,
}

impl Fixture {
    /// Create `project/` containing `files`, plus an empty registry.
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let root = dir.path().join("project");
        fs::create_dir_all(&root).expect("failed to create project root");
        for (path, content) in files {
            write_file(&root, path, content);
        }
        let root = fs::canonicalize(&root).expect("failed to canonicalize root");
        let registry = Arc::new(
            RegistryStore::open(PathMapper::new(dir.path().join("indexes")))
                .expect("failed to open registry"),
        );
        Self {
            dir,
            root,
            registry,
        }
    }

    /// Index the project with [`LineParser`].
    pub fn index(&self) -> IndexStats {
        self.builder().build(&self.root).expect("index failed")
    }

    /// Index the project with [`LineParser`] and [`KeywordEmbedder`].
    pub fn index_with_embeddings(&self) -> IndexStats {
        self.builder()
            .with_embedder(Arc::new(KeywordEmbedder))
            .build(&self.root)
            .expect("index failed")
    }

    pub fn builder(&self) -> IndexBuilder {
        IndexBuilder::new(Arc::clone(&self.registry)).with_parser(Arc::new(LineParser))
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let full = root.join(rel);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).expect("failed to create parent dirs");
    }
    fs::write(&full, content).expect("failed to write file");
}

/// Minimal line-oriented parser.
///
/// `fn name() { callee() }` defines a function calling `callee`;
/// `class Name` defines a class. Everything else is ignored.
pub struct LineParser;

impl SourceParser for LineParser {
    fn supports(&self, _language: Language) -> bool {
        true
    }

    fn parse(&self, text: &str, _language: Language) -> CollabResult<ParsedSource> {
        let mut parsed = ParsedSource::default();
        for (index, line) in text.lines().enumerate() {
            let line_no = u32::try_from(index + 1).expect("line fits u32");
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("class ") {
                let name = rest.trim_end_matches(':').trim();
                parsed
                    .symbols
                    .extend(Symbol::new(name, SymbolKind::Class, line_no, line_no));
            } else if let Some(rest) = line.strip_prefix("fn ") {
                let Some((name, body)) = rest.split_once('(') else {
                    continue;
                };
                parsed
                    .symbols
                    .extend(Symbol::new(name.trim(), SymbolKind::Function, line_no, line_no));
                let callee = body
                    .split_once('{')
                    .and_then(|(_, inner)| inner.split_once('('))
                    .map(|(callee, _)| callee.trim())
                    .filter(|callee| !callee.is_empty());
                if let Some(callee) = callee {
                    parsed.relationships.push(Relationship {
                        source_symbol: name.trim().to_string(),
                        target_qualified_name: callee.to_string(),
                        relationship_type: RelationshipType::Call,
                        source_line: line_no,
                        target_file: None,
                    });
                }
            }
        }
        Ok(parsed)
    }
}

/// Vocabulary spanned by [`KeywordEmbedder`]; one dimension per word.
pub const VOCABULARY: [&str; 8] = [
    "auth", "token", "session", "parse", "config", "render", "cache", "query",
];

/// Embeds text as +1/-1 per vocabulary word present/absent.
pub struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> CollabResult<Vec<f32>> {
        let text = text.to_lowercase();
        Ok(VOCABULARY
            .iter()
            .map(|word| if text.contains(word) { 1.0 } else { -1.0 })
            .collect())
    }
}

/// File name of a result path, for compact assertions.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

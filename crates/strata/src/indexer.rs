//! Building and refreshing a project's directory indexes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IndexBuilder::build                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Plan       (Sequential): walk dirs, diff merkle snapshots   │
//! │  Parse      (Parallel):   rayon par_iter over changed files  │
//! │  Write      (Sequential): one bulk batch per dir, deepest    │
//! │                           first so child digests are known   │
//! │  Reconcile  (Sequential): drop vanished dirs, save snapshot  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A file is reparsed when the run is forced, when the merkle diff against
//! the previous snapshot lists it, or when its directory store has no row
//! for it. Everything else is counted as unchanged and left alone. Files
//! that reported an error are saved with a stale digest so the next run
//! picks them up again.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collaborators::{CollabResult, Embedder, ParsedSource, SourceParser};
use crate::error::{Error, IndexError, Result};
use crate::global_index::{GlobalSymbolIndex, global_index_db};
use crate::merkle::{MerkleTree, find_changed_files, is_ignored};
use crate::parser::TreeSitterParser;
use crate::path_mapper::{PathMapper, canonicalize_path};
use crate::registry::RegistryStore;
use crate::store::DirIndexStore;
use crate::store::helpers::normalize_path;
use crate::types::{ChunkData, IndexStats, IndexedFile, Language, ProjectId};

/// Lines per embedded chunk.
pub const CHUNK_LINES: usize = 40;

/// Where the merkle snapshot of a project is kept, next to the registry.
#[must_use]
pub fn merkle_snapshot_path(mapper: &PathMapper, project_id: ProjectId) -> PathBuf {
    mapper.index_root().join(format!("merkle-{project_id}.json"))
}

/// One directory found while walking the source tree.
#[derive(Debug)]
struct SourceDir {
    path: PathBuf,
    depth: u32,
    children: Vec<PathBuf>,
    files: Vec<(PathBuf, Language)>,
}

/// What a finished directory reports to its parent.
#[derive(Debug, Clone)]
struct WrittenDir {
    db_path: PathBuf,
    files_count: u64,
    merkle_root: String,
}

/// Builds per-directory indexes for a source tree.
pub struct IndexBuilder {
    registry: Arc<RegistryStore>,
    parser: Arc<dyn SourceParser>,
    embedder: Option<Arc<dyn Embedder>>,
    force: bool,
}

impl IndexBuilder {
    /// Builder writing through `registry`, parsing with tree-sitter.
    #[must_use]
    pub fn new(registry: Arc<RegistryStore>) -> Self {
        Self {
            registry,
            parser: Arc::new(TreeSitterParser),
            embedder: None,
            force: false,
        }
    }

    /// Use a different parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn SourceParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Embed file chunks for vector search.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Reparse every file regardless of the previous snapshot.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Index (or refresh) the project rooted at `source_root`.
    ///
    /// Per-file problems are collected in [`IndexStats::errors`]; a
    /// directory whose store cannot be written is recorded the same way and
    /// the rest of the tree is still indexed.
    pub fn build(&self, source_root: &Path) -> Result<IndexStats> {
        let start = Instant::now();
        if !source_root.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                source_root.display()
            )));
        }
        let root = canonicalize_path(source_root);
        let mapper = self.registry.mapper();
        let project = self
            .registry
            .register_project(&root, &mapper.get_index_root(&root))?;

        let snapshot_path = merkle_snapshot_path(mapper, project.id);
        let mut snapshot = MerkleTree::build_from_directory(&root)?;
        let previous = if self.force {
            None
        } else {
            load_snapshot(&snapshot_path)
        };
        let changed: HashSet<String> = find_changed_files(previous.as_ref(), Some(&snapshot))
            .into_iter()
            .collect();

        let global = GlobalSymbolIndex::open(&global_index_db(mapper, &root), project.id)?;
        if self.force {
            global.clear()?;
        }

        let dirs = discover(&root)?;
        let mut stats = IndexStats::default();

        // Plan: open every store and decide which files need parsing.
        let mut stores: HashMap<PathBuf, DirIndexStore> = HashMap::new();
        let mut jobs: Vec<(PathBuf, Language)> = Vec::new();
        for dir in &dirs {
            let store = match DirIndexStore::open(&mapper.source_to_index_db(&dir.path)) {
                Ok(store) => store,
                Err(e) => {
                    warn!(dir = %dir.path.display(), error = %e, "Cannot open directory index");
                    stats.errors.push(IndexError::new(dir.path.clone(), e.to_string()));
                    continue;
                }
            };
            for (path, language) in &dir.files {
                let rel = relative_key(&root, path);
                if self.force || changed.contains(&rel) || store.get_file(path)?.is_none() {
                    jobs.push((path.clone(), *language));
                } else {
                    stats.files_unchanged += 1;
                }
            }
            stores.insert(dir.path.clone(), store);
        }
        debug!(
            dirs = dirs.len(),
            changed = changed.len(),
            to_parse = jobs.len(),
            "Planned indexing run"
        );

        // Parse: read, parse and embed in parallel.
        let prepared: Vec<(Option<IndexedFile>, Vec<IndexError>)> = jobs
            .par_iter()
            .map(|(path, language)| self.prepare_file(path, *language))
            .collect();

        let mut by_dir: HashMap<PathBuf, Vec<IndexedFile>> = HashMap::new();
        for (file, errors) in prepared {
            stats.errors.extend(errors);
            if let Some(file) = file {
                let dir = file.path.parent().map(Path::to_path_buf).unwrap_or_default();
                by_dir.entry(dir).or_default().push(file);
            }
        }

        // Write: deepest directories first.
        let mut written: HashMap<PathBuf, WrittenDir> = HashMap::new();
        for dir in dirs.iter().rev() {
            let Some(store) = stores.get(&dir.path) else {
                continue;
            };
            let files = by_dir.remove(&dir.path).unwrap_or_default();
            match self.write_dir(project.id, store, dir, files, &global, &written, &mut stats) {
                Ok(done) => {
                    stats.dirs_indexed += 1;
                    written.insert(dir.path.clone(), done);
                }
                Err(e) => {
                    warn!(dir = %dir.path.display(), error = %e, "Failed to write directory index");
                    stats.errors.push(IndexError::new(dir.path.clone(), e.to_string()));
                }
            }
        }

        // Reconcile: directories that disappeared since the last run.
        let present: HashSet<String> = dirs.iter().map(|d| mapper.key(&d.path)).collect();
        for mapping in self.registry.get_project_dirs(project.id)? {
            if present.contains(&mapper.key(&mapping.source_path)) {
                continue;
            }
            stats.files_removed += forget_dir(&mapping.index_path, &global);
            self.registry.unregister_dir(&mapping.source_path)?;
            debug!(dir = %mapping.source_path.display(), "Dropped vanished directory");
        }

        // Anything that failed must be retried next run, not diffed away.
        let failed: HashSet<String> = stats
            .errors
            .iter()
            .map(|e| relative_key(&root, &e.path))
            .collect();
        let stale = snapshot.mark_stale(&failed);
        if stale > 0 {
            debug!(files = stale, "Marked failed files for retry");
        }
        snapshot.save(&snapshot_path)?;
        let total_files = written.values().map(|w| w.files_count).sum();
        self.registry
            .update_project_stats(project.id, total_files, written.len() as u64)?;

        stats.duration = start.elapsed();
        info!(
            root = %root.display(),
            files_indexed = stats.files_indexed,
            files_unchanged = stats.files_unchanged,
            files_removed = stats.files_removed,
            dirs = stats.dirs_indexed,
            errors = stats.errors.len(),
            "Indexing finished"
        );
        Ok(stats)
    }

    /// Read, parse and embed one file.
    ///
    /// Unreadable files yield no record. A parse or embedding failure keeps
    /// the file for text search and reports the problem.
    fn prepare_file(&self, path: &Path, language: Language) -> (Option<IndexedFile>, Vec<IndexError>) {
        let mut errors = Vec::new();
        let content = match fs::read(path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    errors.push(IndexError::new(path.to_path_buf(), "file is not valid UTF-8"));
                    return (None, errors);
                }
            },
            Err(e) => {
                errors.push(IndexError::new(path.to_path_buf(), e.to_string()));
                return (None, errors);
            }
        };

        let parsed = if self.parser.supports(language) {
            self.parser.parse(&content, language).unwrap_or_else(|e| {
                errors.push(IndexError::new(path.to_path_buf(), format!("parse failed: {e}")));
                ParsedSource::default()
            })
        } else {
            ParsedSource::default()
        };

        let chunks = match &self.embedder {
            Some(embedder) => chunk_file(path, &content, embedder.as_ref()).unwrap_or_else(|e| {
                errors.push(IndexError::new(path.to_path_buf(), format!("embedding failed: {e}")));
                Vec::new()
            }),
            None => Vec::new(),
        };

        let file = IndexedFile {
            path: path.to_path_buf(),
            language,
            content,
            symbols: parsed.symbols,
            relationships: parsed.relationships,
            chunks,
        };
        (Some(file), errors)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_dir(
        &self,
        project_id: ProjectId,
        store: &DirIndexStore,
        dir: &SourceDir,
        files: Vec<IndexedFile>,
        global: &GlobalSymbolIndex,
        written: &HashMap<PathBuf, WrittenDir>,
        stats: &mut IndexStats,
    ) -> Result<WrittenDir> {
        store.begin_bulk_insert()?;
        let outcome = write_files(store, dir, files, global, stats);
        let flushed = store.end_bulk_insert();
        outcome?;
        flushed?;

        link_children(store, dir, written)?;
        let merkle_root = store.update_merkle_root()?;
        let files_count = store.stats()?.files as u64;

        self.registry
            .register_dir(project_id, &dir.path, store.db_path(), dir.depth)?;
        self.registry.update_dir_stats(&dir.path, files_count)?;

        Ok(WrittenDir {
            db_path: store.db_path().to_path_buf(),
            files_count,
            merkle_root,
        })
    }
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("registry", &self.registry.path())
            .field("embedder", &self.embedder.is_some())
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

fn write_files(
    store: &DirIndexStore,
    dir: &SourceDir,
    files: Vec<IndexedFile>,
    global: &GlobalSymbolIndex,
    stats: &mut IndexStats,
) -> Result<()> {
    let on_disk: HashSet<String> = dir.files.iter().map(|(p, _)| normalize_path(p)).collect();
    for record in store.list_files()? {
        if on_disk.contains(&normalize_path(&record.path)) {
            continue;
        }
        store.delete_file(&record.path)?;
        global.delete_file_symbols(&record.path)?;
        stats.files_removed += 1;
    }

    for file in files {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Err(e) = store.add_file(
            &name,
            &file.path,
            &file.content,
            file.language,
            &file.symbols,
            &file.relationships,
        ) {
            warn!(file = %file.path.display(), error = %e, "Failed to store file");
            stats.errors.push(IndexError::new(file.path.clone(), e.to_string()));
            continue;
        }
        global.update_file_symbols(&file.path, &file.symbols, store.db_path())?;
        if !file.chunks.is_empty() {
            store.add_chunks(file.chunks)?;
        }
        stats.files_indexed += 1;
        stats.symbols_found += file.symbols.len();
    }
    Ok(())
}

/// Point `store` at its written children and unlink the ones that are gone.
fn link_children(
    store: &DirIndexStore,
    dir: &SourceDir,
    written: &HashMap<PathBuf, WrittenDir>,
) -> Result<()> {
    let mut names = HashSet::new();
    for child in &dir.children {
        let (Some(name), Some(done)) = (child.file_name(), written.get(child)) else {
            continue;
        };
        let name = name.to_string_lossy().into_owned();
        store.register_subdir(&name, &done.db_path, done.files_count, Some(&done.merkle_root))?;
        names.insert(name);
    }
    for entry in store.list_subdirs()? {
        if !names.contains(&entry.name) {
            store.remove_subdir(&entry.name)?;
        }
    }
    Ok(())
}

/// Drop global symbols of every file in a vanished directory's index.
///
/// Returns the number of files it held.
fn forget_dir(index_path: &Path, global: &GlobalSymbolIndex) -> usize {
    if !index_path.exists() {
        return 0;
    }
    let files = match DirIndexStore::open(index_path).and_then(|s| s.list_files()) {
        Ok(files) => files,
        Err(e) => {
            debug!(index = %index_path.display(), error = %e, "Cannot read vanished index");
            return 0;
        }
    };
    for file in &files {
        if let Err(e) = global.delete_file_symbols(&file.path) {
            debug!(file = %file.path.display(), error = %e, "Cannot drop global symbols");
        }
    }
    files.len()
}

/// Split a file into line windows and embed each one.
fn chunk_file(path: &Path, content: &str, embedder: &dyn Embedder) -> CollabResult<Vec<ChunkData>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    for (index, window) in lines.chunks(CHUNK_LINES).enumerate() {
        let text = window.join("\n");
        if text.trim().is_empty() {
            continue;
        }
        let start_line = index * CHUNK_LINES + 1;
        let end_line = start_line + window.len() - 1;
        let embedding = embedder.embed(&text)?;
        let mut chunk = ChunkData {
            file_path: path.to_path_buf(),
            content: text,
            embedding: Some(embedding),
            ..ChunkData::default()
        };
        chunk.metadata.insert("start_line".into(), json!(start_line));
        chunk.metadata.insert("end_line".into(), json!(end_line));
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// The previous snapshot; an unreadable or corrupt one counts as missing.
fn load_snapshot(path: &Path) -> Option<MerkleTree> {
    match MerkleTree::load(path) {
        Ok(tree) => tree,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable merkle snapshot");
            None
        }
    }
}

/// `/`-separated path of `path` relative to `root`, as merkle snapshots name files.
fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every indexable directory under `root`, shallowest first.
///
/// Hidden entries, build directories and symlinks are skipped, matching
/// what merkle snapshots cover.
fn discover(root: &Path) -> Result<Vec<SourceDir>> {
    let mut dirs = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0u32)];

    while let Some((path, depth)) = stack.pop() {
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if depth > 0 => {
                warn!(directory = %path.display(), error = %e, "Cannot read directory, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(directory = %path.display(), error = %e, "Failed to read directory entry, skipping");
                    continue;
                }
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_ignored(&name, file_type.is_dir()) {
                continue;
            }
            let entry_path = entry.path();
            if file_type.is_dir() {
                children.push(entry_path);
            } else if let Some(language) = entry_path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Language::from_extension)
            {
                files.push((entry_path, language));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        children.sort();
        for child in &children {
            stack.push((child.clone(), depth + 1));
        }
        dirs.push(SourceDir {
            path,
            depth,
            children,
            files,
        });
    }

    dirs.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.path.cmp(&b.path)));
    Ok(dirs)
}

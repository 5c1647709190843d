//! File replacement, staleness checks, and merkle digests.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use rusqlite::{OptionalExtension, Transaction, params};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use super::DirIndexStore;
use super::helpers::{FILES_COLUMNS, hash_from_sql, hash_to_sql, normalize_path, row_to_file};
use crate::error::Result;
use crate::merkle::{hash_bytes, manifest_hash};
use crate::registry::now_secs;
use crate::types::{FileId, FileRecord, Language, Relationship, Symbol, SymbolId};

/// Modification time of a file in nanoseconds, 0 if unavailable.
pub(crate) fn file_mtime_ns(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

impl DirIndexStore {
    /// Replace every stored fact about one file.
    ///
    /// Inside one transaction: upsert the file row, delete its symbols (which
    /// cascades to relationships and graph neighbors), refresh its full-text
    /// entry and content digest, drop its chunks, then insert the new
    /// symbols and relationships. Relationship sources are resolved by name
    /// against the symbols just inserted; unresolvable ones are skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &self,
        name: &str,
        full_path: &Path,
        content: &str,
        language: Language,
        symbols: &[Symbol],
        relationships: &[Relationship],
    ) -> Result<FileId> {
        let path_str = normalize_path(full_path);
        let mtime_ns = file_mtime_ns(full_path);
        let content_hash = hash_to_sql(xxh3_64(content.as_bytes()));
        let sha256 = hash_bytes(content.as_bytes());
        let line_count = u32::try_from(content.lines().count()).unwrap_or(u32::MAX);
        let now = now_secs();

        let file_id = self.with_connection(|conn| {
            let tx = conn.transaction()?;

            let updated = tx.execute(
                "UPDATE files SET name = ?2, content = ?3, language = ?4, mtime_ns = ?5,
                 content_hash = ?6, line_count = ?7, indexed_at = ?8 WHERE full_path = ?1",
                params![
                    path_str,
                    name,
                    content,
                    language.as_str(),
                    mtime_ns,
                    content_hash,
                    line_count,
                    now
                ],
            )?;
            let file_id = if updated == 0 {
                tx.execute(
                    "INSERT INTO files (name, full_path, content, language, mtime_ns,
                     content_hash, line_count, indexed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        name,
                        path_str,
                        content,
                        language.as_str(),
                        mtime_ns,
                        content_hash,
                        line_count,
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            } else {
                tx.query_row(
                    "SELECT id FROM files WHERE full_path = ?1",
                    [&path_str],
                    |row| row.get(0),
                )?
            };

            tx.execute(
                "DELETE FROM code_relationships WHERE source_symbol_id IN
                 (SELECT id FROM symbols WHERE file_id = ?1)",
                [file_id],
            )?;
            tx.execute("DELETE FROM symbols WHERE file_id = ?1", [file_id])?;
            tx.execute("DELETE FROM files_fts WHERE rowid = ?1", [file_id])?;
            tx.execute(
                "INSERT INTO files_fts (rowid, name, full_path, content) VALUES (?1, ?2, ?3, ?4)",
                params![file_id, name, path_str, content],
            )?;
            tx.execute(
                "INSERT INTO merkle_hashes (file_id, sha256, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(file_id) DO UPDATE SET sha256 = excluded.sha256,
                     updated_at = excluded.updated_at",
                params![file_id, sha256, now],
            )?;
            tx.execute("DELETE FROM chunks WHERE file_path = ?1", [&path_str])?;

            let inserted = insert_symbols(&tx, file_id, symbols)?;
            insert_relationships(&tx, &inserted, relationships)?;

            tx.commit()?;
            trace!(
                file = %path_str,
                symbols = inserted.len(),
                relationships = relationships.len(),
                "Stored file"
            );
            Ok(FileId(file_id))
        })?;

        self.after_file_change(full_path)?;
        Ok(file_id)
    }

    /// Mark derived data stale, or rebuild it now when not in bulk mode.
    fn after_file_change(&self, full_path: &Path) -> Result<()> {
        let deferred = {
            let mut state = self.bulk_state()?;
            if state.active {
                state.graph_dirty = true;
                state.pending_chunks.retain(|c| c.file_path != full_path);
            }
            state.active
        };
        self.invalidate_binary_searcher()?;
        if !deferred {
            self.rebuild_graph_neighbors()?;
        }
        Ok(())
    }

    /// Whether the file at `path` differs from what is stored.
    ///
    /// A missing row means the file must be indexed. An unchanged mtime means
    /// it is current. Otherwise the content hash decides, so touching a file
    /// without changing its bytes does not trigger a reindex.
    pub fn needs_reindex(&self, path: &Path) -> Result<bool> {
        let path_str = normalize_path(path);
        let stored = self.with_connection(|conn| {
            conn.query_row(
                "SELECT mtime_ns, content_hash FROM files WHERE full_path = ?1",
                [&path_str],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()
            .map_err(Into::into)
        })?;

        let Some((stored_mtime, stored_hash)) = stored else {
            return Ok(true);
        };
        if !path.exists() {
            return Ok(true);
        }
        let current_mtime = file_mtime_ns(path);
        if current_mtime == stored_mtime {
            return Ok(false);
        }
        let Some(stored_hash) = stored_hash else {
            return Ok(true);
        };
        let bytes = std::fs::read(path)?;
        if xxh3_64(&bytes) != hash_from_sql(stored_hash) {
            return Ok(true);
        }

        // Touched but identical: remember the new mtime so the next check
        // does not hash again.
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE files SET mtime_ns = ?2 WHERE full_path = ?1",
                params![path_str, current_mtime],
            )?;
            Ok(())
        })?;
        trace!(file = %path_str, "Refreshed mtime of unchanged file");
        Ok(false)
    }

    /// Remove a file and everything derived from it.
    ///
    /// Returns `false` if the file was not stored.
    pub fn delete_file(&self, path: &Path) -> Result<bool> {
        let path_str = normalize_path(path);
        let removed = self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let id: Option<i64> = tx
                .query_row("SELECT id FROM files WHERE full_path = ?1", [&path_str], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(id) = id else {
                return Ok(false);
            };
            tx.execute("DELETE FROM files_fts WHERE rowid = ?1", [id])?;
            tx.execute("DELETE FROM chunks WHERE file_path = ?1", [&path_str])?;
            tx.execute(
                "DELETE FROM code_relationships WHERE source_symbol_id IN
                 (SELECT id FROM symbols WHERE file_id = ?1)",
                [id],
            )?;
            tx.execute("DELETE FROM files WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(true)
        })?;

        if removed {
            self.after_file_change(path)?;
            tracing::debug!(file = %path_str, "Removed file from index");
        }
        Ok(removed)
    }

    /// Stored metadata for one file.
    pub fn get_file(&self, path: &Path) -> Result<Option<FileRecord>> {
        let path_str = normalize_path(path);
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {FILES_COLUMNS} FROM files WHERE full_path = ?1"),
                [&path_str],
                row_to_file,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Stored content of one file.
    pub fn file_content(&self, path: &Path) -> Result<Option<String>> {
        let path_str = normalize_path(path);
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT content FROM files WHERE full_path = ?1",
                [&path_str],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Every stored file, ordered by path.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {FILES_COLUMNS} FROM files ORDER BY full_path"))?;
            let files = stmt
                .query_map([], row_to_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(files)
        })
    }

    /// Recompute and persist this directory's merkle digest.
    ///
    /// The digest covers the content hash of every stored file plus the
    /// recorded digest of every linked child directory, in the same manifest
    /// form [`crate::merkle::MerkleTree`] uses. Unchanged children keep the
    /// parent's digest unchanged.
    pub fn update_merkle_root(&self) -> Result<String> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut entries: Vec<(String, bool, String)> = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT f.name, m.sha256 FROM files f JOIN merkle_hashes m ON m.file_id = f.id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, false, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    entries.push(row?);
                }
                let mut stmt = tx.prepare(
                    "SELECT name, merkle_root FROM subdirs WHERE merkle_root IS NOT NULL",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, true, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    entries.push(row?);
                }
            }

            let root = manifest_hash(
                entries
                    .iter()
                    .map(|(name, is_dir, hash)| (name.as_str(), *is_dir, hash.as_str())),
            );
            tx.execute(
                "INSERT INTO merkle_state (id, root_hash, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET root_hash = excluded.root_hash,
                     updated_at = excluded.updated_at",
                params![root, now_secs()],
            )?;
            tx.commit()?;
            Ok(root)
        })
    }

    /// Last persisted merkle digest.
    pub fn merkle_root(&self) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row("SELECT root_hash FROM merkle_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Into::into)
        })
    }
}

struct InsertedSymbol<'a> {
    id: i64,
    name: &'a str,
    start_line: u32,
    end_line: u32,
}

fn insert_symbols<'a>(
    tx: &Transaction<'_>,
    file_id: i64,
    symbols: &'a [Symbol],
) -> Result<Vec<InsertedSymbol<'a>>> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO symbols (file_id, name, kind, start_line, end_line)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        stmt.execute(params![
            file_id,
            symbol.name,
            symbol.kind.as_str(),
            symbol.start_line,
            symbol.end_line
        ])?;
        inserted.push(InsertedSymbol {
            id: tx.last_insert_rowid(),
            name: &symbol.name,
            start_line: symbol.start_line,
            end_line: symbol.end_line,
        });
    }
    Ok(inserted)
}

fn insert_relationships(
    tx: &Transaction<'_>,
    symbols: &[InsertedSymbol<'_>],
    relationships: &[Relationship],
) -> Result<()> {
    let mut by_name: HashMap<&str, Vec<&InsertedSymbol<'_>>> = HashMap::new();
    for symbol in symbols {
        by_name.entry(symbol.name).or_default().push(symbol);
    }

    let mut stmt = tx.prepare_cached(
        "INSERT INTO code_relationships (source_symbol_id, target_qualified_name, target_name,
         relationship_type, source_line, target_file)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for rel in relationships {
        let Some(source) = resolve_source(&by_name, rel) else {
            trace!(source = %rel.source_symbol, "Relationship source not found, skipping");
            continue;
        };
        stmt.execute(params![
            source.as_i64(),
            rel.target_qualified_name,
            target_name(&rel.target_qualified_name),
            rel.relationship_type.as_str(),
            rel.source_line,
            rel.target_file
        ])?;
    }
    Ok(())
}

/// Innermost symbol with the source name that contains the reference line,
/// falling back to the first symbol with that name.
fn resolve_source(
    by_name: &HashMap<&str, Vec<&InsertedSymbol<'_>>>,
    rel: &Relationship,
) -> Option<SymbolId> {
    let candidates = by_name.get(rel.source_symbol.as_str())?;
    candidates
        .iter()
        .filter(|s| s.start_line <= rel.source_line && rel.source_line <= s.end_line)
        .min_by_key(|s| s.end_line - s.start_line)
        .or_else(|| candidates.first())
        .map(|s| SymbolId(s.id))
}

/// Last segment of a qualified name (`a::b::c`, `a.b.c`).
pub(crate) fn target_name(qualified: &str) -> &str {
    qualified
        .rsplit(['.', ':'])
        .find(|s| !s.is_empty())
        .unwrap_or(qualified)
}

//! Project-wide symbol table.
//!
//! A flat copy of every directory store's symbols, kept in
//! `_global_symbols.db` at the project's index root. It answers exact and
//! prefix lookups without walking the directory chain. The per-directory
//! stores stay authoritative; this table is a cache that the indexer can
//! drop and rebuild at any time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::migrations::{self, Migration};
use crate::path_mapper::PathMapper;
use crate::store::helpers::{escape_like, normalize_path, parse_symbol_kind};
use crate::types::{ProjectId, Symbol, SymbolKind};

/// File name of the global symbol database inside a project's index root.
pub const GLOBAL_INDEX_DB_NAME: &str = "_global_symbols.db";

/// Location of the global symbol database for the project rooted at `source_root`.
#[must_use]
pub fn global_index_db(mapper: &PathMapper, source_root: &Path) -> PathBuf {
    mapper.get_index_root(source_root).join(GLOBAL_INDEX_DB_NAME)
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS global_symbols (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL,
    symbol_name TEXT NOT NULL,
    symbol_kind TEXT NOT NULL,
    file_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    index_path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_global_symbols_name ON global_symbols(project_id, symbol_name);
CREATE INDEX IF NOT EXISTS idx_global_symbols_file ON global_symbols(project_id, file_path);
",
    )
}

const GLOBAL_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "global symbols",
    apply: create_tables,
}];

/// A symbol hit together with the directory index that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSymbol {
    /// The symbol, with its file path set
    pub symbol: Symbol,
    /// `_index.db` of the directory holding the file
    pub index_path: PathBuf,
}

/// Flat symbol table for one project.
pub struct GlobalSymbolIndex {
    conn: Mutex<Connection>,
    path: PathBuf,
    project_id: ProjectId,
}

impl GlobalSymbolIndex {
    /// Open or create the table at `db_path`, scoped to `project_id`.
    pub fn open(db_path: &Path, project_id: ProjectId) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrations::run(&mut conn, GLOBAL_MIGRATIONS)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
            project_id,
        })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Project this index is scoped to.
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            Error::Internal(format!(
                "global index connection mutex poisoned (a thread panicked while holding the lock): {e}"
            ))
        })
    }

    /// Append one symbol.
    ///
    /// The symbol must carry its file path.
    pub fn add_symbol(&self, symbol: &Symbol, index_path: &Path) -> Result<()> {
        let file_path = symbol.file_path.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("symbol {} has no file path", symbol.name))
        })?;
        let conn = self.connection()?;
        insert(&conn, self.project_id, file_path, symbol, index_path)
    }

    /// Replace every symbol recorded for `file_path`.
    ///
    /// Runs as one transaction: the old set is deleted and the new one
    /// inserted, so readers never see a mix.
    pub fn update_file_symbols(
        &self,
        file_path: &Path,
        symbols: &[Symbol],
        index_path: &Path,
    ) -> Result<()> {
        let path_str = normalize_path(file_path);
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM global_symbols WHERE project_id = ?1 AND file_path = ?2",
            params![self.project_id.as_i64(), path_str],
        )?;
        for symbol in symbols {
            insert(&tx, self.project_id, file_path, symbol, index_path)?;
        }
        tx.commit()?;
        tracing::trace!(file = %path_str, symbols = symbols.len(), "Updated global symbols");
        Ok(())
    }

    /// Forget every symbol of `file_path`. Returns the number removed.
    pub fn delete_file_symbols(&self, file_path: &Path) -> Result<usize> {
        let conn = self.connection()?;
        Ok(conn.execute(
            "DELETE FROM global_symbols WHERE project_id = ?1 AND file_path = ?2",
            params![self.project_id.as_i64(), normalize_path(file_path)],
        )?)
    }

    /// Drop every symbol of this project.
    pub fn clear(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM global_symbols WHERE project_id = ?1",
            [self.project_id.as_i64()],
        )?;
        Ok(())
    }

    /// Symbols named `name`, or starting with it in prefix mode.
    ///
    /// Names compare ASCII case-insensitively in both modes. Ordered by
    /// name, then insertion order.
    pub fn search(
        &self,
        name: &str,
        kind: Option<SymbolKind>,
        limit: usize,
        prefix_mode: bool,
    ) -> Result<Vec<GlobalSymbol>> {
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (condition, pattern) = if prefix_mode {
            ("symbol_name LIKE ?2 ESCAPE '\\'", format!("{}%", escape_like(name)))
        } else {
            ("symbol_name = ?2 COLLATE NOCASE", name.to_string())
        };
        let sql = format!(
            "SELECT symbol_name, symbol_kind, start_line, end_line, file_path, index_path
             FROM global_symbols
             WHERE project_id = ?1 AND {condition} AND (?3 IS NULL OR symbol_kind = ?3)
             ORDER BY symbol_name, id
             LIMIT ?4"
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let hits = stmt
            .query_map(
                params![
                    self.project_id.as_i64(),
                    pattern,
                    kind.map(|k| k.as_str()),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                |row| {
                    let kind: String = row.get(1)?;
                    Ok(GlobalSymbol {
                        symbol: Symbol {
                            name: row.get(0)?,
                            kind: parse_symbol_kind(&kind, 1)?,
                            start_line: row.get(2)?,
                            end_line: row.get(3)?,
                            file_path: Some(PathBuf::from(row.get::<_, String>(4)?)),
                        },
                        index_path: PathBuf::from(row.get::<_, String>(5)?),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// Number of symbols recorded for this project.
    pub fn len(&self) -> Result<usize> {
        let conn = self.connection()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM global_symbols WHERE project_id = ?1",
            [self.project_id.as_i64()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Whether no symbols are recorded for this project.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn insert(
    conn: &Connection,
    project_id: ProjectId,
    file_path: &Path,
    symbol: &Symbol,
    index_path: &Path,
) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO global_symbols (project_id, symbol_name, symbol_kind, file_path,
         start_line, end_line, index_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        project_id.as_i64(),
        symbol.name,
        symbol.kind.as_str(),
        normalize_path(file_path),
        symbol.start_line,
        symbol.end_line,
        normalize_path(index_path)
    ])?;
    Ok(())
}

impl std::fmt::Debug for GlobalSymbolIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSymbolIndex")
            .field("path", &self.path)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index() -> (TempDir, GlobalSymbolIndex) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let index = GlobalSymbolIndex::open(&dir.path().join(GLOBAL_INDEX_DB_NAME), ProjectId(1))
            .expect("open global index");
        (dir, index)
    }

    fn sym(name: &str, kind: SymbolKind, line: u32) -> Symbol {
        Symbol::new(name, kind, line, line + 1).expect("valid symbol")
    }

    #[test]
    fn exact_and_prefix_lookup() {
        let (_dir, index) = index();
        let file = Path::new("/p/src/auth.py");
        index
            .update_file_symbols(
                file,
                &[
                    sym("AuthManager", SymbolKind::Class, 1),
                    sym("AuthToken", SymbolKind::Struct, 10),
                    sym("login", SymbolKind::Function, 20),
                ],
                Path::new("/idx/p/src/_index.db"),
            )
            .expect("update");

        assert_eq!(index.search("AuthManager", None, 10, false).expect("exact").len(), 1);
        let prefix = index.search("Auth", None, 10, true).expect("prefix");
        let names: Vec<_> = prefix.iter().map(|h| h.symbol.name.as_str()).collect();
        assert_eq!(names, vec!["AuthManager", "AuthToken"]);
        assert_eq!(prefix[0].index_path, PathBuf::from("/idx/p/src/_index.db"));

        let classes = index
            .search("Auth", Some(SymbolKind::Class), 10, true)
            .expect("by kind");
        assert_eq!(classes.len(), 1);
    }

    #[test]
    fn exact_and_prefix_lookup_agree_on_case() {
        let (_dir, index) = index();
        index
            .update_file_symbols(
                Path::new("/p/src/auth.rs"),
                &[sym("AuthManager", SymbolKind::Struct, 1)],
                Path::new("/idx/p/src/_index.db"),
            )
            .expect("update");

        assert_eq!(index.search("authmanager", None, 10, false).expect("exact").len(), 1);
        assert_eq!(index.search("authmanager", None, 10, true).expect("prefix").len(), 1);
        assert_eq!(index.search("AUTH", None, 10, true).expect("prefix").len(), 1);
    }

    #[test]
    fn same_name_keeps_insertion_order() {
        let (_dir, index) = index();
        let idx = Path::new("/idx/_index.db");
        for (i, file) in ["/p/z.rs", "/p/a.rs"].iter().enumerate() {
            let mut s = sym("run", SymbolKind::Function, 1);
            s.file_path = Some(PathBuf::from(file));
            index.add_symbol(&s, idx).expect("add");
            assert_eq!(index.len().expect("len"), i + 1);
        }
        let hits = index.search("run", None, 10, false).expect("search");
        assert_eq!(hits[0].symbol.file_path, Some(PathBuf::from("/p/z.rs")));
    }

    #[test]
    fn add_symbol_requires_file_path() {
        let (_dir, index) = index();
        let err = index
            .add_symbol(&sym("x", SymbolKind::Const, 1), Path::new("/idx/_index.db"))
            .expect_err("missing path");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn projects_are_isolated() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = dir.path().join(GLOBAL_INDEX_DB_NAME);
        let one = GlobalSymbolIndex::open(&db, ProjectId(1)).expect("open");
        let two = GlobalSymbolIndex::open(&db, ProjectId(2)).expect("open");
        one.update_file_symbols(
            Path::new("/p/a.rs"),
            &[sym("shared", SymbolKind::Function, 1)],
            Path::new("/idx/_index.db"),
        )
        .expect("update");
        assert!(two.search("shared", None, 10, false).expect("search").is_empty());
        assert!(two.is_empty().expect("empty"));
    }
}

//! Full-text, file, and symbol queries.

use std::path::PathBuf;

use rusqlite::params;

use super::DirIndexStore;
use super::helpers::{SYMBOLS_COLUMNS, escape_like, parse_symbol_kind, sanitize_fts_query};
use crate::error::Result;
use crate::types::{Language, SearchResult, Symbol, SymbolKind};

/// Filters for full-text search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FtsOptions {
    /// Skip documentation and configuration files
    pub code_only: bool,
    /// Leave out excerpts
    pub files_only: bool,
}

const SNIPPET_TOKENS: i64 = 24;

fn non_code_filter(code_only: bool) -> String {
    if !code_only {
        return String::new();
    }
    let excluded: Vec<String> = [Language::Markdown, Language::Config]
        .iter()
        .map(|l| format!("'{}'", l.as_str()))
        .collect();
    format!("AND f.language NOT IN ({})", excluded.join(", "))
}

// Row counts fit comfortably in i64
#[allow(clippy::cast_possible_wrap)]
fn sql_limit(limit: usize) -> i64 {
    limit as i64
}

impl DirIndexStore {
    /// Rank stored files against `query` with bm25.
    ///
    /// Each term matches as a prefix. Scores are the negated bm25 value, so
    /// higher is better; ties are ordered by path.
    pub fn search_fts(
        &self,
        query: &str,
        limit: usize,
        options: FtsOptions,
    ) -> Result<Vec<SearchResult>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT f.full_path, -bm25(files_fts) AS score,
                    snippet(files_fts, 2, '', '', '...', {SNIPPET_TOKENS})
             FROM files_fts JOIN files f ON f.id = files_fts.rowid
             WHERE files_fts MATCH ?1 {}
             ORDER BY bm25(files_fts), f.full_path
             LIMIT ?2",
            non_code_filter(options.code_only)
        );

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![fts_query, sql_limit(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;

            let mut results = Vec::new();
            for row in rows {
                let (path, score, snippet) = row?;
                let mut result = SearchResult::new(path, score).with_metadata("source", "fts");
                if !options.files_only {
                    if let Some(snippet) = snippet {
                        result = result.with_excerpt(snippet);
                    }
                }
                results.push(result);
            }
            Ok(results)
        })
    }

    /// Paths of files matching `query`, best first.
    pub fn search_files_only(&self, query: &str, limit: usize) -> Result<Vec<PathBuf>> {
        let options = FtsOptions {
            code_only: false,
            files_only: true,
        };
        Ok(self
            .search_fts(query, limit, options)?
            .into_iter()
            .map(|r| r.path)
            .collect())
    }

    /// Symbols named `name` (or starting with it in prefix mode).
    ///
    /// Case-insensitive for ASCII in both modes. Ordered by name, then
    /// insertion order.
    pub fn search_symbols(
        &self,
        name: &str,
        kind: Option<SymbolKind>,
        limit: usize,
        prefix_mode: bool,
    ) -> Result<Vec<Symbol>> {
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (condition, pattern) = if prefix_mode {
            ("s.name LIKE ?1 ESCAPE '\\'", format!("{}%", escape_like(name)))
        } else {
            ("s.name = ?1 COLLATE NOCASE", name.to_string())
        };
        let sql = format!(
            "SELECT {SYMBOLS_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id
             WHERE {condition} AND (?2 IS NULL OR s.kind = ?2)
             ORDER BY s.name, s.id
             LIMIT ?3"
        );

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let symbols = stmt
                .query_map(
                    params![pattern, kind.map(|k| k.as_str()), sql_limit(limit)],
                    super::helpers::row_to_symbol,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(symbols)
        })
    }

    /// Innermost symbol of a file that contains `line`.
    pub fn symbol_at(&self, path: &std::path::Path, line: u32) -> Result<Option<Symbol>> {
        let path_str = super::helpers::normalize_path(path);
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SYMBOLS_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id
                 WHERE f.full_path = ?1 AND s.start_line <= ?2 AND s.end_line >= ?2
                 ORDER BY s.end_line - s.start_line, s.id
                 LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![path_str, line])?;
            match rows.next()? {
                Some(row) => {
                    let kind: String = row.get(1)?;
                    Ok(Some(Symbol {
                        name: row.get(0)?,
                        kind: parse_symbol_kind(&kind, 1)?,
                        start_line: row.get(2)?,
                        end_line: row.get(3)?,
                        file_path: Some(PathBuf::from(row.get::<_, String>(4)?)),
                    }))
                }
                None => Ok(None),
            }
        })
    }
}

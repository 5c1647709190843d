//! Row conversion and encoding helpers for directory stores.

use std::path::{Path, PathBuf};

use crate::types::{FileId, FileRecord, Language, Symbol, SymbolKind};

/// SQL column list for files table.
///
/// Use with `row_to_file` for consistent column ordering.
pub(crate) const FILES_COLUMNS: &str =
    "id, name, full_path, language, mtime_ns, content_hash, line_count, indexed_at";

/// SQL column list for symbols joined with their file (`s` and `f` aliases).
///
/// Use with `row_to_symbol` for consistent column ordering.
pub(crate) const SYMBOLS_COLUMNS: &str = "s.name, s.kind, s.start_line, s.end_line, f.full_path";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("{message}. Database may be corrupted or from a newer version.").into(),
    )
}

/// Parse a symbol kind string from the database.
pub(crate) fn parse_symbol_kind(s: &str, column: usize) -> rusqlite::Result<SymbolKind> {
    s.parse().map_err(|e: String| conversion_error(column, e))
}

/// Parse a language string from the database.
pub(crate) fn parse_language(s: &str, column: usize) -> rusqlite::Result<Language> {
    s.parse().map_err(|e: String| conversion_error(column, e))
}

pub(crate) fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let language: String = row.get(3)?;
    Ok(FileRecord {
        id: FileId(row.get(0)?),
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        language: parse_language(&language, 3)?,
        mtime_ns: row.get(4)?,
        content_hash: row.get::<_, Option<i64>>(5)?.map(hash_from_sql),
        line_count: row.get(6)?,
        indexed_at: row.get(7)?,
    })
}

pub(crate) fn row_to_symbol(row: &rusqlite::Row<'_>) -> rusqlite::Result<Symbol> {
    let kind: String = row.get(1)?;
    Ok(Symbol {
        name: row.get(0)?,
        kind: parse_symbol_kind(&kind, 1)?,
        start_line: row.get(2)?,
        end_line: row.get(3)?,
        file_path: Some(PathBuf::from(row.get::<_, String>(4)?)),
    })
}

/// Normalize a file path to use forward slashes for consistent DB storage.
pub(crate) fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

// Bit-preserving: hashes only need equality after a round trip.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn hash_to_sql(hash: u64) -> i64 {
    hash as i64
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn hash_from_sql(value: i64) -> u64 {
    value as u64
}

/// Encode floats as little-endian bytes.
pub(crate) fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian float bytes; trailing partial values are ignored.
pub(crate) fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Quote each whitespace-separated term as an FTS5 prefix query.
///
/// Returns an empty string when the input has no terms.
pub(crate) fn sanitize_fts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_encoding_round_trips() {
        let values = [0.5_f32, -1.25, 3.0];
        assert_eq!(decode_f32s(&encode_f32s(&values)), values);
    }

    #[test]
    fn hash_survives_sql_representation() {
        let hash = u64::MAX - 7;
        assert_eq!(hash_from_sql(hash_to_sql(hash)), hash);
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(sanitize_fts_query("auth manager"), "\"auth\"* \"manager\"*");
        assert_eq!(sanitize_fts_query("say \"hi\""), "\"say\"* \"\"\"hi\"\"\"*");
        assert_eq!(sanitize_fts_query("   "), "");
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }
}

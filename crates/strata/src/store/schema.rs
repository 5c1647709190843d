//! Schema steps for per-directory index databases.

use rusqlite::Connection;

use crate::migrations::{Migration, add_column_if_missing};

fn core_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
-- Indexed source files
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    full_path TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    language TEXT NOT NULL,
    mtime_ns INTEGER NOT NULL,
    content_hash INTEGER,
    line_count INTEGER NOT NULL DEFAULT 0,
    indexed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_language ON files(language);

-- Symbol definitions, replaced wholesale per file
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);

-- Child directories that have their own index
CREATE TABLE IF NOT EXISTS subdirs (
    name TEXT PRIMARY KEY,
    index_path TEXT NOT NULL,
    files_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

-- Full-text index over file content; rowid is files.id
CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
    name,
    full_path UNINDEXED,
    content
);
",
    )
}

fn relationship_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS code_relationships (
    id INTEGER PRIMARY KEY,
    source_symbol_id INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
    target_qualified_name TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    source_line INTEGER NOT NULL,
    target_file TEXT
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON code_relationships(source_symbol_id);

-- Hop-bounded closure of code_relationships; derived, rebuilt on demand
CREATE TABLE IF NOT EXISTS graph_neighbors (
    source_symbol_id INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
    neighbor_symbol_id INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
    relationship_depth INTEGER NOT NULL,
    PRIMARY KEY (source_symbol_id, neighbor_symbol_id)
);
",
    )?;
    // Last path segment of the target, used to resolve it against local symbols.
    add_column_if_missing(conn, "code_relationships", "target_name", "TEXT")?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON code_relationships(target_name);",
    )
}

fn merkle_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS merkle_hashes (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    sha256 TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS merkle_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    root_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
",
    )?;
    add_column_if_missing(conn, "subdirs", "merkle_root", "TEXT")
}

fn chunk_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    embedding_binary BLOB,
    embedding_dense BLOB,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
",
    )
}

/// Upgrade steps for `_index.db`, oldest first.
pub(crate) const STORE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "files, symbols, subdirs, full-text index",
        apply: core_tables,
    },
    Migration {
        version: 2,
        name: "relationships and graph neighbors",
        apply: relationship_tables,
    },
    Migration {
        version: 3,
        name: "merkle digests",
        apply: merkle_tables,
    },
    Migration {
        version: 4,
        name: "chunks and embeddings",
        apply: chunk_tables,
    },
];

//! Relationship lookup and the precomputed neighbor closure.
//!
//! `graph_neighbors` holds, for every symbol, the symbols reachable through
//! `code_relationships` within [`MAX_GRAPH_DEPTH`] hops, treating edges as
//! undirected (callers and callees are both neighbors). Each pair keeps its
//! shortest hop distance. The table is derived data: it is dropped and
//! recomputed from `code_relationships` whenever facts change.

use std::path::Path;

use rusqlite::params;

use super::DirIndexStore;
use super::helpers::{normalize_path, parse_symbol_kind};
use crate::error::Result;
use crate::types::{GraphNeighbor, MAX_GRAPH_DEPTH, Symbol, SymbolId};

/// A neighbor together with the symbol it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSymbol {
    /// The precomputed edge
    pub neighbor: GraphNeighbor,
    /// The neighbor's definition, with its file path
    pub symbol: Symbol,
}

const REBUILD_NEIGHBORS: &str = r"
WITH RECURSIVE
edges(a, b) AS (
    SELECT r.source_symbol_id, s.id
    FROM code_relationships r JOIN symbols s ON s.name = r.target_name
    WHERE s.id <> r.source_symbol_id
    UNION
    SELECT s.id, r.source_symbol_id
    FROM code_relationships r JOIN symbols s ON s.name = r.target_name
    WHERE s.id <> r.source_symbol_id
),
walk(source, neighbor, depth) AS (
    SELECT a, b, 1 FROM edges
    UNION
    SELECT w.source, e.b, w.depth + 1
    FROM walk w JOIN edges e ON e.a = w.neighbor
    WHERE w.depth < ?1
)
INSERT INTO graph_neighbors (source_symbol_id, neighbor_symbol_id, relationship_depth)
SELECT source, neighbor, MIN(depth) FROM walk
WHERE source <> neighbor
GROUP BY source, neighbor
";

impl DirIndexStore {
    /// Recompute `graph_neighbors` from `code_relationships`.
    ///
    /// Returns the number of neighbor rows written.
    pub fn rebuild_graph_neighbors(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM graph_neighbors", [])?;
            let written = tx.execute(REBUILD_NEIGHBORS, [MAX_GRAPH_DEPTH])?;
            tx.commit()?;
            tracing::trace!(written, "Rebuilt graph neighbors");
            Ok(written)
        })
    }

    /// Ids of symbols named `name` in the file at `path`.
    ///
    /// With `start_line`, only symbols starting on that line match.
    pub fn find_symbol_ids(
        &self,
        path: &Path,
        name: &str,
        start_line: Option<u32>,
    ) -> Result<Vec<SymbolId>> {
        let path_str = normalize_path(path);
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id FROM symbols s JOIN files f ON f.id = s.file_id
                 WHERE f.full_path = ?1 AND s.name = ?2 AND (?3 IS NULL OR s.start_line = ?3)
                 ORDER BY s.id",
            )?;
            let ids = stmt
                .query_map(params![path_str, name, start_line], |row| {
                    row.get::<_, i64>(0).map(SymbolId)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Neighbors of a symbol within `max_depth` hops.
    ///
    /// Ordered by hop distance, then neighbor id.
    pub fn graph_neighbors(&self, symbol_id: SymbolId, max_depth: u32) -> Result<Vec<NeighborSymbol>> {
        let max_depth = max_depth.min(MAX_GRAPH_DEPTH);
        if max_depth == 0 {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT g.neighbor_symbol_id, g.relationship_depth,
                        s.name, s.kind, s.start_line, s.end_line, f.full_path
                 FROM graph_neighbors g
                 JOIN symbols s ON s.id = g.neighbor_symbol_id
                 JOIN files f ON f.id = s.file_id
                 WHERE g.source_symbol_id = ?1 AND g.relationship_depth <= ?2
                 ORDER BY g.relationship_depth, g.neighbor_symbol_id",
            )?;
            let rows = stmt
                .query_map(params![symbol_id.as_i64(), max_depth], |row| {
                    let kind: String = row.get(3)?;
                    Ok(NeighborSymbol {
                        neighbor: GraphNeighbor {
                            source_symbol_id: symbol_id,
                            neighbor_symbol_id: SymbolId(row.get(0)?),
                            relationship_depth: row.get(1)?,
                        },
                        symbol: Symbol {
                            name: row.get(2)?,
                            kind: parse_symbol_kind(&kind, 3)?,
                            start_line: row.get(4)?,
                            end_line: row.get(5)?,
                            file_path: Some(row.get::<_, String>(6)?.into()),
                        },
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

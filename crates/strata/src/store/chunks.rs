//! Chunk storage and vector access.
//!
//! A chunk carries up to three representations of its embedding: the raw
//! floats as produced, an L2-normalized dense copy used for cosine search,
//! and packed sign bits used by [`BinarySearcher`]. The binary searcher is
//! built lazily from the stored rows and cached until chunks change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::params;

use super::DirIndexStore;
use super::helpers::{decode_f32s, encode_f32s, normalize_path};
use crate::binary_search::{BinarySearcher, pack_bits};
use crate::error::{Error, Result};
use crate::registry::now_secs;
use crate::types::{Chunk, ChunkData};

const CHUNK_COLUMNS: &str = "id, file_path, content, embedding_binary, embedding_dense, metadata";

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let metadata: String = row.get(5)?;
    let metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?;
    Ok(Chunk {
        id: row.get(0)?,
        file_path: PathBuf::from(row.get::<_, String>(1)?),
        content: row.get(2)?,
        embedding_binary: row.get(3)?,
        embedding_dense: row.get::<_, Option<Vec<u8>>>(4)?.map(|b| decode_f32s(&b)),
        metadata,
    })
}

/// Scale a vector to unit length; zero vectors are returned unchanged.
pub(crate) fn l2_normalize(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|v| v / norm).collect()
    } else {
        values.to_vec()
    }
}

/// Dot product of two equal-length vectors.
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl DirIndexStore {
    /// Store chunks, or buffer them until the bulk batch ends.
    ///
    /// Returns the number of chunks written now (0 when buffered).
    pub fn add_chunks(&self, chunks: Vec<ChunkData>) -> Result<usize> {
        {
            let mut state = self.bulk_state()?;
            if state.active {
                state.pending_chunks.extend(chunks);
                return Ok(0);
            }
        }
        let written = self.write_chunks(&chunks)?;
        self.invalidate_binary_searcher()?;
        Ok(written)
    }

    pub(super) fn write_chunks(&self, chunks: &[ChunkData]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let now = now_secs();
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO chunks (file_path, content, embedding, embedding_binary,
                     embedding_dense, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for chunk in chunks {
                    let raw = chunk.embedding.as_deref().map(encode_f32s);
                    let dense = chunk
                        .embedding
                        .as_deref()
                        .map(|e| encode_f32s(&l2_normalize(e)));
                    let binary = chunk
                        .embedding_binary
                        .clone()
                        .or_else(|| chunk.embedding.as_deref().map(pack_bits));
                    stmt.execute(params![
                        normalize_path(&chunk.file_path),
                        chunk.content,
                        raw,
                        binary,
                        dense,
                        serde_json::to_string(&chunk.metadata)?,
                        now
                    ])?;
                }
            }
            tx.commit()?;
            tracing::trace!(count = chunks.len(), "Stored chunks");
            Ok(chunks.len())
        })
    }

    /// Chunks with the given ids, in id order. Unknown ids are skipped.
    pub fn get_chunks(&self, ids: &[i64]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"
            ))?;
            let mut sorted = ids.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            let mut chunks = Vec::with_capacity(sorted.len());
            for id in sorted {
                let mut rows = stmt.query_map([id], row_to_chunk)?;
                if let Some(chunk) = rows.next() {
                    chunks.push(chunk?);
                }
            }
            Ok(chunks)
        })
    }

    /// Every chunk of one file, in insertion order.
    pub fn chunks_for_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let path_str = normalize_path(path);
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_path = ?1 ORDER BY id"
            ))?;
            let chunks = stmt
                .query_map([path_str], row_to_chunk)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(chunks)
        })
    }

    fn searcher_read(&self) -> Result<RwLockReadGuard<'_, Option<Arc<BinarySearcher>>>> {
        self.searcher
            .read()
            .map_err(|e| Error::Internal(format!("binary searcher lock poisoned: {e}")))
    }

    fn searcher_write(&self) -> Result<RwLockWriteGuard<'_, Option<Arc<BinarySearcher>>>> {
        self.searcher
            .write()
            .map_err(|e| Error::Internal(format!("binary searcher lock poisoned: {e}")))
    }

    /// The binary searcher over this store's chunks.
    ///
    /// Returns `None` when no chunk has a binary embedding.
    pub fn binary_searcher(&self) -> Result<Option<Arc<BinarySearcher>>> {
        if let Some(searcher) = self.searcher_read()?.as_ref() {
            return Ok(Some(Arc::clone(searcher)));
        }
        self.refresh_binary_searcher()
    }

    /// Rebuild the cached binary searcher from stored rows.
    ///
    /// The rebuilt searcher is cached only if no chunk change was recorded
    /// while the rows were being read.
    pub(super) fn refresh_binary_searcher(&self) -> Result<Option<Arc<BinarySearcher>>> {
        let generation = self.searcher_generation();
        let built = self.load_binary_searcher()?;
        self.cache_binary_searcher(generation, built.as_ref())?;
        Ok(built)
    }

    fn searcher_generation(&self) -> u64 {
        self.searcher_generation.load(Ordering::Acquire)
    }

    /// Build a searcher from stored rows.
    ///
    /// Rows whose width differs from the first row are skipped.
    fn load_binary_searcher(&self) -> Result<Option<Arc<BinarySearcher>>> {
        let rows: Vec<(i64, Vec<u8>)> = self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding_binary FROM chunks
                 WHERE embedding_binary IS NOT NULL AND length(embedding_binary) > 0
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let built = match rows.first() {
            None => None,
            Some((_, first)) => {
                let mut searcher = BinarySearcher::new(first.len());
                for (id, vector) in &rows {
                    if vector.len() == searcher.bytes_per_vector() {
                        searcher.add(*id, vector)?;
                    } else {
                        tracing::warn!(
                            db = %self.db_path.display(),
                            chunk_id = id,
                            bytes = vector.len(),
                            expected = searcher.bytes_per_vector(),
                            "Skipping binary embedding with mismatched width"
                        );
                    }
                }
                Some(Arc::new(searcher))
            }
        };
        Ok(built)
    }

    /// Cache `built` unless chunks changed since `generation` was read.
    fn cache_binary_searcher(
        &self,
        generation: u64,
        built: Option<&Arc<BinarySearcher>>,
    ) -> Result<bool> {
        let mut cached = self.searcher_write()?;
        if self.searcher_generation() != generation {
            tracing::trace!(db = %self.db_path.display(), "Chunks changed during rebuild, not caching");
            return Ok(false);
        }
        *cached = built.cloned();
        Ok(true)
    }

    /// Drop the cached binary searcher so the next use rebuilds it.
    pub(super) fn invalidate_binary_searcher(&self) -> Result<()> {
        let mut cached = self.searcher_write()?;
        self.searcher_generation.fetch_add(1, Ordering::AcqRel);
        *cached = None;
        Ok(())
    }

    /// Every stored dense embedding with its chunk id, in id order.
    pub fn dense_vectors(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding_dense FROM chunks
                 WHERE embedding_dense IS NOT NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, decode_f32s(&row.get::<_, Vec<u8>>(1)?)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Chunks closest to `query` by cosine similarity.
    ///
    /// Returns `(chunk_id, similarity)` pairs, best first, ties by id.
    /// Vectors whose dimension differs from the query are ignored.
    pub fn dense_search(&self, query: &[f32], top_k: usize) -> Result<Vec<(i64, f32)>> {
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let query = l2_normalize(query);
        let mut scored: Vec<(i64, f32)> = self
            .dense_vectors()?
            .into_iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (id, dot(&query, &v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Whether any chunk has a dense embedding.
    pub fn has_dense_vectors(&self) -> Result<bool> {
        self.with_connection(|conn| {
            let found: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM chunks WHERE embedding_dense IS NOT NULL)",
                [],
                |row| row.get(0),
            )?;
            Ok(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, DirIndexStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = DirIndexStore::open(&dir.path().join("_index.db")).expect("open store");
        (dir, store)
    }

    fn chunk(path: &Path, content: &str, embedding: Vec<f32>) -> ChunkData {
        let mut metadata = BTreeMap::new();
        metadata.insert("start_line".to_string(), serde_json::json!(1));
        ChunkData {
            file_path: path.to_path_buf(),
            content: content.to_string(),
            embedding: Some(embedding),
            embedding_binary: None,
            metadata,
        }
    }

    #[test]
    fn chunks_get_all_three_representations() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        let written = store
            .add_chunks(vec![chunk(&path, "fn a() {}", vec![3.0, -4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])])
            .expect("add");
        assert_eq!(written, 1);

        let chunks = store.chunks_for_file(&path).expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].embedding_binary.as_deref(), Some(&[0b1000_0001u8][..]));
        let dense = chunks[0].embedding_dense.as_ref().expect("dense");
        assert!((dense.iter().map(|v| v * v).sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(chunks[0].start_line(), Some(1));
    }

    #[test]
    fn bulk_mode_buffers_until_end() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        store.begin_bulk_insert().expect("begin");
        assert_eq!(
            store
                .add_chunks(vec![chunk(&path, "one", vec![1.0; 8])])
                .expect("add"),
            0
        );
        assert!(store.binary_searcher().expect("searcher").is_none());

        let summary = store.end_bulk_insert().expect("end");
        assert_eq!(summary.chunks_flushed, 1);
        let searcher = store.binary_searcher().expect("searcher").expect("built");
        assert_eq!(searcher.len(), 1);
    }

    #[test]
    fn searcher_is_rebuilt_after_new_chunks() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        store
            .add_chunks(vec![chunk(&path, "one", vec![1.0; 8])])
            .expect("add");
        assert_eq!(store.binary_searcher().expect("searcher").expect("built").len(), 1);

        store
            .add_chunks(vec![chunk(&path, "two", vec![-1.0; 8])])
            .expect("add");
        assert_eq!(store.binary_searcher().expect("searcher").expect("built").len(), 2);
    }

    #[test]
    fn rebuild_racing_a_write_is_not_cached() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        store
            .add_chunks(vec![chunk(&path, "one", vec![1.0; 8])])
            .expect("add");

        let generation = store.searcher_generation();
        let stale = store.load_binary_searcher().expect("load").expect("built");
        store
            .add_chunks(vec![chunk(&path, "two", vec![-1.0; 8])])
            .expect("add");

        assert!(!store.cache_binary_searcher(generation, Some(&stale)).expect("cache"));
        assert_eq!(store.binary_searcher().expect("searcher").expect("built").len(), 2);
    }

    #[test]
    fn dense_search_ranks_by_cosine() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        store
            .add_chunks(vec![
                chunk(&path, "east", vec![1.0, 0.0]),
                chunk(&path, "north", vec![0.0, 1.0]),
                chunk(&path, "northeast", vec![1.0, 1.0]),
            ])
            .expect("add");

        let hits = store.dense_search(&[0.0, 2.0], 2).expect("search");
        let ids: Vec<i64> = hits.iter().map(|h| h.0).collect();
        let chunks = store.get_chunks(&ids).expect("get");
        let mut by_id: BTreeMap<i64, String> =
            chunks.into_iter().map(|c| (c.id, c.content)).collect();
        assert_eq!(by_id.remove(&hits[0].0).as_deref(), Some("north"));
        assert_eq!(by_id.remove(&hits[1].0).as_deref(), Some("northeast"));
        assert!(store.has_dense_vectors().expect("dense check"));
    }

    #[test]
    fn reindexing_a_file_drops_its_chunks() {
        let (dir, store) = store();
        let path = dir.path().join("a.rs");
        store
            .add_chunks(vec![chunk(&path, "old", vec![1.0; 8])])
            .expect("add");
        store
            .add_file("a.rs", &path, "new", crate::types::Language::Rust, &[], &[])
            .expect("reindex");
        assert!(store.chunks_for_file(&path).expect("chunks").is_empty());
        assert!(store.binary_searcher().expect("searcher").is_none());
    }
}

//! Per-directory `SQLite` store.
//!
//! Each indexed directory owns one `_index.db` holding the files directly in
//! that directory, their symbols and relationships, the derived graph
//! neighbor closure, content chunks with embeddings, and the directory's own
//! merkle digest. Child directories are linked through the `subdirs` table so
//! a search can walk downward from any index.
//!
//! ## Module Structure
//!
//! - `pool` - Per-thread connection pool and background sweeper
//! - `schema` - Numbered schema steps
//! - `helpers` - Row conversion and encoding utilities
//! - `files` - File replacement, staleness checks, merkle digests
//! - `search` - Full-text, file, and symbol queries
//! - `graph` - Relationship lookup and neighbor closure
//! - `chunks` - Chunk storage and vector access

mod chunks;
mod files;
mod graph;
pub(crate) mod helpers;
mod pool;
mod schema;
mod search;

pub(crate) use chunks::{dot, l2_normalize};
pub use graph::NeighborSymbol;
pub use pool::{ConnectionPool, SweeperHandle, spawn_sweeper};
pub use search::FtsOptions;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rusqlite::Connection;

use crate::binary_search::BinarySearcher;
use crate::error::{Error, Result};
use crate::migrations;
use crate::registry::now_secs;
use crate::types::ChunkData;

/// Pending work accumulated while bulk mode is active.
#[derive(Default)]
struct BulkState {
    active: bool,
    pending_chunks: Vec<ChunkData>,
    graph_dirty: bool,
}

/// A child directory linked from this store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdirEntry {
    /// Directory name
    pub name: String,
    /// Path of the child's `_index.db`
    pub index_path: PathBuf,
    /// Files stored in the child index
    pub files_count: u64,
    /// Child's merkle digest at registration time
    pub merkle_root: Option<String>,
}

/// Row counts of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Rows in `files`
    pub files: usize,
    /// Rows in `symbols`
    pub symbols: usize,
    /// Rows in `code_relationships`
    pub relationships: usize,
    /// Rows in `graph_neighbors`
    pub graph_neighbors: usize,
    /// Rows in `chunks`
    pub chunks: usize,
}

/// Summary of a finished bulk batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    /// Chunks written when the batch closed
    pub chunks_flushed: usize,
    /// Neighbor rows after the closure rebuild (0 when nothing changed)
    pub graph_neighbors: usize,
}

/// Index database for one source directory.
pub struct DirIndexStore {
    db_path: PathBuf,
    pool: Arc<ConnectionPool>,
    bulk: Mutex<BulkState>,
    searcher: RwLock<Option<Arc<BinarySearcher>>>,
    /// Bumped on every chunk change; guards the searcher cache.
    searcher_generation: AtomicU64,
}

impl DirIndexStore {
    /// Open or create the store at `db_path`, applying pending schema steps.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = Arc::new(ConnectionPool::new(db_path));
        pool.with_connection(|conn| migrations::run(conn, schema::STORE_MIGRATIONS))?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            pool,
            bulk: Mutex::new(BulkState::default()),
            searcher: RwLock::new(None),
            searcher_generation: AtomicU64::new(0),
        })
    }

    /// Location of this store's database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The connection pool backing this store.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Start a background thread pruning connections of exited threads.
    pub fn spawn_sweeper(&self, interval: Duration) -> Result<SweeperHandle> {
        spawn_sweeper(&self.pool, interval)
    }

    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        self.pool.with_connection(f)
    }

    fn bulk_state(&self) -> Result<MutexGuard<'_, BulkState>> {
        self.bulk.lock().map_err(|e| {
            Error::Internal(format!(
                "bulk state mutex poisoned (a thread panicked while holding the lock): {e}"
            ))
        })
    }

    /// Defer vector-index and graph rebuilds until [`Self::end_bulk_insert`].
    pub fn begin_bulk_insert(&self) -> Result<()> {
        let mut state = self.bulk_state()?;
        if !state.active {
            state.active = true;
            tracing::trace!(db = %self.db_path.display(), "Bulk insert started");
        }
        Ok(())
    }

    /// Whether bulk mode is active.
    pub fn is_bulk_mode(&self) -> Result<bool> {
        Ok(self.bulk_state()?.active)
    }

    /// Flush buffered chunks and rebuild derived structures once.
    ///
    /// The buffer is taken and reset under the bulk lock, so concurrent
    /// writers never see a partially flushed batch.
    pub fn end_bulk_insert(&self) -> Result<BulkSummary> {
        let (pending, graph_dirty) = {
            let mut state = self.bulk_state()?;
            if !state.active {
                return Ok(BulkSummary::default());
            }
            let taken = std::mem::take(&mut *state);
            (taken.pending_chunks, taken.graph_dirty)
        };

        let chunks_flushed = self.write_chunks(&pending)?;
        if chunks_flushed > 0 {
            self.invalidate_binary_searcher()?;
        }
        let graph_neighbors = if graph_dirty {
            self.rebuild_graph_neighbors()?
        } else {
            0
        };
        self.refresh_binary_searcher()?;

        tracing::debug!(
            db = %self.db_path.display(),
            chunks_flushed,
            graph_neighbors,
            "Bulk insert finished"
        );
        Ok(BulkSummary {
            chunks_flushed,
            graph_neighbors,
        })
    }

    /// Link a child directory's index.
    pub fn register_subdir(
        &self,
        name: &str,
        index_path: &Path,
        files_count: u64,
        merkle_root: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO subdirs (name, index_path, files_count, merkle_root, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                     index_path = excluded.index_path,
                     files_count = excluded.files_count,
                     merkle_root = excluded.merkle_root,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    name,
                    helpers::normalize_path(index_path),
                    i64::try_from(files_count).unwrap_or(i64::MAX),
                    merkle_root,
                    now_secs()
                ],
            )?;
            Ok(())
        })
    }

    /// Unlink a child directory.
    pub fn remove_subdir(&self, name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM subdirs WHERE name = ?1", [name])? > 0)
        })
    }

    /// Child directories, ordered by name.
    pub fn list_subdirs(&self) -> Result<Vec<SubdirEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, index_path, files_count, merkle_root FROM subdirs ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SubdirEntry {
                        name: row.get(0)?,
                        index_path: PathBuf::from(row.get::<_, String>(1)?),
                        files_count: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        merkle_root: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Row counts.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_connection(|conn| {
            let count = |table: &str| -> Result<usize> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
                Ok(usize::try_from(n).unwrap_or(0))
            };
            Ok(StoreStats {
                files: count("files")?,
                symbols: count("symbols")?,
                relationships: count("code_relationships")?,
                graph_neighbors: count("graph_neighbors")?,
                chunks: count("chunks")?,
            })
        })
    }
}

impl std::fmt::Debug for DirIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirIndexStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_schema() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = DirIndexStore::open(&dir.path().join("nested/_index.db")).expect("open");

        let version = store
            .with_connection(|conn| migrations::current_version(conn))
            .expect("version");
        assert_eq!(version, 4);
        assert_eq!(store.stats().expect("stats"), StoreStats::default());
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("_index.db");
        {
            let store = DirIndexStore::open(&path).expect("open");
            store
                .register_subdir("src", Path::new("/idx/src/_index.db"), 2, Some("abc"))
                .expect("register subdir");
        }
        let store = DirIndexStore::open(&path).expect("reopen");
        let subdirs = store.list_subdirs().expect("list");
        assert_eq!(subdirs.len(), 1);
        assert_eq!(subdirs[0].name, "src");
        assert_eq!(subdirs[0].merkle_root.as_deref(), Some("abc"));
    }

    #[test]
    fn end_bulk_without_begin_is_a_no_op() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = DirIndexStore::open(&dir.path().join("_index.db")).expect("open");
        assert_eq!(store.end_bulk_insert().expect("end"), BulkSummary::default());
        assert!(!store.is_bulk_mode().expect("mode"));
    }
}

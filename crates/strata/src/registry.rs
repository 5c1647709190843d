//! Durable project registry.
//!
//! One `registry.db` per index root maps project source roots to their index
//! roots and records every indexed directory. Source paths are stored twice:
//! as registered (for display) and as a canonical comparison key computed by
//! [`PathMapper::key`]. Lookups compare keys by plain equality.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::migrations::{self, Migration};
use crate::path_mapper::{PathMapper, canonicalize_path};
use crate::types::{DirMapping, ProjectId, ProjectInfo};

/// File name of the registry database inside the index root.
pub const REGISTRY_DB_NAME: &str = "registry.db";

const PROJECT_COLUMNS: &str =
    "id, source_root, index_root, created_at, last_indexed, total_files, total_dirs";

const MAPPING_COLUMNS: &str =
    "id, project_id, source_path, index_path, depth, files_count, last_updated";

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    source_root TEXT NOT NULL,
    source_key TEXT NOT NULL UNIQUE,
    index_root TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_indexed INTEGER,
    total_files INTEGER NOT NULL DEFAULT 0,
    total_dirs INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dir_mapping (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    source_path TEXT NOT NULL,
    source_key TEXT NOT NULL UNIQUE,
    index_path TEXT NOT NULL,
    depth INTEGER NOT NULL,
    files_count INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dir_mapping_project ON dir_mapping(project_id);
",
    )
}

const REGISTRY_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "projects and directory mappings",
    apply: create_tables,
}];

/// `SQLite`-backed project registry.
pub struct RegistryStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    mapper: PathMapper,
}

impl RegistryStore {
    /// Open or create the registry at `{mapper.index_root()}/registry.db`.
    pub fn open(mapper: PathMapper) -> Result<Self> {
        let path = mapper.index_root().join(REGISTRY_DB_NAME);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrations::run(&mut conn, REGISTRY_MIGRATIONS)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            mapper,
        })
    }

    /// Location of the registry database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapper used for keys and index locations.
    #[must_use]
    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            Error::Internal(format!(
                "registry connection mutex poisoned (a thread panicked while holding the lock): {e}"
            ))
        })
    }

    /// Register a project, or return the existing entry for the same root.
    ///
    /// The project root is also recorded as its own directory at depth 0.
    pub fn register_project(&self, source_root: &Path, index_root: &Path) -> Result<ProjectInfo> {
        let source_root = canonicalize_path(source_root);
        let key = self.mapper.key(&source_root);
        let now = now_secs();

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO projects (source_root, source_key, index_root, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_key) DO UPDATE SET index_root = excluded.index_root",
            params![
                path_text(&source_root),
                key,
                path_text(index_root),
                now
            ],
        )?;
        let project = tx.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE source_key = ?1"),
            [&key],
            row_to_project,
        )?;
        let root_db = self.mapper.source_to_index_db(&source_root);
        upsert_mapping(&tx, project.id, &source_root, &key, &root_db, 0, now)?;
        tx.commit()?;

        tracing::info!(
            project_id = %project.id,
            source_root = %source_root.display(),
            "Registered project"
        );
        Ok(project)
    }

    /// Remove a project and all of its directory mappings.
    ///
    /// Returns `false` if no project is registered at `source_root`.
    pub fn unregister_project(&self, source_root: &Path) -> Result<bool> {
        let key = self.mapper.key(source_root);
        let conn = self.connection()?;
        let removed = conn.execute("DELETE FROM projects WHERE source_key = ?1", [&key])?;
        if removed > 0 {
            tracing::info!(source_root = %source_root.display(), "Unregistered project");
        }
        Ok(removed > 0)
    }

    /// Record an indexed directory.
    ///
    /// Only the project root may have depth 0, and every directory must lie
    /// under its project root.
    pub fn register_dir(
        &self,
        project_id: ProjectId,
        source_path: &Path,
        index_path: &Path,
        depth: u32,
    ) -> Result<DirMapping> {
        let source_path = canonicalize_path(source_path);
        let key = self.mapper.key(&source_path);

        let mut conn = self.connection()?;
        let project_key: String = conn
            .query_row(
                "SELECT source_key FROM projects WHERE id = ?1",
                [project_id.as_i64()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;

        let is_root = key == project_key;
        if is_root != (depth == 0) {
            return Err(Error::InvalidInput(format!(
                "{} registered at depth {depth}; only the project root has depth 0",
                source_path.display()
            )));
        }
        if !is_root && !key.starts_with(&format!("{}/", project_key.trim_end_matches('/'))) {
            return Err(Error::InvalidInput(format!(
                "{} is outside project {project_id}",
                source_path.display()
            )));
        }

        let tx = conn.transaction()?;
        let mapping = upsert_mapping(&tx, project_id, &source_path, &key, index_path, depth, now_secs())?;
        tx.commit()?;
        Ok(mapping)
    }

    /// Exact lookup of a registered directory.
    pub fn find_by_source_path(&self, path: &Path) -> Result<Option<DirMapping>> {
        let key = self.mapper.key(path);
        let conn = self.connection()?;
        find_by_key(&conn, &key)
    }

    /// Deepest registered directory that is `path` or one of its ancestors.
    pub fn find_nearest_index(&self, path: &Path) -> Result<Option<DirMapping>> {
        // Ancestors of a canonical path are canonical; compare them lexically.
        let canonical = canonicalize_path(path);
        let conn = self.connection()?;
        for ancestor in canonical.ancestors() {
            let key = self.mapper.canonical_key(ancestor);
            if let Some(mapping) = find_by_key(&conn, &key)? {
                tracing::trace!(
                    path = %path.display(),
                    found = %mapping.source_path.display(),
                    "Resolved nearest index"
                );
                return Ok(Some(mapping));
            }
        }
        Ok(None)
    }

    /// Look up a project by id.
    pub fn get_project(&self, id: ProjectId) -> Result<Option<ProjectInfo>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [id.as_i64()],
            row_to_project,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look up a project by its source root.
    pub fn find_project(&self, source_root: &Path) -> Result<Option<ProjectInfo>> {
        let key = self.mapper.key(source_root);
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE source_key = ?1"),
            [&key],
            row_to_project,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All registered projects, ordered by source root.
    pub fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY source_root"
        ))?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    /// Every directory of a project, shallowest first.
    pub fn get_project_dirs(&self, project_id: ProjectId) -> Result<Vec<DirMapping>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM dir_mapping WHERE project_id = ?1
             ORDER BY depth, source_path"
        ))?;
        let dirs = stmt
            .query_map([project_id.as_i64()], row_to_mapping)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dirs)
    }

    /// Record the outcome of an indexing run.
    pub fn update_project_stats(
        &self,
        project_id: ProjectId,
        total_files: u64,
        total_dirs: u64,
    ) -> Result<()> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE projects SET total_files = ?2, total_dirs = ?3, last_indexed = ?4 WHERE id = ?1",
            params![
                project_id.as_i64(),
                to_sql_count(total_files),
                to_sql_count(total_dirs),
                now_secs()
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("project {project_id}")));
        }
        Ok(())
    }

    /// Record how many files a directory's index holds.
    pub fn update_dir_stats(&self, source_path: &Path, files_count: u64) -> Result<()> {
        let key = self.mapper.key(source_path);
        let conn = self.connection()?;
        conn.execute(
            "UPDATE dir_mapping SET files_count = ?2, last_updated = ?3 WHERE source_key = ?1",
            params![key, to_sql_count(files_count), now_secs()],
        )?;
        Ok(())
    }

    /// Remove a directory mapping (the directory no longer exists).
    pub fn unregister_dir(&self, source_path: &Path) -> Result<bool> {
        let key = self.mapper.key(source_path);
        let conn = self.connection()?;
        let removed = conn.execute(
            "DELETE FROM dir_mapping WHERE source_key = ?1 AND depth > 0",
            [&key],
        )?;
        Ok(removed > 0)
    }
}

fn upsert_mapping(
    conn: &Connection,
    project_id: ProjectId,
    source_path: &Path,
    key: &str,
    index_path: &Path,
    depth: u32,
    now: i64,
) -> Result<DirMapping> {
    conn.execute(
        "INSERT INTO dir_mapping (project_id, source_path, source_key, index_path, depth, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_key) DO UPDATE SET
             project_id = excluded.project_id,
             index_path = excluded.index_path,
             depth = excluded.depth,
             last_updated = excluded.last_updated",
        params![
            project_id.as_i64(),
            path_text(source_path),
            key,
            path_text(index_path),
            depth,
            now
        ],
    )?;
    find_by_key(conn, key)?
        .ok_or_else(|| Error::Internal(format!("mapping for {key} vanished after upsert")))
}

fn find_by_key(conn: &Connection, key: &str) -> Result<Option<DirMapping>> {
    conn.query_row(
        &format!("SELECT {MAPPING_COLUMNS} FROM dir_mapping WHERE source_key = ?1"),
        [key],
        row_to_mapping,
    )
    .optional()
    .map_err(Into::into)
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<ProjectInfo> {
    Ok(ProjectInfo {
        id: ProjectId(row.get(0)?),
        source_root: PathBuf::from(row.get::<_, String>(1)?),
        index_root: PathBuf::from(row.get::<_, String>(2)?),
        created_at: row.get(3)?,
        last_indexed: row.get(4)?,
        total_files: from_sql_count(row.get(5)?),
        total_dirs: from_sql_count(row.get(6)?),
    })
}

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<DirMapping> {
    Ok(DirMapping {
        id: row.get(0)?,
        project_id: ProjectId(row.get(1)?),
        source_path: PathBuf::from(row.get::<_, String>(2)?),
        index_path: PathBuf::from(row.get::<_, String>(3)?),
        depth: row.get(4)?,
        files_count: from_sql_count(row.get(5)?),
        last_updated: row.get(6)?,
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Current unix time in seconds (0 if the clock is before the epoch).
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

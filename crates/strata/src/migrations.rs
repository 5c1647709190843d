//! Numbered schema upgrade steps.
//!
//! Each database file records its schema version in `PRAGMA user_version`.
//! [`run`] applies every step with a higher version, in order, inside one
//! transaction together with the version bump. A failing step rolls the whole
//! batch back and surfaces [`Error::Migration`]; a half-upgraded file is
//! never left behind.
//!
//! Steps must be idempotent (`IF NOT EXISTS`, [`column_exists`] guards) and
//! must not open or close transactions themselves.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Signature of a single upgrade step.
pub type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

/// One schema upgrade step.
#[derive(Clone, Copy)]
pub struct Migration {
    /// Version reached after this step.
    pub version: u32,
    /// Short description, used in errors and logs.
    pub name: &'static str,
    /// The DDL to run.
    pub apply: MigrationFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Schema version stored in the file.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version)
        .map_err(|_| Error::Internal(format!("negative schema version {version}")))
}

/// Apply all pending steps and return the resulting version.
///
/// `migrations` must be sorted by strictly increasing version.
pub fn run(conn: &mut Connection, migrations: &[Migration]) -> Result<u32> {
    if migrations.windows(2).any(|w| w[0].version >= w[1].version) {
        return Err(Error::Internal(
            "migrations must have strictly increasing versions".to_string(),
        ));
    }

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    let Some(last) = pending.last() else {
        return Ok(current);
    };
    let target = last.version;

    let tx = conn.transaction()?;
    for migration in &pending {
        tracing::debug!(
            version = migration.version,
            name = migration.name,
            "Applying schema migration"
        );
        (migration.apply)(&tx).map_err(|source| {
            tracing::error!(
                version = migration.version,
                name = migration.name,
                error = %source,
                "Schema migration failed; rolling back"
            );
            Error::Migration {
                version: migration.version,
                name: migration.name,
                source,
            }
        })?;
    }
    tx.pragma_update(None, "user_version", target)?;
    tx.commit()?;

    tracing::debug!(from = current, to = target, "Schema upgraded");
    Ok(target)
}

/// Whether `table` has a column named `column`.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Add a column unless it already exists.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    }
    Ok(())
}
